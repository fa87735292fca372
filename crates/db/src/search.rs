//! Text, vector, and hybrid search over the frames table.
//!
//! All three modes compose with the restricted filter grammar and return
//! deterministically ordered hits (ties broken by uuid).

use arrow_array::{Array, Float32Array, RecordBatch};
use frame_core::{Filter, Record};
use futures::TryStreamExt;
use lancedb::index::scalar::FullTextSearchQuery;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::convert::batch_to_record;
use crate::dataset::{Dataset, DbError, Result};
use crate::schema::{FTS_COLUMNS, blob_safe_columns};

/// Reciprocal-rank-fusion constant
pub const RRF_K: usize = 60;

/// Vector search against fewer rows than this returns empty with a warning.
/// Building or probing an ANN structure over a near-empty table is a known
/// degenerate failure mode; the limitation is documented, not silent.
pub const MIN_ANN_ROWS: usize = 10;

/// One search result
#[derive(Debug, Clone)]
pub struct SearchHit {
  pub record: Record,
  pub score: f32,
}

impl Dataset {
  /// Full-text search over the FTS-indexed text columns.
  ///
  /// With `auto_index`, a missing FTS index is created on first use; on a
  /// read-only (checked-out) handle that is an error instead.
  pub async fn search_text(
    &self,
    query: &str,
    limit: usize,
    filter: Option<&Filter>,
    auto_index: bool,
  ) -> Result<Vec<SearchHit>> {
    if !self.has_fts_index().await? {
      if !auto_index {
        return Err(DbError::SchemaMismatch(
          "no full-text index; create one or pass auto_index".to_string(),
        ));
      }
      if self.is_read_only() {
        return Err(DbError::ReadOnly(format!(
          "{}: cannot auto-create an FTS index on a checked-out version",
          self.uri
        )));
      }
      debug!("Creating FTS index on first text search");
      self.create_fts_index(FTS_COLUMNS).await?;
    }

    let mut q = self
      .table()
      .query()
      .full_text_search(FullTextSearchQuery::new(query.to_string()))
      .select(Select::Columns(blob_safe_columns(self.vector_dim)))
      .limit(limit);
    if let Some(filter) = filter {
      q = q.only_if(filter.as_sql().to_string());
    }

    let batches: Vec<RecordBatch> = q.execute().await?.try_collect().await?;
    let mut hits = collect_hits(&batches, "_score")?;
    // BM25-like scores: higher is better
    hits.sort_by(|a, b| {
      b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.record.uuid.cmp(&b.record.uuid))
    });
    Ok(hits)
  }

  /// k-NN vector search by the dataset's metric. Falls back to a flat scan
  /// when no vector index exists.
  pub async fn search_vector(&self, query: &[f32], k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>> {
    if query.len() != self.vector_dim {
      return Err(DbError::DimensionMismatch {
        expected: self.vector_dim,
        actual: query.len(),
      });
    }

    let rows = self.count().await?;
    if rows < MIN_ANN_ROWS {
      warn!(
        "Vector search on {} rows (< {}); returning empty result to avoid degenerate index behavior",
        rows, MIN_ANN_ROWS
      );
      return Ok(Vec::new());
    }

    let mut q = self
      .table()
      .vector_search(query.to_vec())?
      .distance_type(self.metric.into())
      .select(Select::Columns(blob_safe_columns(self.vector_dim)))
      .limit(k);
    if let Some(filter) = filter {
      q = q.only_if(filter.as_sql().to_string());
    }

    let batches: Vec<RecordBatch> = q.execute().await?.try_collect().await?;
    let mut hits = collect_distance_hits(&batches)?;
    // Distances: lower is better; stored score is a similarity
    hits.sort_by(|a, b| {
      b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.record.uuid.cmp(&b.record.uuid))
    });
    Ok(hits)
  }

  /// Hybrid search: text and vector rankers run in parallel and fuse by
  /// reciprocal rank, `score(r) = Σ 1 / (60 + rank_i(r))`.
  pub async fn search_hybrid(
    &self,
    query: &str,
    query_vector: &[f32],
    limit: usize,
    filter: Option<&Filter>,
    auto_index: bool,
  ) -> Result<Vec<SearchHit>> {
    let (text, vector) = tokio::join!(
      self.search_text(query, limit, filter, auto_index),
      self.search_vector(query_vector, limit, filter),
    );
    let text = text?;
    let vector = vector?;

    let rankings: Vec<Vec<String>> = vec![
      text.iter().map(|h| h.record.uuid.clone()).collect(),
      vector.iter().map(|h| h.record.uuid.clone()).collect(),
    ];
    let fused = rrf_fuse(&rankings, RRF_K);

    let mut by_uuid: HashMap<String, Record> = HashMap::new();
    for hit in text.into_iter().chain(vector) {
      by_uuid.entry(hit.record.uuid.clone()).or_insert(hit.record);
    }

    let mut hits: Vec<SearchHit> = fused
      .into_iter()
      .filter_map(|(uuid, score)| by_uuid.remove(&uuid).map(|record| SearchHit { record, score }))
      .collect();
    hits.sort_by(|a, b| {
      b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.record.uuid.cmp(&b.record.uuid))
    });
    hits.truncate(limit);
    Ok(hits)
  }
}

/// Fuse rankings by reciprocal rank. Ranks are 1-based; an item absent from a
/// ranking contributes nothing for that ranker.
pub fn rrf_fuse(rankings: &[Vec<String>], k: usize) -> Vec<(String, f32)> {
  let mut scores: HashMap<String, f32> = HashMap::new();
  for ranking in rankings {
    for (rank, uuid) in ranking.iter().enumerate() {
      *scores.entry(uuid.clone()).or_insert(0.0) += 1.0 / (k + rank + 1) as f32;
    }
  }
  let mut fused: Vec<(String, f32)> = scores.into_iter().collect();
  fused.sort_by(|a, b| {
    b.1
      .partial_cmp(&a.1)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| a.0.cmp(&b.0))
  });
  fused
}

fn collect_hits(batches: &[RecordBatch], score_column: &str) -> Result<Vec<SearchHit>> {
  let mut hits = Vec::new();
  for batch in batches {
    let scores = batch
      .column_by_name(score_column)
      .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
    for row in 0..batch.num_rows() {
      let record = batch_to_record(batch, row)?;
      let score = scores.map(|s| if s.is_null(row) { 0.0 } else { s.value(row) }).unwrap_or(0.0);
      hits.push(SearchHit { record, score });
    }
  }
  Ok(hits)
}

fn collect_distance_hits(batches: &[RecordBatch]) -> Result<Vec<SearchHit>> {
  let mut hits = Vec::new();
  for batch in batches {
    let distances = batch
      .column_by_name("_distance")
      .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
    for row in 0..batch.num_rows() {
      let record = batch_to_record(batch, row)?;
      let distance = distances
        .map(|d| if d.is_null(row) { 0.0 } else { d.value(row) })
        .unwrap_or(0.0);
      hits.push(SearchHit {
        record,
        score: 1.0 - distance.min(1.0),
      });
    }
  }
  Ok(hits)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util::create_test_dataset;

  fn test_uuid(n: u32) -> String {
    format!("00000000-0000-4000-8000-{:012}", n)
  }

  fn unit_vector(dim: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[axis % dim] = 1.0;
    v
  }

  #[test]
  fn test_rrf_single_ranker_score() {
    let fused = rrf_fuse(&[vec!["u-1".to_string()]], RRF_K);
    assert_eq!(fused.len(), 1);
    assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-6);
  }

  #[test]
  fn test_rrf_sums_across_rankers() {
    let fused = rrf_fuse(
      &[
        vec!["a".to_string(), "b".to_string()],
        vec!["b".to_string(), "a".to_string()],
      ],
      RRF_K,
    );
    // Both items appear in both rankings at ranks {1,2}; scores tie
    let expected = 1.0 / 61.0 + 1.0 / 62.0;
    assert!((fused[0].1 - expected).abs() < 1e-6);
    assert!((fused[1].1 - expected).abs() < 1e-6);
    // Tie broken by uuid ordering
    assert_eq!(fused[0].0, "a");
    assert_eq!(fused[1].0, "b");
  }

  #[test]
  fn test_rrf_ranker_agreement_wins() {
    let fused = rrf_fuse(
      &[
        vec!["top".to_string(), "other".to_string()],
        vec!["top".to_string()],
      ],
      RRF_K,
    );
    assert_eq!(fused[0].0, "top");
  }

  #[tokio::test]
  async fn test_vector_search_degenerate_guard() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let r = Record::new("only").with_uuid(test_uuid(1)).with_vector(unit_vector(4, 0));
    dataset.add(&r).await.unwrap();

    // One row is below the ANN threshold: documented empty result
    let hits = dataset.search_vector(&unit_vector(4, 0), 5, None).await.unwrap();
    assert!(hits.is_empty());
  }

  #[tokio::test]
  async fn test_vector_search_dimension_check() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let err = dataset.search_vector(&[0.0; 3], 5, None).await.unwrap_err();
    assert!(matches!(err, DbError::DimensionMismatch { expected: 4, actual: 3 }));
  }

  #[tokio::test]
  async fn test_vector_search_flat_fallback() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let records: Vec<Record> = (0..12)
      .map(|i| {
        Record::new(format!("R{}", i))
          .with_uuid(test_uuid(i))
          .with_vector(unit_vector(4, (i % 4) as usize))
      })
      .collect();
    dataset.add_many(&records, 20).await.unwrap();

    let hits = dataset.search_vector(&unit_vector(4, 1), 3, None).await.unwrap();
    assert_eq!(hits.len(), 3);
    // Nearest neighbors share the query axis
    assert_eq!(hits[0].record.vector.as_ref().unwrap()[1], 1.0);
  }

  #[tokio::test]
  async fn test_search_determinism() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let records: Vec<Record> = (0..12)
      .map(|i| {
        Record::new("same title")
          .with_uuid(test_uuid(i))
          .with_vector(unit_vector(4, 0))
      })
      .collect();
    dataset.add_many(&records, 20).await.unwrap();

    let first = dataset.search_vector(&unit_vector(4, 0), 5, None).await.unwrap();
    let second = dataset.search_vector(&unit_vector(4, 0), 5, None).await.unwrap();
    let uuids = |hits: &[SearchHit]| hits.iter().map(|h| h.record.uuid.clone()).collect::<Vec<_>>();
    assert_eq!(uuids(&first), uuids(&second));
  }
}
