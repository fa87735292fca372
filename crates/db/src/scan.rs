//! Filtered, projected scans over the frames table.
//!
//! The blob-safe projection rule lives here: any scan carrying a filter
//! excludes blob columns from its projection. Callers that need a blob fetch
//! it through `Dataset::fetch_blob`; asking a filtered scan for a blob column
//! is a programmer error and fails fast.

use arrow_array::RecordBatch;
use frame_core::{Filter, Record};
use futures::TryStreamExt;
use lancedb::arrow::SendableRecordBatchStream;
use lancedb::query::{ExecutableQuery, QueryBase, Select};

use crate::convert::batch_to_records;
use crate::dataset::{Dataset, DbError, Result};
use crate::schema::{BLOB_COLUMNS, blob_safe_columns};

/// Options for a scan over the frames table
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
  pub filter: Option<Filter>,
  /// Explicit projection; defaults to the blob-safe column set
  pub columns: Option<Vec<String>>,
  pub limit: Option<usize>,
  pub offset: Option<usize>,
}

impl ScanOptions {
  pub fn filtered(filter: Filter) -> Self {
    Self {
      filter: Some(filter),
      ..Default::default()
    }
  }
}

/// Sort specification for `list`
#[derive(Debug, Clone)]
pub struct SortSpec {
  pub column: String,
  pub ascending: bool,
}

impl Dataset {
  /// Stream batches from the table, applying the blob-safe projection rule.
  pub async fn scanner(&self, opts: &ScanOptions) -> Result<SendableRecordBatchStream> {
    let projection = self.resolve_projection(opts)?;

    let mut query = self.table().query().select(Select::Columns(projection));
    if let Some(filter) = &opts.filter {
      query = query.only_if(filter.as_sql().to_string());
    }
    if let Some(limit) = opts.limit {
      query = query.limit(limit);
    }
    if let Some(offset) = opts.offset {
      query = query.offset(offset);
    }

    Ok(query.execute().await?)
  }

  /// Collect a scan into records
  pub async fn scan_records(&self, opts: &ScanOptions) -> Result<Vec<Record>> {
    let batches: Vec<RecordBatch> = self.scanner(opts).await?.try_collect().await?;
    let mut records = Vec::new();
    for batch in &batches {
      records.extend(batch_to_records(batch)?);
    }
    Ok(records)
  }

  /// Convenience listing with optional in-memory sort.
  ///
  /// Without a sort, limit and offset push down to the storage layer; with
  /// one, the matching rows are collected first and sliced after sorting.
  pub async fn list(
    &self,
    filter: Option<&Filter>,
    limit: Option<usize>,
    offset: Option<usize>,
    sort: Option<&SortSpec>,
  ) -> Result<Vec<Record>> {
    let Some(sort) = sort else {
      return self
        .scan_records(&ScanOptions {
          filter: filter.cloned(),
          columns: None,
          limit,
          offset,
        })
        .await;
    };

    let mut records = self
      .scan_records(&ScanOptions {
        filter: filter.cloned(),
        ..Default::default()
      })
      .await?;
    sort_records(&mut records, sort)?;

    let start = offset.unwrap_or(0).min(records.len());
    let end = match limit {
      Some(limit) => (start + limit).min(records.len()),
      None => records.len(),
    };
    Ok(records[start..end].to_vec())
  }

  fn resolve_projection(&self, opts: &ScanOptions) -> Result<Vec<String>> {
    match &opts.columns {
      Some(columns) => {
        if opts.filter.is_some()
          && let Some(blob) = columns.iter().find(|c| BLOB_COLUMNS.contains(&c.as_str()))
        {
          return Err(DbError::BlobScan(format!(
            "column {} cannot be projected in a filtered scan; use fetch_blob",
            blob
          )));
        }
        Ok(columns.clone())
      }
      None => Ok(blob_safe_columns(self.vector_dim)),
    }
  }
}

fn sort_records(records: &mut [Record], sort: &SortSpec) -> Result<()> {
  match sort.column.as_str() {
    "uuid" => records.sort_by(|a, b| a.uuid.cmp(&b.uuid)),
    "title" => records.sort_by(|a, b| a.title.cmp(&b.title)),
    "created_at" => records.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
    "updated_at" => records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at)),
    "position" => records.sort_by_key(|r| r.position.unwrap_or(i32::MAX)),
    other => {
      return Err(DbError::SchemaMismatch(format!("cannot sort by column {}", other)));
    }
  }
  if !sort.ascending {
    records.reverse();
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util::create_test_dataset;

  fn test_uuid(n: u32) -> String {
    format!("00000000-0000-4000-8000-{:012}", n)
  }

  async fn seeded() -> (tempfile::TempDir, Dataset) {
    let (dir, dataset) = create_test_dataset(4).await;
    let mut with_blob = Record::new("T").with_uuid(test_uuid(1)).with_text("first");
    with_blob.raw_data = Some(vec![1, 2, 3]);
    with_blob.raw_data_type = Some("image/png".to_string());
    let plain = Record::new("T").with_uuid(test_uuid(2)).with_text("second");
    dataset.add_many(&[with_blob, plain], 10).await.unwrap();
    (dir, dataset)
  }

  #[tokio::test]
  async fn test_filtered_scan_elides_blob() {
    let (_dir, dataset) = seeded().await;

    let filter = Filter::parse("title = 'T'").unwrap();
    let records = dataset.scan_records(&ScanOptions::filtered(filter)).await.unwrap();

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.raw_data.is_none()));
    // Blob still reachable through the dedicated path
    assert_eq!(dataset.fetch_blob(&test_uuid(1)).await.unwrap(), Some(vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_filtered_scan_rejects_blob_projection() {
    let (_dir, dataset) = seeded().await;

    let opts = ScanOptions {
      filter: Some(Filter::parse("title = 'T'").unwrap()),
      columns: Some(vec!["uuid".to_string(), "raw_data".to_string()]),
      ..Default::default()
    };
    let err = dataset.scanner(&opts).await.unwrap_err();
    assert!(matches!(err, DbError::BlobScan(_)));
  }

  #[tokio::test]
  async fn test_scan_limit_offset() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let records: Vec<Record> = (0..5)
      .map(|i| Record::new(format!("R{}", i)).with_uuid(test_uuid(i)))
      .collect();
    dataset.add_many(&records, 10).await.unwrap();

    let page = dataset.list(None, Some(2), Some(1), None).await.unwrap();
    assert_eq!(page.len(), 2);
  }

  #[tokio::test]
  async fn test_list_sorted_by_title_desc() {
    let (_dir, dataset) = create_test_dataset(4).await;
    for (i, title) in ["b", "a", "c"].iter().enumerate() {
      dataset
        .add(&Record::new(*title).with_uuid(test_uuid(i as u32)))
        .await
        .unwrap();
    }

    let sort = SortSpec {
      column: "title".to_string(),
      ascending: false,
    };
    let records = dataset.list(None, None, None, Some(&sort)).await.unwrap();
    let titles: Vec<&str> = records.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, vec!["c", "b", "a"]);
  }

  #[tokio::test]
  async fn test_list_sort_unknown_column() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let sort = SortSpec {
      column: "salience".to_string(),
      ascending: true,
    };
    assert!(dataset.list(None, None, None, Some(&sort)).await.is_err());
  }

  #[tokio::test]
  async fn test_list_filter_matches() {
    let (_dir, dataset) = seeded().await;
    let filter = Filter::parse(&format!("uuid = '{}'", test_uuid(2))).unwrap();
    let records = dataset.list(Some(&filter), None, None, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text_content.as_deref(), Some("second"));
  }
}
