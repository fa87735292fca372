//! Dataset statistics, compaction, version pruning, and index lifecycle.

use lancedb::index::Index;
use lancedb::index::scalar::{BTreeIndexBuilder, BitmapIndexBuilder, FtsIndexBuilder};
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::table::{CompactionOptions, OptimizeAction, OptimizeOptions};
use serde::Serialize;
use tracing::info;

use crate::dataset::{Dataset, Metric, Result};

/// One index over the frames table
#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
  pub name: String,
  pub index_type: String,
  pub columns: Vec<String>,
}

/// Snapshot of dataset shape and health
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
  pub version: u64,
  pub num_rows: usize,
  pub num_fragments: usize,
  pub size_bytes: usize,
  pub indices: Vec<IndexInfo>,
}

/// Parameters for the IVF/PQ vector index
#[derive(Debug, Clone)]
pub struct VectorIndexParams {
  pub partitions: u32,
  pub sub_quantizers: u32,
  pub metric: Metric,
}

impl Default for VectorIndexParams {
  fn default() -> Self {
    Self {
      partitions: 256,
      sub_quantizers: 16,
      metric: Metric::Cosine,
    }
  }
}

/// Scalar index flavors: B-tree for high-cardinality columns, bitmap for
/// low-cardinality ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarIndexKind {
  BTree,
  Bitmap,
}

impl std::str::FromStr for ScalarIndexKind {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "btree" => Ok(ScalarIndexKind::BTree),
      "bitmap" => Ok(ScalarIndexKind::Bitmap),
      _ => Err(format!("Unknown scalar index kind: {}", s)),
    }
  }
}

impl Dataset {
  /// Current version, row count, fragment shape, and indices
  pub async fn stats(&self) -> Result<DatasetStats> {
    let version = self.version().await?;
    let table_stats = self.table().stats().await?;
    let indices = self.list_index_info().await?;

    Ok(DatasetStats {
      version,
      num_rows: table_stats.num_rows,
      num_fragments: table_stats.fragment_stats.num_fragments,
      size_bytes: table_stats.total_bytes,
      indices,
    })
  }

  /// Rewrite small fragments into larger ones
  pub async fn compact(&self, target_rows_per_fragment: usize) -> Result<()> {
    self.ensure_writable()?;
    info!("Compacting {} (target {} rows/fragment)", self.uri, target_rows_per_fragment);
    self
      .table()
      .optimize(OptimizeAction::Compact {
        options: CompactionOptions {
          target_rows_per_fragment,
          ..Default::default()
        },
        remap_options: None,
      })
      .await?;
    Ok(())
  }

  /// Retire historical versions older than the cutoff
  pub async fn cleanup_old_versions(&self, older_than: chrono::Duration) -> Result<()> {
    self.ensure_writable()?;
    self
      .table()
      .optimize(OptimizeAction::Prune {
        older_than: Some(older_than),
        delete_unverified: None,
        error_if_tagged_old_versions: Some(false),
      })
      .await?;
    Ok(())
  }

  /// Bring every index up to date with recent appends
  pub async fn optimize_indices(&self) -> Result<()> {
    self.ensure_writable()?;
    self.table().optimize(OptimizeAction::Index(OptimizeOptions::default())).await?;
    Ok(())
  }

  /// Create the IVF/PQ vector index
  pub async fn create_vector_index(&self, params: &VectorIndexParams) -> Result<()> {
    self.ensure_writable()?;
    info!(
      "Creating vector index on {} ({} partitions, {} sub-quantizers, {})",
      self.uri,
      params.partitions,
      params.sub_quantizers,
      params.metric.as_str()
    );
    let builder = IvfPqIndexBuilder::default()
      .distance_type(params.metric.into())
      .num_partitions(params.partitions)
      .num_sub_vectors(params.sub_quantizers);
    self
      .table()
      .create_index(&["vector"], Index::IvfPq(builder))
      .execute()
      .await?;
    Ok(())
  }

  /// Create a scalar index on one column
  pub async fn create_scalar_index(&self, column: &str, kind: ScalarIndexKind) -> Result<()> {
    self.ensure_writable()?;
    let index = match kind {
      ScalarIndexKind::BTree => Index::BTree(BTreeIndexBuilder::default()),
      ScalarIndexKind::Bitmap => Index::Bitmap(BitmapIndexBuilder::default()),
    };
    self.table().create_index(&[column], index).execute().await?;
    Ok(())
  }

  /// Create inverted full-text indices over the given text columns
  pub async fn create_fts_index(&self, columns: &[&str]) -> Result<()> {
    self.ensure_writable()?;
    for column in columns {
      self
        .table()
        .create_index(&[*column], Index::FTS(FtsIndexBuilder::default()))
        .execute()
        .await?;
    }
    Ok(())
  }

  /// Whether any full-text index exists
  pub async fn has_fts_index(&self) -> Result<bool> {
    let indices = self.table().list_indices().await?;
    Ok(indices.iter().any(|i| i.index_type == lancedb::index::IndexType::FTS))
  }

  pub(crate) async fn list_index_info(&self) -> Result<Vec<IndexInfo>> {
    let indices = self.table().list_indices().await?;
    Ok(
      indices
        .into_iter()
        .map(|i| IndexInfo {
          name: i.name,
          index_type: format!("{:?}", i.index_type),
          columns: i.columns,
        })
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util::create_test_dataset;
  use frame_core::Record;

  fn test_uuid(n: u32) -> String {
    format!("00000000-0000-4000-8000-{:012}", n)
  }

  #[tokio::test]
  async fn test_stats_shape() {
    let (_dir, dataset) = create_test_dataset(4).await;
    dataset.add(&Record::new("A").with_uuid(test_uuid(1))).await.unwrap();

    let stats = dataset.stats().await.unwrap();
    assert_eq!(stats.num_rows, 1);
    assert!(stats.version >= 1);
  }

  #[tokio::test]
  async fn test_stats_version_monotonic() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let before = dataset.stats().await.unwrap().version;
    dataset.add(&Record::new("A").with_uuid(test_uuid(1))).await.unwrap();
    let after = dataset.stats().await.unwrap().version;
    assert!(after > before);
  }

  #[tokio::test]
  async fn test_scalar_index_lifecycle() {
    let (_dir, dataset) = create_test_dataset(4).await;
    for i in 0..20 {
      dataset
        .add(&Record::new(format!("R{}", i)).with_uuid(test_uuid(i)))
        .await
        .unwrap();
    }

    dataset.create_scalar_index("record_type", ScalarIndexKind::Bitmap).await.unwrap();
    let stats = dataset.stats().await.unwrap();
    assert!(!stats.indices.is_empty());
  }

  #[tokio::test]
  async fn test_fts_index_detection() {
    let (_dir, dataset) = create_test_dataset(4).await;
    dataset
      .add(&Record::new("hello").with_uuid(test_uuid(1)).with_text("hello world"))
      .await
      .unwrap();

    assert!(!dataset.has_fts_index().await.unwrap());
    dataset.create_fts_index(&["text_content"]).await.unwrap();
    assert!(dataset.has_fts_index().await.unwrap());
  }

  #[tokio::test]
  async fn test_compact_and_cleanup() {
    let (_dir, dataset) = create_test_dataset(4).await;
    for i in 0..10 {
      dataset
        .add(&Record::new(format!("R{}", i)).with_uuid(test_uuid(i)))
        .await
        .unwrap();
    }

    dataset.compact(1024).await.unwrap();
    dataset.cleanup_old_versions(chrono::Duration::zero()).await.unwrap();
    assert_eq!(dataset.count().await.unwrap(), 10);
  }

  #[test]
  fn test_scalar_index_kind_parse() {
    assert_eq!("btree".parse::<ScalarIndexKind>().unwrap(), ScalarIndexKind::BTree);
    assert_eq!("Bitmap".parse::<ScalarIndexKind>().unwrap(), ScalarIndexKind::Bitmap);
    assert!("inverted".parse::<ScalarIndexKind>().is_err());
  }
}
