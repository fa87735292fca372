pub mod collections;
pub mod convert;
pub mod dataset;
pub mod maintenance;
pub mod records;
pub mod scan;
pub mod schema;
pub mod search;
pub mod versions;

pub use collections::CollectionStats;
pub use convert::{batch_to_record, batch_to_records, records_to_batch};
pub use dataset::{Dataset, DbError, Metric, Result, normalize_uri};
pub use maintenance::{DatasetStats, IndexInfo, ScalarIndexKind, VectorIndexParams};
pub use scan::{ScanOptions, SortSpec};
pub use schema::{BLOB_COLUMNS, FRAMES_TABLE, FTS_COLUMNS, blob_safe_columns, frames_schema};
pub use search::{MIN_ANN_ROWS, RRF_K, SearchHit, rrf_fuse};
pub use versions::VersionInfo;

#[cfg(test)]
pub(crate) mod test_util {
  use super::Dataset;
  use std::collections::HashMap;
  use tempfile::TempDir;

  pub async fn create_test_dataset(dim: usize) -> (TempDir, Dataset) {
    let dir = TempDir::new().unwrap();
    let uri = format!("file://{}/ds.lance", dir.path().display());
    let dataset = Dataset::create(&uri, dim, &HashMap::new()).await.unwrap();
    (dir, dataset)
  }
}
