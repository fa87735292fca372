//! Version history: listing, tagging, time travel.
//!
//! Every mutation advances the manifest version. Historical versions stay
//! queryable until `cleanup_old_versions` retires them; `checkout` pins a
//! handle at a snapshot and rejects writes until `checkout_latest`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dataset::{Dataset, Result};

/// One entry of the version history
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
  pub version: u64,
  pub timestamp: DateTime<Utc>,
}

impl Dataset {
  /// All queryable versions, oldest first
  pub async fn list_versions(&self) -> Result<Vec<VersionInfo>> {
    let versions = self.table().list_versions().await?;
    Ok(
      versions
        .into_iter()
        .map(|v| VersionInfo {
          version: v.version,
          timestamp: v.timestamp,
        })
        .collect(),
    )
  }

  /// Attach a label to a version (defaults to the current one). Returns the
  /// tagged version.
  pub async fn tag_version(&self, label: &str, version: Option<u64>) -> Result<u64> {
    let version = match version {
      Some(v) => v,
      None => self.version().await?,
    };
    self.table().tags().await?.create(label, version).await?;
    Ok(version)
  }

  /// Labels and the versions they point at, sorted by label
  pub async fn list_tags(&self) -> Result<Vec<(String, u64)>> {
    let tags = self.table().tags().await?.list().await?;
    let mut entries: Vec<(String, u64)> = tags.into_iter().map(|(label, tag)| (label, tag.version)).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
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
  async fn test_versions_advance_and_list() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let before = dataset.version().await.unwrap();

    dataset.add(&Record::new("A").with_uuid(test_uuid(1))).await.unwrap();
    dataset.add(&Record::new("B").with_uuid(test_uuid(2))).await.unwrap();

    let after = dataset.version().await.unwrap();
    assert!(after > before);

    let versions = dataset.list_versions().await.unwrap();
    assert!(versions.iter().any(|v| v.version == after));
  }

  #[tokio::test]
  async fn test_checkout_pins_snapshot_and_blocks_writes() {
    let (dir, dataset) = create_test_dataset(4).await;
    dataset.add(&Record::new("A").with_uuid(test_uuid(1))).await.unwrap();
    let snapshot = dataset.version().await.unwrap();
    dataset.add(&Record::new("B").with_uuid(test_uuid(2))).await.unwrap();
    assert_eq!(dataset.count().await.unwrap(), 2);
    drop(dataset);

    let uri = format!("file://{}/ds.lance", dir.path().display());
    let mut pinned = Dataset::open_at_version(&uri, snapshot, &std::collections::HashMap::new())
      .await
      .unwrap();
    assert!(pinned.is_read_only());
    assert_eq!(pinned.count().await.unwrap(), 1);
    assert!(pinned.add(&Record::new("C").with_uuid(test_uuid(3))).await.is_err());

    pinned.checkout_latest().await.unwrap();
    assert!(!pinned.is_read_only());
    assert_eq!(pinned.count().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_tags() {
    let (_dir, dataset) = create_test_dataset(4).await;
    dataset.add(&Record::new("A").with_uuid(test_uuid(1))).await.unwrap();

    let tagged = dataset.tag_version("v1", None).await.unwrap();
    let tags = dataset.list_tags().await.unwrap();
    assert_eq!(tags, vec![("v1".to_string(), tagged)]);
  }
}
