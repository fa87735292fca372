use arrow_array::{RecordBatch, RecordBatchIterator};
use frame_core::validation::ValidationError;
use frame_core::{Record, RelationshipType, escape_value};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use tracing::debug;

use crate::convert::{batch_to_record, records_to_batch};
use crate::dataset::{Dataset, DbError, Result, retry_storage};
use crate::schema::{blob_safe_columns, frames_schema};

impl Dataset {
  /// Whether a record with this uuid exists
  pub async fn exists(&self, uuid: &str) -> Result<bool> {
    let count = self
      .table()
      .count_rows(Some(format!("uuid = '{}'", escape_value(uuid))))
      .await?;
    Ok(count > 0)
  }

  /// Total number of records
  pub async fn count(&self) -> Result<usize> {
    Ok(self.table().count_rows(None).await?)
  }

  /// Append a record. Strict: fails with `DuplicateUuid` if the uuid is
  /// already present.
  pub async fn add(&self, record: &Record) -> Result<()> {
    self.ensure_writable()?;
    record.validate(Some(self.vector_dim))?;
    self.verify_member_targets(std::slice::from_ref(record)).await?;

    let _guard = self.commit_lock().await;
    if self.exists(&record.uuid).await? {
      return Err(DbError::DuplicateUuid(record.uuid.clone()));
    }
    self.append(std::slice::from_ref(record)).await
  }

  /// Append records in bounded chunks. Every record is validated before the
  /// first write so a failure leaves the dataset unchanged.
  pub async fn add_many(&self, records: &[Record], batch_size: usize) -> Result<usize> {
    self.ensure_writable()?;
    if records.is_empty() {
      return Ok(0);
    }
    for record in records {
      record.validate(Some(self.vector_dim))?;
    }
    self.verify_member_targets(records).await?;

    let mut seen = std::collections::HashSet::new();
    for record in records {
      if !seen.insert(record.uuid.as_str()) {
        return Err(DbError::DuplicateUuid(record.uuid.clone()));
      }
    }

    let _guard = self.commit_lock().await;
    for record in records {
      if self.exists(&record.uuid).await? {
        return Err(DbError::DuplicateUuid(record.uuid.clone()));
      }
    }

    let chunk_size = batch_size.max(1);
    for chunk in records.chunks(chunk_size) {
      self.append(chunk).await?;
    }
    debug!("Added {} records to {}", records.len(), self.uri);
    Ok(records.len())
  }

  /// Insert or replace by uuid in a single version bump
  pub async fn upsert(&self, record: &Record) -> Result<()> {
    self.ensure_writable()?;
    record.validate(Some(self.vector_dim))?;
    self.verify_member_targets(std::slice::from_ref(record)).await?;

    let _guard = self.commit_lock().await;
    self.merge(std::slice::from_ref(record)).await
  }

  /// Upsert guarded by an optimistic version check. Fails with `Conflict`
  /// when the dataset has moved past `expected_version`.
  pub async fn upsert_if(&self, record: &Record, expected_version: u64) -> Result<()> {
    self.ensure_writable()?;
    record.validate(Some(self.vector_dim))?;
    self.verify_member_targets(std::slice::from_ref(record)).await?;

    let _guard = self.commit_lock().await;
    let actual = self.table().version().await?;
    if actual != expected_version {
      return Err(DbError::Conflict {
        expected: expected_version,
        actual,
      });
    }
    self.merge(std::slice::from_ref(record)).await
  }

  /// Point lookup by uuid. The blob column is stripped unless `include_blob`
  /// is set, in which case it is fetched through the dedicated blob path.
  pub async fn get(&self, uuid: &str, include_blob: bool) -> Result<Option<Record>> {
    let results: Vec<RecordBatch> = self
      .table()
      .query()
      .only_if(format!("uuid = '{}'", escape_value(uuid)))
      .select(Select::Columns(blob_safe_columns(self.vector_dim)))
      .limit(1)
      .execute()
      .await?
      .try_collect()
      .await?;

    let Some(batch) = results.iter().find(|b| b.num_rows() > 0) else {
      return Ok(None);
    };
    let mut record = batch_to_record(batch, 0)?;

    if include_blob {
      record.raw_data = self.fetch_blob(uuid).await?;
    }
    Ok(Some(record))
  }

  /// Replace the record stored under `uuid`. Fails with `NotFound` if absent.
  pub async fn update_record(&self, uuid: &str, record: &Record) -> Result<()> {
    self.ensure_writable()?;
    if !self.exists(uuid).await? {
      return Err(DbError::NotFound(format!("record {}", uuid)));
    }

    let mut updated = record.clone();
    updated.uuid = uuid.to_string();
    updated.validate(Some(self.vector_dim))?;
    self.verify_member_targets(std::slice::from_ref(&updated)).await?;

    let _guard = self.commit_lock().await;
    self.merge(std::slice::from_ref(&updated)).await
  }

  /// Delete by uuid. Idempotent: deleting an absent uuid succeeds.
  pub async fn delete_record(&self, uuid: &str) -> Result<()> {
    self.ensure_writable()?;
    let _guard = self.commit_lock().await;
    let predicate = format!("uuid = '{}'", escape_value(uuid));
    let predicate = predicate.as_str();
    retry_storage("delete", || async move { Ok(self.table().delete(predicate).await?) }).await
  }

  /// Fetch a record's blob payload. This is the only path that reads the
  /// blob column; it is keyed by uuid and never carries a general filter.
  pub async fn fetch_blob(&self, uuid: &str) -> Result<Option<Vec<u8>>> {
    let results: Vec<RecordBatch> = self
      .table()
      .query()
      .only_if(format!("uuid = '{}'", escape_value(uuid)))
      .select(Select::Columns(vec!["uuid".to_string(), "raw_data".to_string()]))
      .limit(1)
      .execute()
      .await?
      .try_collect()
      .await?;

    let Some(batch) = results.iter().find(|b| b.num_rows() > 0) else {
      return Ok(None);
    };
    Ok(crate::convert::blob_of(batch, 0))
  }

  /// The singleton dataset-header record, if present
  pub async fn dataset_header(&self) -> Result<Option<Record>> {
    let results: Vec<RecordBatch> = self
      .table()
      .query()
      .only_if("record_type = 'dataset_header'".to_string())
      .select(Select::Columns(blob_safe_columns(self.vector_dim)))
      .limit(1)
      .execute()
      .await?
      .try_collect()
      .await?;

    match results.iter().find(|b| b.num_rows() > 0) {
      Some(batch) => Ok(Some(batch_to_record(batch, 0)?)),
      None => Ok(None),
    }
  }

  /// Install or replace the singleton dataset-header record
  pub async fn set_dataset_header(&self, record: &Record) -> Result<()> {
    self.ensure_writable()?;
    if record.record_type != frame_core::RecordType::DatasetHeader {
      return Err(
        ValidationError::new("record_type", "dataset header must have record_type = dataset_header").into(),
      );
    }
    record.validate(Some(self.vector_dim))?;

    let _guard = self.commit_lock().await;
    if let Some(existing) = self.dataset_header().await?
      && existing.uuid != record.uuid
    {
      self
        .table()
        .delete(&format!("uuid = '{}'", escape_value(&existing.uuid)))
        .await?;
    }
    self.merge(std::slice::from_ref(record)).await
  }

  /// `member_of` targets must exist at write time. Targets being written in
  /// the same batch count as present.
  async fn verify_member_targets(&self, records: &[Record]) -> Result<()> {
    let in_batch: std::collections::HashSet<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
    for record in records {
      for (i, rel) in record.relationships.iter().enumerate() {
        if rel.rel_type != RelationshipType::MemberOf {
          continue;
        }
        let Some(id) = rel.id.as_deref() else {
          // Edge addressed by uri/path/cid; existence is out of our hands
          continue;
        };
        if !in_batch.contains(id) && !self.exists(id).await? {
          return Err(
            ValidationError::new(
              format!("relationships[{}]", i),
              format!("member_of target {} does not exist", id),
            )
            .with_hint("write the target record first")
            .into(),
          );
        }
      }
    }
    Ok(())
  }

  /// Plain append (caller holds the commit lock)
  async fn append(&self, records: &[Record]) -> Result<()> {
    retry_storage("append", || async move {
      let batch = records_to_batch(records, self.vector_dim)?;
      let batches = RecordBatchIterator::new(vec![Ok(batch)], frames_schema(self.vector_dim));
      self.table().add(Box::new(batches)).execute().await?;
      Ok(())
    })
    .await
  }

  /// Delete-by-uuid plus append in the same version bump (caller holds the
  /// commit lock)
  async fn merge(&self, records: &[Record]) -> Result<()> {
    retry_storage("merge", || async move {
      let batch = records_to_batch(records, self.vector_dim)?;
      let batches = RecordBatchIterator::new(vec![Ok(batch)], frames_schema(self.vector_dim));

      let mut merge = self.table().merge_insert(&["uuid"]);
      merge.when_matched_update_all(None).when_not_matched_insert_all();
      merge.execute(Box::new(batches)).await?;
      Ok(())
    })
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_util::create_test_dataset;
  use frame_core::Relationship;

  fn record(uuid: &str, title: &str) -> Record {
    Record::new(title).with_uuid(uuid).with_text("hello world")
  }

  fn test_uuid(n: u32) -> String {
    format!("00000000-0000-4000-8000-{:012}", n)
  }

  #[tokio::test]
  async fn test_create_add_get() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let u1 = test_uuid(1);
    let r = record(&u1, "T").with_vector(vec![0.0, 1.0, 0.0, 0.0]);

    dataset.add(&r).await.unwrap();

    let fetched = dataset.get(&u1, false).await.unwrap().unwrap();
    assert_eq!(fetched.title, "T");
    assert_eq!(fetched.vector, Some(vec![0.0, 1.0, 0.0, 0.0]));
    assert_eq!(dataset.count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_add_duplicate_uuid_fails() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let u1 = test_uuid(1);
    dataset.add(&record(&u1, "T")).await.unwrap();

    let err = dataset.add(&record(&u1, "T2")).await.unwrap_err();
    assert!(matches!(err, DbError::DuplicateUuid(_)));
  }

  #[tokio::test]
  async fn test_upsert_preserves_uuid_and_bumps_version_once() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let u1 = test_uuid(1);
    dataset.add(&record(&u1, "T")).await.unwrap();

    let before = dataset.version().await.unwrap();
    dataset.upsert(&record(&u1, "T2")).await.unwrap();
    let after = dataset.version().await.unwrap();

    assert_eq!(dataset.get(&u1, false).await.unwrap().unwrap().title, "T2");
    assert_eq!(dataset.count().await.unwrap(), 1);
    assert_eq!(after, before + 1);
  }

  #[tokio::test]
  async fn test_upsert_equals_delete_plus_add() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let u1 = test_uuid(1);
    dataset.add(&record(&u1, "Original")).await.unwrap();

    let replacement = record(&u1, "Replacement").with_vector(vec![1.0, 0.0, 0.0, 0.0]);
    dataset.upsert(&replacement).await.unwrap();

    let fetched = dataset.get(&u1, false).await.unwrap().unwrap();
    assert_eq!(fetched, replacement);
    assert_eq!(dataset.count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_delete_idempotent() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let u1 = test_uuid(1);
    dataset.add(&record(&u1, "T")).await.unwrap();

    dataset.delete_record(&u1).await.unwrap();
    assert_eq!(dataset.count().await.unwrap(), 0);

    // Second delete succeeds and leaves the dataset unchanged
    dataset.delete_record(&u1).await.unwrap();
    assert_eq!(dataset.count().await.unwrap(), 0);
    assert!(dataset.get(&u1, false).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_update_missing_record_fails() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let err = dataset
      .update_record(&test_uuid(9), &record(&test_uuid(9), "X"))
      .await
      .unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)));
  }

  #[tokio::test]
  async fn test_wrong_dimension_rejected() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let r = record(&test_uuid(1), "T").with_vector(vec![0.0; 3]);
    let err = dataset.add(&r).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
  }

  #[tokio::test]
  async fn test_blob_fetch_and_stripped_get() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let u1 = test_uuid(1);
    let mut r = record(&u1, "T");
    r.raw_data = Some(vec![9, 8, 7]);
    r.raw_data_type = Some("image/png".to_string());
    dataset.add(&r).await.unwrap();

    let stripped = dataset.get(&u1, false).await.unwrap().unwrap();
    assert!(stripped.raw_data.is_none());
    assert_eq!(stripped.raw_data_type.as_deref(), Some("image/png"));

    let with_blob = dataset.get(&u1, true).await.unwrap().unwrap();
    assert_eq!(with_blob.raw_data, Some(vec![9, 8, 7]));

    assert_eq!(dataset.fetch_blob(&u1).await.unwrap(), Some(vec![9, 8, 7]));
    assert_eq!(dataset.fetch_blob(&test_uuid(2)).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_member_of_target_must_exist() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let mut r = record(&test_uuid(1), "Member");
    r.relationships.push(Relationship::member_of(test_uuid(42)));

    let err = dataset.add(&r).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
  }

  #[tokio::test]
  async fn test_member_of_target_in_same_batch() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let header = record(&test_uuid(1), "Header");
    let mut member = record(&test_uuid(2), "Member");
    member.relationships.push(Relationship::member_of(test_uuid(1)));

    dataset.add_many(&[header, member], 10).await.unwrap();
    assert_eq!(dataset.count().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_concurrent_upsert_conflict() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let u1 = test_uuid(1);
    dataset.add(&record(&u1, "Base")).await.unwrap();

    let start_version = dataset.version().await.unwrap();

    // Writer A wins
    dataset.upsert_if(&record(&u1, "A"), start_version).await.unwrap();

    // Writer B started from the same version and loses
    let err = dataset.upsert_if(&record(&u1, "B"), start_version).await.unwrap_err();
    assert!(matches!(err, DbError::Conflict { .. }));

    // B retries from the winner's state and observes A's write first
    let current = dataset.version().await.unwrap();
    assert_eq!(dataset.get(&u1, false).await.unwrap().unwrap().title, "A");
    dataset.upsert_if(&record(&u1, "B"), current).await.unwrap();
    assert_eq!(dataset.get(&u1, false).await.unwrap().unwrap().title, "B");
  }

  #[tokio::test]
  async fn test_add_many_chunks_and_version_monotonicity() {
    let (_dir, dataset) = create_test_dataset(4).await;
    let records: Vec<Record> = (0..5).map(|i| record(&test_uuid(i), &format!("R{}", i))).collect();

    let before = dataset.version().await.unwrap();
    dataset.add_many(&records, 2).await.unwrap();
    let after = dataset.version().await.unwrap();

    assert_eq!(dataset.count().await.unwrap(), 5);
    assert!(after > before);
  }

  #[tokio::test]
  async fn test_dataset_header_singleton() {
    let (_dir, dataset) = create_test_dataset(4).await;
    assert!(dataset.dataset_header().await.unwrap().is_none());

    let header = Record::new("DS")
      .with_uuid(test_uuid(1))
      .with_record_type(frame_core::RecordType::DatasetHeader);
    dataset.set_dataset_header(&header).await.unwrap();

    let replacement = Record::new("DS2")
      .with_uuid(test_uuid(2))
      .with_record_type(frame_core::RecordType::DatasetHeader);
    dataset.set_dataset_header(&replacement).await.unwrap();

    let current = dataset.dataset_header().await.unwrap().unwrap();
    assert_eq!(current.title, "DS2");
    assert_eq!(dataset.count().await.unwrap(), 1);
  }
}
