//! End-to-end tests for the dataset engine: CRUD, blob handling, search,
//! collections, and concurrent writes against a real on-disk dataset.

use db::{Dataset, DbError, ScanOptions};
use frame_core::{Filter, Record, RecordType};
use std::collections::HashMap;
use tempfile::TempDir;

fn test_uuid(n: u32) -> String {
  format!("00000000-0000-4000-8000-{:012}", n)
}

async fn create_dataset(dim: usize) -> (TempDir, Dataset) {
  let dir = TempDir::new().expect("temp dir");
  let uri = format!("file://{}/ds.lance", dir.path().display());
  let dataset = Dataset::create(&uri, dim, &HashMap::new()).await.expect("create dataset");
  (dir, dataset)
}

#[tokio::test]
async fn create_add_get() {
  let (_dir, dataset) = create_dataset(4).await;

  let record = Record::new("T")
    .with_uuid(test_uuid(1))
    .with_text("hello")
    .with_vector(vec![0.0, 1.0, 0.0, 0.0]);
  dataset.add(&record).await.unwrap();

  let fetched = dataset.get(&test_uuid(1), false).await.unwrap().unwrap();
  assert_eq!(fetched, record);
  assert_eq!(dataset.stats().await.unwrap().num_rows, 1);
}

#[tokio::test]
async fn upsert_preserves_uuid_and_bumps_version_once() {
  let (_dir, dataset) = create_dataset(4).await;
  dataset
    .add(&Record::new("T").with_uuid(test_uuid(1)).with_text("hello"))
    .await
    .unwrap();

  let before = dataset.stats().await.unwrap().version;
  dataset
    .upsert(&Record::new("T2").with_uuid(test_uuid(1)).with_text("hello"))
    .await
    .unwrap();
  let stats = dataset.stats().await.unwrap();

  assert_eq!(dataset.get(&test_uuid(1), false).await.unwrap().unwrap().title, "T2");
  assert_eq!(stats.num_rows, 1);
  assert_eq!(stats.version, before + 1);
}

#[tokio::test]
async fn blob_safe_filtered_scan() {
  let (_dir, dataset) = create_dataset(4).await;

  let mut with_blob = Record::new("T").with_uuid(test_uuid(1)).with_text("first");
  with_blob.raw_data = Some(b"png-bytes".to_vec());
  with_blob.raw_data_type = Some("image/png".to_string());
  let without_blob = Record::new("T").with_uuid(test_uuid(2)).with_text("second");
  dataset.add_many(&[with_blob, without_blob], 10).await.unwrap();

  let filter = Filter::parse("title = 'T'").unwrap();
  let rows = dataset.scan_records(&ScanOptions::filtered(filter)).await.unwrap();

  assert_eq!(rows.len(), 2);
  assert!(rows.iter().all(|r| r.raw_data.is_none()));
  assert_eq!(dataset.fetch_blob(&test_uuid(1)).await.unwrap(), Some(b"png-bytes".to_vec()));
}

#[tokio::test]
async fn hybrid_search_single_ranker_score() {
  let (_dir, dataset) = create_dataset(4).await;
  dataset
    .add(
      &Record::new("T")
        .with_uuid(test_uuid(1))
        .with_text("hello")
        .with_vector(vec![0.0, 1.0, 0.0, 0.0]),
    )
    .await
    .unwrap();

  // One row: the vector ranker hits the degenerate-size guard and returns
  // empty, so only the text ranker contributes and the score is 1/61.
  let hits = dataset
    .search_hybrid("hello", &[0.0, 1.0, 0.0, 0.0], 10, None, true)
    .await
    .unwrap();

  assert_eq!(hits.len(), 1);
  assert_eq!(hits[0].record.uuid, test_uuid(1));
  assert!((hits[0].score - 1.0 / 61.0).abs() < 1e-6);
}

#[tokio::test]
async fn text_search_auto_index_and_determinism() {
  let (_dir, dataset) = create_dataset(4).await;
  for i in 1..=5 {
    dataset
      .add(
        &Record::new(format!("doc {}", i))
          .with_uuid(test_uuid(i))
          .with_text("the quick brown fox jumps"),
      )
      .await
      .unwrap();
  }

  let first = dataset.search_text("quick fox", 10, None, true).await.unwrap();
  assert!(!first.is_empty());

  let second = dataset.search_text("quick fox", 10, None, true).await.unwrap();
  let uuids = |hits: &[db::SearchHit]| hits.iter().map(|h| h.record.uuid.clone()).collect::<Vec<_>>();
  assert_eq!(uuids(&first), uuids(&second));
}

#[tokio::test]
async fn collection_roundtrip() {
  let (_dir, dataset) = create_dataset(4).await;

  let c1 = test_uuid(100);
  let mut header = Record::new("Collection A").with_uuid(&c1).with_record_type(RecordType::CollectionHeader);
  header.collection = Some("A".to_string());
  dataset.create_collection(&header).await.unwrap();

  for i in 1..=3 {
    dataset
      .add(&Record::new(format!("M{}", i)).with_uuid(test_uuid(i)))
      .await
      .unwrap();
    dataset.add_to_collection(&test_uuid(i), &c1, None).await.unwrap();
  }

  let members = dataset.collection_members(&c1).await.unwrap();
  let titles: Vec<&str> = members.iter().map(|m| m.title.as_str()).collect();
  assert_eq!(titles, vec!["M1", "M2", "M3"]);
}

#[tokio::test]
async fn concurrent_upsert_conflict() {
  let (_dir, dataset) = create_dataset(4).await;
  dataset
    .add(&Record::new("Base").with_uuid(test_uuid(1)))
    .await
    .unwrap();
  let dataset = std::sync::Arc::new(dataset);

  let start = dataset.version().await.unwrap();

  let a = {
    let dataset = dataset.clone();
    tokio::spawn(async move {
      dataset
        .upsert_if(&Record::new("A").with_uuid(test_uuid(1)), start)
        .await
    })
  };
  let b = {
    let dataset = dataset.clone();
    tokio::spawn(async move {
      dataset
        .upsert_if(&Record::new("B").with_uuid(test_uuid(1)), start)
        .await
    })
  };

  let results = [a.await.unwrap(), b.await.unwrap()];
  let wins = results.iter().filter(|r| r.is_ok()).count();
  let conflicts = results
    .iter()
    .filter(|r| matches!(r, Err(DbError::Conflict { .. })))
    .count();
  assert_eq!(wins, 1);
  assert_eq!(conflicts, 1);

  // The loser retries from the winner's state
  let current = dataset.version().await.unwrap();
  let winner_title = dataset.get(&test_uuid(1), false).await.unwrap().unwrap().title;
  assert!(winner_title == "A" || winner_title == "B");
  dataset
    .upsert_if(&Record::new("Retry").with_uuid(test_uuid(1)), current)
    .await
    .unwrap();
  assert_eq!(dataset.get(&test_uuid(1), false).await.unwrap().unwrap().title, "Retry");
}

#[tokio::test]
async fn uuid_uniqueness_across_writes() {
  let (_dir, dataset) = create_dataset(4).await;
  let u1 = test_uuid(1);

  dataset.add(&Record::new("v1").with_uuid(&u1)).await.unwrap();
  dataset.upsert(&Record::new("v2").with_uuid(&u1)).await.unwrap();
  dataset.upsert(&Record::new("v3").with_uuid(&u1)).await.unwrap();

  let filter = Filter::parse(&format!("uuid = '{}'", u1)).unwrap();
  let matches = dataset.list(Some(&filter), None, None, None).await.unwrap();
  assert_eq!(matches.len(), 1);
  assert_eq!(matches[0].title, "v3");
}

#[tokio::test]
async fn search_within_collection_scope() {
  let (_dir, dataset) = create_dataset(4).await;

  let c1 = test_uuid(100);
  let mut header = Record::new("Collection A").with_uuid(&c1).with_record_type(RecordType::CollectionHeader);
  header.collection = Some("A".to_string());
  dataset.create_collection(&header).await.unwrap();

  for i in 1..=3 {
    dataset
      .add(
        &Record::new(format!("M{}", i))
          .with_uuid(test_uuid(i))
          .with_text("collected document"),
      )
      .await
      .unwrap();
    dataset.add_to_collection(&test_uuid(i), &c1, None).await.unwrap();
  }
  // An outsider that matches the text but not the collection
  dataset
    .add(
      &Record::new("Outsider")
        .with_uuid(test_uuid(50))
        .with_text("collected document"),
    )
    .await
    .unwrap();

  let scoped = Dataset::collection_scope(&c1, None).unwrap();
  let hits = dataset.search_text("collected", 10, Some(&scoped), true).await.unwrap();
  assert_eq!(hits.len(), 3);
  assert!(hits.iter().all(|h| h.record.collection_id.as_deref() == Some(c1.as_str())));
}
