//! End-to-end tests for the MCP router: document lifecycle, search modes,
//! collection scoping, and async import over a real on-disk dataset.

use db::Dataset;
use frame_core::Config;
use server::{Request, Router, ToolHandler};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

async fn test_router() -> (TempDir, Router) {
  let dir = TempDir::new().expect("temp dir");
  let uri = format!("file://{}/ds.lance", dir.path().display());
  let dataset = Arc::new(Dataset::create(&uri, 8, &HashMap::new()).await.expect("create dataset"));
  let router = Router::new(ToolHandler::new(dataset, Arc::new(Config::default())));
  (dir, router)
}

fn request(method: &str, params: serde_json::Value) -> Request {
  Request {
    jsonrpc: "2.0".to_string(),
    id: Some(json!(1)),
    method: method.to_string(),
    params,
  }
}

#[tokio::test]
async fn document_lifecycle_over_rpc() {
  let (_dir, router) = test_router().await;

  let created = router
    .handle(request(
      "document_create",
      json!({"title": "T", "text_content": "hello world", "tags": ["demo"]}),
    ))
    .await;
  assert!(created.error.is_none(), "{:?}", created.error);
  let uuid = created.result.unwrap()["uuid"].as_str().unwrap().to_string();

  let fetched = router.handle(request("document_get", json!({"uuid": uuid}))).await;
  assert_eq!(fetched.result.unwrap()["title"], "T");

  let updated = router
    .handle(request("document_update", json!({"uuid": uuid, "title": "T2"})))
    .await;
  assert_eq!(updated.result.unwrap()["title"], "T2");

  let deleted = router.handle(request("document_delete", json!({"uuid": uuid}))).await;
  assert!(deleted.error.is_none());

  let gone = router.handle(request("document_get", json!({"uuid": uuid}))).await;
  assert_eq!(gone.error.unwrap().code, -32001);
}

#[tokio::test]
async fn invalid_params_code() {
  let (_dir, router) = test_router().await;
  // Missing required title
  let response = router.handle(request("document_create", json!({"text_content": "x"}))).await;
  assert_eq!(response.error.unwrap().code, -32602);
}

#[tokio::test]
async fn unknown_method_code() {
  let (_dir, router) = test_router().await;
  let response = router.handle(request("bogus_tool", json!({}))).await;
  assert_eq!(response.error.unwrap().code, -32601);
}

#[tokio::test]
async fn filter_error_code_over_rpc() {
  let (_dir, router) = test_router().await;
  let response = router
    .handle(request("document_list", json!({"filter": "position >= 2"})))
    .await;
  assert_eq!(response.error.unwrap().code, -32004);
}

#[tokio::test]
async fn hybrid_search_single_document() {
  let (_dir, router) = test_router().await;

  let created = router
    .handle(request("document_create", json!({"title": "T", "text_content": "hello"})))
    .await;
  let uuid = created.result.unwrap()["uuid"].as_str().unwrap().to_string();

  let response = router
    .handle(request(
      "search_documents",
      json!({"query": "hello", "mode": "hybrid", "limit": 10}),
    ))
    .await;
  assert!(response.error.is_none(), "{:?}", response.error);
  let result = response.result.unwrap();
  assert_eq!(result["count"], 1);
  assert_eq!(result["results"][0]["document"]["uuid"], uuid.as_str());
  // Only the text ranker matched (one row trips the vector-size guard)
  let score = result["results"][0]["score"].as_f64().unwrap();
  assert!((score - 1.0 / 61.0).abs() < 1e-6, "score was {}", score);
}

#[tokio::test]
async fn collection_scenario_over_rpc() {
  let (_dir, router) = test_router().await;

  let header = router
    .handle(request("collection_create", json!({"collection": "A"})))
    .await;
  let header_uuid = header.result.unwrap()["uuid"].as_str().unwrap().to_string();

  let mut member_uuids = Vec::new();
  for i in 1..=3 {
    let created = router
      .handle(request(
        "document_create",
        json!({"title": format!("M{}", i), "text_content": "member text"}),
      ))
      .await;
    member_uuids.push(created.result.unwrap()["uuid"].as_str().unwrap().to_string());
  }
  router
    .handle(request(
      "collection_add_documents",
      json!({"collection_id": header_uuid, "document_uuids": member_uuids}),
    ))
    .await;

  let all = router
    .handle(request(
      "search_within_collection",
      json!({"collection_id": header_uuid, "query": "*"}),
    ))
    .await;
  let result = all.result.unwrap();
  assert_eq!(result["count"], 3);
  let titles: Vec<&str> = result["documents"]
    .as_array()
    .unwrap()
    .iter()
    .map(|d| d["title"].as_str().unwrap())
    .collect();
  assert_eq!(titles, vec!["M1", "M2", "M3"]);
}

#[tokio::test]
async fn import_task_reports_progress() {
  let (_dir, router) = test_router().await;

  let imported = router
    .handle(request(
      "import_documents",
      json!({"documents": [{"title": "A", "text_content": "a"}, {"title": "B", "text_content": "b"}]}),
    ))
    .await;
  let task_id = imported.result.unwrap()["task_id"].as_str().unwrap().to_string();

  let mut state = String::new();
  for _ in 0..100 {
    let status = router
      .handle(request("task_status", json!({"task_id": task_id})))
      .await;
    state = status.result.unwrap()["state"].as_str().unwrap().to_string();
    if state != "running" {
      break;
    }
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  }
  assert_eq!(state, "complete");

  let stats = router.handle(request("dataset_stats", json!({}))).await;
  assert_eq!(stats.result.unwrap()["num_rows"], 2);
}

#[tokio::test]
async fn transient_embedder_failures_are_retried() {
  use embedding::{Embedder, EmbeddingError};
  use std::sync::atomic::{AtomicU32, Ordering};

  // Fails its first call the way an overloaded remote provider would,
  // then recovers. The handler wraps plugged-in embedders with retries,
  // so document_create still succeeds.
  struct FlakyEmbedder {
    failures: AtomicU32,
  }

  #[async_trait::async_trait]
  impl Embedder for FlakyEmbedder {
    fn model_id(&self) -> &str {
      "flaky-test"
    }

    fn dim(&self) -> usize {
      8
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
      let failing = self
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
      if failing {
        return Err(EmbeddingError::Provider("503 service unavailable".to_string()));
      }
      Ok(texts.iter().map(|_| vec![0.5; 8]).collect())
    }
  }

  let dir = TempDir::new().expect("temp dir");
  let uri = format!("file://{}/ds.lance", dir.path().display());
  let dataset = Arc::new(Dataset::create(&uri, 8, &HashMap::new()).await.expect("create dataset"));
  let handler = ToolHandler::new(dataset, Arc::new(Config::default())).with_embedder(Arc::new(FlakyEmbedder {
    failures: AtomicU32::new(1),
  }));
  let router = Router::new(handler);

  let created = router
    .handle(request("document_create", json!({"title": "T", "text_content": "hello"})))
    .await;
  assert!(created.error.is_none(), "{:?}", created.error);
  let vector = created.result.unwrap()["vector"].as_array().unwrap().len();
  assert_eq!(vector, 8);
}

#[tokio::test]
async fn validate_dataset_over_rpc() {
  let (_dir, router) = test_router().await;
  router
    .handle(request("document_create", json!({"title": "T"})))
    .await;

  let response = router.handle(request("validate_dataset", json!({}))).await;
  let result = response.result.unwrap();
  assert_eq!(result["valid"], true);
}
