//! System tools: health, registry introspection, dataset validation and
//! maintenance, server identity.

use frame_core::validation::{optional_usize, require_string};
use serde_json::json;
use std::collections::HashSet;

use crate::registry::{builtin_tools, find_tool};
use crate::rpc::{Request, Response};
use crate::tools::{ToolHandler, invalid_params};

impl ToolHandler {
  pub async fn health_check(&self, request: Request) -> Response {
    let (dataset_ok, version) = match self.dataset.version().await {
      Ok(version) => (true, Some(version)),
      Err(_) => (false, None),
    };
    let status = if dataset_ok { "ok" } else { "degraded" };
    Response::success(
      request.id,
      json!({
        "status": status,
        "dataset": {"uri": self.dataset.uri, "reachable": dataset_ok, "version": version},
      }),
    )
  }

  pub async fn list_tools(&self, request: Request) -> Response {
    let tools: Vec<serde_json::Value> = builtin_tools()
      .iter()
      .map(|t| json!({"name": t.name, "description": t.description}))
      .collect();
    Response::success(request.id, json!({"tools": tools, "count": tools.len()}))
  }

  pub async fn get_tool_info(&self, request: Request) -> Response {
    let name = match require_string(request.params.get("name"), "name") {
      Ok(name) => name,
      Err(e) => return invalid_params(request.id, &e),
    };

    let tools = builtin_tools();
    match find_tool(&tools, &name) {
      Some(tool) => Response::success(request.id, serde_json::to_value(tool).unwrap_or_default()),
      None => Response::error_with(
        request.id,
        crate::rpc::METHOD_NOT_FOUND,
        &format!("Unknown tool: {}", name),
        "not_found",
        &name,
      ),
    }
  }

  /// Full-dataset consistency check: schema validation per record, uuid
  /// uniqueness, and member_of edges pointing at live records.
  pub async fn validate_dataset(&self, request: Request) -> Response {
    let max_issues = match optional_usize(request.params.get("max_issues"), "max_issues") {
      Ok(value) => value.unwrap_or(50),
      Err(e) => return invalid_params(request.id, &e),
    };

    let records = match self.dataset.list(None, None, None, None).await {
      Ok(records) => records,
      Err(e) => return Response::from_db_error(request.id, e),
    };

    let mut issues: Vec<serde_json::Value> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let known: HashSet<&str> = records.iter().map(|r| r.uuid.as_str()).collect();

    for record in &records {
      if issues.len() >= max_issues {
        break;
      }
      if !seen.insert(record.uuid.as_str()) {
        issues.push(json!({"uuid": record.uuid, "issue": "duplicate uuid"}));
        continue;
      }
      if let Err(e) = record.validate(Some(self.dataset.vector_dim)) {
        issues.push(json!({"uuid": record.uuid, "issue": e.to_string()}));
        continue;
      }
      for id in record.member_of_ids() {
        if !known.contains(id) {
          issues.push(json!({"uuid": record.uuid, "issue": format!("member_of target {} missing", id)}));
          break;
        }
      }
    }

    Response::success(
      request.id,
      json!({"valid": issues.is_empty(), "checked": records.len(), "issues": issues}),
    )
  }

  pub async fn optimize_dataset(&self, request: Request) -> Response {
    let target_rows = match optional_usize(request.params.get("target_rows_per_fragment"), "target_rows_per_fragment") {
      Ok(value) => value.unwrap_or(1024 * 1024),
      Err(e) => return invalid_params(request.id, &e),
    };
    let prune_days = match optional_usize(request.params.get("prune_older_than_days"), "prune_older_than_days") {
      Ok(value) => value,
      Err(e) => return invalid_params(request.id, &e),
    };

    if let Err(e) = self.dataset.compact(target_rows).await {
      return Response::from_db_error(request.id, e);
    }
    if let Err(e) = self.dataset.optimize_indices().await {
      return Response::from_db_error(request.id, e);
    }
    if let Some(days) = prune_days
      && let Err(e) = self.dataset.cleanup_old_versions(chrono::Duration::days(days as i64)).await
    {
      return Response::from_db_error(request.id, e);
    }

    match self.dataset.stats().await {
      Ok(stats) => Response::success(request.id, serde_json::to_value(&stats).unwrap_or_default()),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn clear_cache(&self, request: Request) -> Response {
    let mut cursors = self.cursors.lock().expect("cursor registry poisoned");
    let cleared = cursors.len();
    cursors.clear();
    Response::success(request.id, json!({"cleared_cursors": cleared}))
  }

  pub async fn server_info(&self, request: Request) -> Response {
    Response::success(
      request.id,
      json!({
        "name": "contextframe",
        "version": env!("CARGO_PKG_VERSION"),
        "dataset": {"uri": self.dataset.uri, "vector_dim": self.dataset.vector_dim},
        "embedder": {"model_id": self.embedder.model_id(), "dim": self.embedder.dim()},
      }),
    )
  }

  pub async fn dataset_stats(&self, request: Request) -> Response {
    match self.dataset.stats().await {
      Ok(stats) => Response::success(request.id, serde_json::to_value(&stats).unwrap_or_default()),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tools::tests::test_handler;

  fn request(params: serde_json::Value) -> Request {
    Request {
      jsonrpc: "2.0".to_string(),
      id: Some(json!(1)),
      method: "system".to_string(),
      params,
    }
  }

  #[tokio::test]
  async fn test_health_check() {
    let (_dir, handler) = test_handler().await;
    let response = handler.health_check(request(json!({}))).await;
    assert_eq!(response.result.unwrap()["status"], "ok");
  }

  #[tokio::test]
  async fn test_list_and_get_tool_info() {
    let (_dir, handler) = test_handler().await;
    let listed = handler.list_tools(request(json!({}))).await;
    assert!(listed.result.unwrap()["count"].as_u64().unwrap() >= 30);

    let info = handler.get_tool_info(request(json!({"name": "search_documents"}))).await;
    let result = info.result.unwrap();
    assert_eq!(result["name"], "search_documents");
    assert!(result["input_schema"]["properties"]["mode"].is_object());

    let missing = handler.get_tool_info(request(json!({"name": "nope"}))).await;
    assert_eq!(missing.error.unwrap().code, crate::rpc::METHOD_NOT_FOUND);
  }

  #[tokio::test]
  async fn test_validate_dataset_clean() {
    let (_dir, handler) = test_handler().await;
    handler
      .document_create(request(json!({"title": "T", "text_content": "x"})))
      .await;

    let response = handler.validate_dataset(request(json!({}))).await;
    let result = response.result.unwrap();
    assert_eq!(result["valid"], true);
    assert_eq!(result["checked"], 1);
  }

  #[tokio::test]
  async fn test_server_info() {
    let (_dir, handler) = test_handler().await;
    let response = handler.server_info(request(json!({}))).await;
    let result = response.result.unwrap();
    assert_eq!(result["name"], "contextframe");
    assert_eq!(result["dataset"]["vector_dim"], 8);
  }

  #[tokio::test]
  async fn test_clear_cache() {
    let (_dir, handler) = test_handler().await;
    let response = handler.clear_cache(request(json!({}))).await;
    assert_eq!(response.result.unwrap()["cleared_cursors"], 0);
  }
}
