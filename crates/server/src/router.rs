//! JSON-RPC dispatch: method lookup, per-request deadline, error mapping.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::rpc::{INTERNAL_ERROR, METHOD_NOT_FOUND, Request, Response};
use crate::tools::ToolHandler;

/// Routes requests to tool implementations under a per-request deadline.
pub struct Router {
  handler: Arc<ToolHandler>,
  timeout: Duration,
}

impl Router {
  pub fn new(handler: ToolHandler) -> Self {
    let timeout = Duration::from_secs(handler.config().server.request_timeout_secs);
    Self {
      handler: Arc::new(handler),
      timeout,
    }
  }

  pub fn handler(&self) -> &Arc<ToolHandler> {
    &self.handler
  }

  /// Handle one request. On deadline the tool's in-flight work is dropped
  /// (cooperative cancellation at its next await point) and the caller gets
  /// `-32603` with a timeout detail.
  pub async fn handle(&self, request: Request) -> Response {
    let id = request.id.clone();
    let method = request.method.clone();
    debug!("Handling request: {} (id={:?})", method, id);

    match tokio::time::timeout(self.timeout, self.dispatch(request)).await {
      Ok(response) => response,
      Err(_) => {
        warn!("Request {} timed out after {:?}", method, self.timeout);
        Response::error_with(id, INTERNAL_ERROR, "Request timed out", "timeout", &method)
      }
    }
  }

  async fn dispatch(&self, request: Request) -> Response {
    let handler = &self.handler;
    match request.method.as_str() {
      // Liveness (internal, not part of the registry)
      "ping" => Response::success(request.id, serde_json::json!("pong")),

      // Document ops
      "document_create" => handler.document_create(request).await,
      "document_get" => handler.document_get(request).await,
      "document_update" => handler.document_update(request).await,
      "document_delete" => handler.document_delete(request).await,
      "document_exists" => handler.document_exists(request).await,
      "document_list" => handler.document_list(request).await,
      "document_create_batch" => handler.document_create_batch(request).await,
      "document_update_batch" => handler.document_update_batch(request).await,
      "document_delete_batch" => handler.document_delete_batch(request).await,

      // Search
      "search_documents" => handler.search_documents(request).await,
      "search_similar" => handler.search_similar(request).await,
      "search_by_metadata" => handler.search_by_metadata(request).await,
      "search_within_collection" => handler.search_within_collection(request).await,
      "search_stream" => handler.search_stream(request).await,

      // Collections
      "collection_create" => handler.collection_create(request).await,
      "collection_get" => handler.collection_get(request).await,
      "collection_update" => handler.collection_update(request).await,
      "collection_delete" => handler.collection_delete(request).await,
      "collection_list" => handler.collection_list(request).await,
      "collection_add_documents" => handler.collection_add_documents(request).await,
      "collection_remove_documents" => handler.collection_remove_documents(request).await,
      "collection_stats" => handler.collection_stats_tool(request).await,

      // Import / export
      "import_documents" => handler.import_documents(request).await,
      "export_documents" => handler.export_documents(request).await,
      "task_status" => handler.task_status(request).await,

      // System
      "health_check" => handler.health_check(request).await,
      "list_tools" => handler.list_tools(request).await,
      "get_tool_info" => handler.get_tool_info(request).await,
      "validate_dataset" => handler.validate_dataset(request).await,
      "optimize_dataset" => handler.optimize_dataset(request).await,
      "clear_cache" => handler.clear_cache(request).await,
      "server_info" => handler.server_info(request).await,
      "dataset_stats" => handler.dataset_stats(request).await,

      _ => {
        warn!("Unknown method: {}", request.method);
        Response::error(
          request.id,
          METHOD_NOT_FOUND,
          &format!("Method not found: {}", request.method),
        )
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tools::tests::test_handler;
  use serde_json::json;

  #[tokio::test]
  async fn test_ping() {
    let (_dir, handler) = test_handler().await;
    let router = Router::new(handler);
    let response = router
      .handle(Request {
        jsonrpc: "2.0".to_string(),
        id: Some(json!(1)),
        method: "ping".to_string(),
        params: json!({}),
      })
      .await;
    assert_eq!(response.result.unwrap(), json!("pong"));
  }

  #[tokio::test]
  async fn test_unknown_method() {
    let (_dir, handler) = test_handler().await;
    let router = Router::new(handler);
    let response = router
      .handle(Request {
        jsonrpc: "2.0".to_string(),
        id: Some(json!(1)),
        method: "definitely_not_a_tool".to_string(),
        params: json!({}),
      })
      .await;
    assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
  }
}
