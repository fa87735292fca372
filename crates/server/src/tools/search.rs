//! Search tools: modes, similarity, metadata, collection scope, and the
//! cursor-paged stream.

use db::{Dataset, SearchHit};
use frame_core::validation::{ValidationError, optional_bool, optional_string, optional_usize, require_string};
use frame_core::Filter;
use serde_json::json;
use uuid::Uuid;

use crate::rpc::{INVALID_SEARCH_MODE, Request, Response};
use crate::tools::{SearchCursor, ToolHandler, invalid_params, parse_filter_param};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchMode {
  Text,
  Vector,
  Hybrid,
}

fn parse_mode(id: &Option<serde_json::Value>, params: &serde_json::Value, default: SearchMode) -> Result<SearchMode, Response> {
  match params.get("mode").and_then(|v| v.as_str()) {
    None => Ok(default),
    Some("text") => Ok(SearchMode::Text),
    Some("vector") => Ok(SearchMode::Vector),
    Some("hybrid") => Ok(SearchMode::Hybrid),
    Some(other) => Err(Response::error_with(
      id.clone(),
      INVALID_SEARCH_MODE,
      &format!("Invalid search mode: {}", other),
      "invalid_mode",
      "expected text, vector, or hybrid",
    )),
  }
}

impl ToolHandler {
  pub async fn search_documents(&self, request: Request) -> Response {
    let mode = match parse_mode(&request.id, &request.params, SearchMode::Hybrid) {
      Ok(mode) => mode,
      Err(response) => return response,
    };
    let filter = match self.scoped_filter(&request).await {
      Ok(filter) => filter,
      Err(response) => return response,
    };
    let limit = match optional_usize(request.params.get("limit"), "limit") {
      Ok(limit) => limit.unwrap_or(self.config.search.default_limit),
      Err(e) => return invalid_params(request.id, &e),
    };
    let auto_index = match optional_bool(request.params.get("auto_index"), "auto_index") {
      Ok(flag) => flag.unwrap_or(self.config.search.auto_index),
      Err(e) => return invalid_params(request.id, &e),
    };

    match self.run_search(mode, &request, filter.as_ref(), limit, auto_index).await {
      Ok(hits) => Response::success(request.id, self.hits_to_json(&hits)),
      Err(response) => *response,
    }
  }

  pub async fn search_similar(&self, request: Request) -> Response {
    let uuid = match require_string(request.params.get("uuid"), "uuid") {
      Ok(uuid) => uuid,
      Err(e) => return invalid_params(request.id, &e),
    };
    let limit = match optional_usize(request.params.get("limit"), "limit") {
      Ok(limit) => limit.unwrap_or(self.config.search.default_limit),
      Err(e) => return invalid_params(request.id, &e),
    };
    let filter = match parse_filter_param(&request.id, &request.params) {
      Ok(filter) => filter,
      Err(response) => return response,
    };

    let record = match self.dataset.get(&uuid, false).await {
      Ok(Some(record)) => record,
      Ok(None) => {
        return Response::error_with(
          request.id,
          crate::rpc::DOCUMENT_NOT_FOUND,
          &format!("Document {} not found", uuid),
          "not_found",
          &uuid,
        );
      }
      Err(e) => return Response::from_db_error(request.id, e),
    };

    let vector = match record.vector {
      Some(vector) => vector,
      None => match &record.text_content {
        Some(text) => match self.embed_one(text).await {
          Ok(vector) => vector,
          Err(e) => return Response::from_embedding_error(request.id, e),
        },
        None => {
          return invalid_params(
            request.id,
            &ValidationError::new("uuid", "record has neither a vector nor text to embed"),
          );
        }
      },
    };

    // Ask for one extra hit since the record itself will rank first
    match self.dataset.search_vector(&vector, limit + 1, filter.as_ref()).await {
      Ok(hits) => {
        let similar: Vec<&SearchHit> = hits.iter().filter(|h| h.record.uuid != uuid).take(limit).collect();
        let results: Vec<serde_json::Value> = similar
          .iter()
          .map(|h| json!({"document": self.record_to_json(&h.record), "score": h.score}))
          .collect();
        Response::success(request.id, json!({"results": results, "count": results.len()}))
      }
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  /// Custom metadata lives in a list<struct> column the filter grammar cannot
  /// reach, so this tool scans blob-safe and matches pairs in memory.
  pub async fn search_by_metadata(&self, request: Request) -> Response {
    let key = match require_string(request.params.get("key"), "key") {
      Ok(key) => key,
      Err(e) => return invalid_params(request.id, &e),
    };
    let value = match optional_string(request.params.get("value"), "value") {
      Ok(value) => value,
      Err(e) => return invalid_params(request.id, &e),
    };
    let limit = match optional_usize(request.params.get("limit"), "limit") {
      Ok(limit) => limit.unwrap_or(self.config.search.default_limit),
      Err(e) => return invalid_params(request.id, &e),
    };

    let records = match self.dataset.list(None, None, None, None).await {
      Ok(records) => records,
      Err(e) => return Response::from_db_error(request.id, e),
    };

    let matches: Vec<serde_json::Value> = records
      .iter()
      .filter(|record| {
        record
          .custom_metadata
          .iter()
          .any(|(k, v)| k == &key && value.as_ref().is_none_or(|expected| v == expected))
      })
      .take(limit)
      .map(|record| self.record_to_json(record))
      .collect();

    Response::success(request.id, json!({"documents": matches, "count": matches.len()}))
  }

  pub async fn search_within_collection(&self, request: Request) -> Response {
    let collection_id = match require_string(request.params.get("collection_id"), "collection_id") {
      Ok(id) => id,
      Err(e) => return invalid_params(request.id, &e),
    };
    let query = match require_string(request.params.get("query"), "query") {
      Ok(query) => query,
      Err(e) => return invalid_params(request.id, &e),
    };
    let limit = match optional_usize(request.params.get("limit"), "limit") {
      Ok(limit) => limit.unwrap_or(self.config.search.default_limit),
      Err(e) => return invalid_params(request.id, &e),
    };

    // "*" lists the whole collection in its stored order
    if query == "*" {
      return match self.dataset.collection_members(&collection_id).await {
        Ok(members) => {
          let documents: Vec<serde_json::Value> = members.iter().map(|r| self.record_to_json(r)).collect();
          Response::success(request.id, json!({"documents": documents, "count": documents.len()}))
        }
        Err(e) => Response::from_db_error(request.id, e),
      };
    }

    let mode = match parse_mode(&request.id, &request.params, SearchMode::Text) {
      Ok(mode) => mode,
      Err(response) => return response,
    };
    let scoped = match Dataset::collection_scope(&collection_id, None) {
      Ok(filter) => filter,
      Err(e) => return Response::from_db_error(request.id, e),
    };

    match self
      .run_search(mode, &request, Some(&scoped), limit, self.config.search.auto_index)
      .await
    {
      Ok(hits) => {
        // The scalar scope column is a hint; the member_of edge decides
        let members: Vec<&SearchHit> = hits
          .iter()
          .filter(|h| h.record.member_of_ids().any(|id| id == collection_id))
          .collect();
        let results: Vec<serde_json::Value> = members
          .iter()
          .map(|h| json!({"document": self.record_to_json(&h.record), "score": h.score}))
          .collect();
        Response::success(request.id, json!({"results": results, "count": results.len()}))
      }
      Err(response) => *response,
    }
  }

  /// Cursor-paged search. The first call runs the search and stores the full
  /// ranked result server-side; follow-ups drain it batch by batch.
  pub async fn search_stream(&self, request: Request) -> Response {
    if let Some(cursor_id) = request.params.get("cursor").and_then(|v| v.as_str()) {
      let mut cursors = self.cursors.lock().expect("cursor registry poisoned");
      let Some(cursor) = cursors.get_mut(cursor_id) else {
        return invalid_params(request.id, &ValidationError::new("cursor", "unknown or expired cursor"));
      };

      let end = (cursor.offset + cursor.batch_size).min(cursor.hits.len());
      let batch: Vec<serde_json::Value> = cursor.hits[cursor.offset..end].to_vec();
      cursor.offset = end;
      let done = cursor.offset >= cursor.hits.len();
      if done {
        cursors.remove(cursor_id);
        return Response::success(request.id, json!({"batch": batch, "done": true}));
      }
      return Response::success(request.id, json!({"cursor": cursor_id, "batch": batch, "done": false}));
    }

    let mode = match parse_mode(&request.id, &request.params, SearchMode::Hybrid) {
      Ok(mode) => mode,
      Err(response) => return response,
    };
    let filter = match parse_filter_param(&request.id, &request.params) {
      Ok(filter) => filter,
      Err(response) => return response,
    };
    let limit = match optional_usize(request.params.get("limit"), "limit") {
      Ok(limit) => limit.unwrap_or(100),
      Err(e) => return invalid_params(request.id, &e),
    };
    let batch_size = match optional_usize(request.params.get("batch_size"), "batch_size") {
      Ok(size) => size.unwrap_or(10).max(1),
      Err(e) => return invalid_params(request.id, &e),
    };

    let hits = match self
      .run_search(mode, &request, filter.as_ref(), limit, self.config.search.auto_index)
      .await
    {
      Ok(hits) => hits,
      Err(response) => return *response,
    };

    let serialized: Vec<serde_json::Value> = hits
      .iter()
      .map(|h| json!({"document": self.record_to_json(&h.record), "score": h.score}))
      .collect();

    let cursor_id = Uuid::new_v4().to_string();
    let mut cursors = self.cursors.lock().expect("cursor registry poisoned");
    cursors.insert(
      cursor_id.clone(),
      SearchCursor {
        hits: serialized,
        offset: 0,
        batch_size,
      },
    );
    drop(cursors);

    // Deliver the first batch immediately
    let followup = Request {
      jsonrpc: request.jsonrpc.clone(),
      id: request.id.clone(),
      method: request.method.clone(),
      params: json!({"cursor": cursor_id}),
    };
    Box::pin(self.search_stream(followup)).await
  }

  /// Combine an explicit filter param with a collection_id scope
  async fn scoped_filter(&self, request: &Request) -> Result<Option<Filter>, Response> {
    let filter = parse_filter_param(&request.id, &request.params)?;
    match request.params.get("collection_id").and_then(|v| v.as_str()) {
      Some(collection_id) => Dataset::collection_scope(collection_id, filter.as_ref())
        .map(Some)
        .map_err(|e| Response::from_db_error(request.id.clone(), e)),
      None => Ok(filter),
    }
  }

  async fn run_search(
    &self,
    mode: SearchMode,
    request: &Request,
    filter: Option<&Filter>,
    limit: usize,
    auto_index: bool,
  ) -> Result<Vec<SearchHit>, Box<Response>> {
    let query = request.params.get("query").and_then(|v| v.as_str());

    let result = match mode {
      SearchMode::Text => {
        let query = self.require_query(request, query)?;
        self.dataset.search_text(query, limit, filter, auto_index).await
      }
      SearchMode::Vector => {
        let vector = self.query_vector(request, query).await?;
        self.dataset.search_vector(&vector, limit, filter).await
      }
      SearchMode::Hybrid => {
        let query = self.require_query(request, query)?;
        let vector = self.query_vector(request, Some(query)).await?;
        self.dataset.search_hybrid(query, &vector, limit, filter, auto_index).await
      }
    };
    result.map_err(|e| Box::new(Response::from_db_error(request.id.clone(), e)))
  }

  fn require_query<'a>(&self, request: &Request, query: Option<&'a str>) -> Result<&'a str, Box<Response>> {
    query.ok_or_else(|| {
      Box::new(invalid_params(
        request.id.clone(),
        &ValidationError::missing("query"),
      ))
    })
  }

  /// Explicit vector param wins; otherwise the query text is embedded
  async fn query_vector(&self, request: &Request, query: Option<&str>) -> Result<Vec<f32>, Box<Response>> {
    if let Some(value) = request.params.get("vector") {
      return frame_core::require_f32_vec(Some(value), "vector")
        .map_err(|e| Box::new(invalid_params(request.id.clone(), &e)));
    }
    let query = self.require_query(request, query)?;
    self
      .embed_one(query)
      .await
      .map_err(|e| Box::new(Response::from_embedding_error(request.id.clone(), e)))
  }

  fn hits_to_json(&self, hits: &[SearchHit]) -> serde_json::Value {
    let results: Vec<serde_json::Value> = hits
      .iter()
      .map(|h| json!({"document": self.record_to_json(&h.record), "score": h.score}))
      .collect();
    json!({"results": results, "count": results.len()})
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
      method: "search_documents".to_string(),
      params,
    }
  }

  async fn seed(handler: &crate::tools::ToolHandler, n: u32) {
    for i in 0..n {
      let created = handler
        .document_create(Request {
          jsonrpc: "2.0".to_string(),
          id: Some(json!(1)),
          method: "document_create".to_string(),
          params: json!({"title": format!("doc {}", i), "text_content": "the quick brown fox"}),
        })
        .await;
      assert!(created.error.is_none(), "{:?}", created.error);
    }
  }

  #[tokio::test]
  async fn test_invalid_mode_code() {
    let (_dir, handler) = test_handler().await;
    let response = handler.search_documents(request(json!({"query": "x", "mode": "fuzzy"}))).await;
    assert_eq!(response.error.unwrap().code, INVALID_SEARCH_MODE);
  }

  #[tokio::test]
  async fn test_text_mode_requires_query() {
    let (_dir, handler) = test_handler().await;
    let response = handler.search_documents(request(json!({"mode": "text"}))).await;
    assert_eq!(response.error.unwrap().code, crate::rpc::INVALID_PARAMS);
  }

  #[tokio::test]
  async fn test_text_search_end_to_end() {
    let (_dir, handler) = test_handler().await;
    seed(&handler, 3).await;

    let response = handler
      .search_documents(request(json!({"query": "quick fox", "mode": "text"})))
      .await;
    assert!(response.error.is_none(), "{:?}", response.error);
    let result = response.result.unwrap();
    assert!(result["count"].as_u64().unwrap() > 0);
  }

  #[tokio::test]
  async fn test_hybrid_search_end_to_end() {
    let (_dir, handler) = test_handler().await;
    seed(&handler, 3).await;

    let response = handler
      .search_documents(request(json!({"query": "quick fox", "mode": "hybrid", "limit": 5})))
      .await;
    assert!(response.error.is_none(), "{:?}", response.error);
  }

  #[tokio::test]
  async fn test_search_by_metadata() {
    let (_dir, handler) = test_handler().await;
    handler
      .document_create(Request {
        jsonrpc: "2.0".to_string(),
        id: Some(json!(1)),
        method: "document_create".to_string(),
        params: json!({"title": "T", "custom_metadata": {"team": "infra"}}),
      })
      .await;

    let hit = handler
      .search_by_metadata(request(json!({"key": "team", "value": "infra"})))
      .await;
    assert_eq!(hit.result.unwrap()["count"], 1);

    let miss = handler
      .search_by_metadata(request(json!({"key": "team", "value": "web"})))
      .await;
    assert_eq!(miss.result.unwrap()["count"], 0);
  }

  #[tokio::test]
  async fn test_search_stream_pages() {
    let (_dir, handler) = test_handler().await;
    seed(&handler, 5).await;

    let opened = handler
      .search_stream(request(json!({"query": "quick", "mode": "text", "limit": 5, "batch_size": 2})))
      .await;
    assert!(opened.error.is_none(), "{:?}", opened.error);
    let result = opened.result.unwrap();
    let mut total = result["batch"].as_array().unwrap().len();
    let mut cursor = result["cursor"].as_str().map(String::from);
    let mut done = result["done"].as_bool().unwrap();

    while let Some(id) = cursor.clone() {
      if done {
        break;
      }
      let next = handler.search_stream(request(json!({"cursor": id}))).await;
      let result = next.result.unwrap();
      total += result["batch"].as_array().unwrap().len();
      done = result["done"].as_bool().unwrap();
      cursor = result["cursor"].as_str().map(String::from);
    }
    assert_eq!(total, 5);
  }
}
