//! MCP tool implementations.
//!
//! Every tool is an async method on [`ToolHandler`] taking the JSON-RPC
//! request and returning a complete response. Parameter validation failures
//! map to `-32602`; engine errors go through the stable code table in
//! `rpc.rs`.

mod collections;
mod documents;
mod search;
mod system;
mod transfer;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use db::Dataset;
use embedding::{Embedder, HashEmbedder, RetryingEmbedder};
use frame_core::validation::ValidationError;
use frame_core::{ChunkSplitter, Clock, Config, Filter, IdGenerator, Record, SentenceSplitter, SystemClock, UuidGenerator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::rpc::{FILTER_PARSE_ERROR, INVALID_PARAMS, Response};
use crate::tasks::TaskManager;

/// Server-side cursor for `search_stream`
pub(crate) struct SearchCursor {
  pub hits: Vec<serde_json::Value>,
  pub offset: usize,
  pub batch_size: usize,
}

/// Shared state behind every tool
pub struct ToolHandler {
  pub(crate) dataset: Arc<Dataset>,
  pub(crate) embedder: Arc<dyn Embedder>,
  pub(crate) splitter: Arc<dyn ChunkSplitter>,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) ids: Arc<dyn IdGenerator>,
  pub(crate) config: Arc<Config>,
  pub(crate) tasks: Arc<TaskManager>,
  pub(crate) cursors: Mutex<HashMap<String, SearchCursor>>,
}

impl ToolHandler {
  /// Handler with system defaults: deterministic hash embedder, sentence
  /// splitter, wall clock, random v4 uuids.
  pub fn new(dataset: Arc<Dataset>, config: Arc<Config>) -> Self {
    let dim = dataset.vector_dim;
    Self {
      dataset,
      embedder: Arc::new(HashEmbedder::new(dim)),
      splitter: Arc::new(SentenceSplitter),
      clock: Arc::new(SystemClock),
      ids: Arc::new(UuidGenerator),
      config,
      tasks: Arc::new(TaskManager::new()),
      cursors: Mutex::new(HashMap::new()),
    }
  }

  /// Replace the embedder. Plugged-in providers get wrapped with
  /// per-attempt deadlines and bounded retries, so transient failures are
  /// retried before surfacing as an embedding error.
  pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
    self.embedder = Arc::new(RetryingEmbedder::new(embedder));
    self
  }

  pub fn with_splitter(mut self, splitter: Arc<dyn ChunkSplitter>) -> Self {
    self.splitter = splitter;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
    self.ids = ids;
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Today's date in the record format
  pub(crate) fn today(&self) -> String {
    self.clock.today().format(frame_core::DATE_FORMAT).to_string()
  }

  /// Embed one text through the configured embedder
  pub(crate) async fn embed_one(&self, text: &str) -> Result<Vec<f32>, embedding::EmbeddingError> {
    let mut vectors = self.embedder.embed(&[text]).await?;
    vectors
      .pop()
      .ok_or_else(|| embedding::EmbeddingError::Provider("embedder returned no vector".to_string()))
  }

  /// Build a record from create-style params: server-assigned uuid and
  /// dates, base64 blob decoding, then full schema validation.
  pub(crate) fn record_from_params(&self, params: &serde_json::Value) -> Result<Record, ValidationError> {
    let mut object = params
      .as_object()
      .cloned()
      .ok_or_else(|| ValidationError::invalid_type("params", "object"))?;

    if object.get("uuid").is_none_or(|v| v.is_null()) {
      object.insert("uuid".to_string(), serde_json::Value::String(self.ids.generate()));
    }
    let today = self.today();
    for field in ["created_at", "updated_at"] {
      if object.get(field).is_none_or(|v| v.is_null()) {
        object.insert(field.to_string(), serde_json::Value::String(today.clone()));
      }
    }

    let raw_data = match object.remove("raw_data") {
      Some(serde_json::Value::String(encoded)) => Some(
        BASE64
          .decode(encoded.as_bytes())
          .map_err(|e| ValidationError::new("raw_data", format!("invalid base64: {}", e)))?,
      ),
      Some(serde_json::Value::Null) | None => None,
      Some(_) => return Err(ValidationError::invalid_type("raw_data", "base64 string")),
    };

    let mut record = Record::from_json(serde_json::Value::Object(object))?;
    record.raw_data = raw_data;
    record.validate(Some(self.dataset.vector_dim))?;
    Ok(record)
  }

  /// Serialize a record for the wire, base64-encoding any blob payload
  pub(crate) fn record_to_json(&self, record: &Record) -> serde_json::Value {
    let blob = record.raw_data.as_ref().map(|bytes| BASE64.encode(bytes));
    let mut value = match serde_json::to_value(record) {
      Ok(value) => value,
      Err(_) => serde_json::json!({ "uuid": record.uuid }),
    };
    if let Some(blob) = blob {
      value["raw_data"] = serde_json::Value::String(blob);
    }
    value
  }
}

/// `-32602` from a validation error, with the field in the error data
pub(crate) fn invalid_params(id: Option<serde_json::Value>, error: &ValidationError) -> Response {
  Response::error_full(
    id,
    INVALID_PARAMS,
    &format!("Invalid params: {}", error),
    "validation",
    &error.field,
    error.hint.as_deref(),
  )
}

/// Parse an optional filter param, mapping failures to `-32004`
pub(crate) fn parse_filter_param(
  id: &Option<serde_json::Value>,
  params: &serde_json::Value,
) -> Result<Option<Filter>, Response> {
  match params.get("filter") {
    None | Some(serde_json::Value::Null) => Ok(None),
    Some(serde_json::Value::String(text)) => match Filter::parse(text) {
      Ok(filter) => Ok(Some(filter)),
      Err(e) => Err(Response::error_with(
        id.clone(),
        FILTER_PARSE_ERROR,
        &format!("Filter parse error: {}", e),
        "filter_parse",
        &format!("position {}", e.position),
      )),
    },
    Some(_) => Err(invalid_params(
      id.clone(),
      &ValidationError::invalid_type("filter", "string"),
    )),
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use frame_core::FixedClock;
  use std::collections::HashMap as Map;
  use tempfile::TempDir;

  pub(crate) async fn test_handler() -> (TempDir, ToolHandler) {
    let dir = TempDir::new().unwrap();
    let uri = format!("file://{}/ds.lance", dir.path().display());
    let dataset = Arc::new(Dataset::create(&uri, 8, &Map::new()).await.unwrap());
    let handler = ToolHandler::new(dataset, Arc::new(Config::default()))
      .with_clock(Arc::new(FixedClock(chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())));
    (dir, handler)
  }

  #[tokio::test]
  async fn test_record_from_params_defaults() {
    let (_dir, handler) = test_handler().await;
    let record = handler
      .record_from_params(&serde_json::json!({"title": "T"}))
      .unwrap();
    assert_eq!(record.created_at, "2024-06-01");
    assert!(!record.uuid.is_empty());
  }

  #[tokio::test]
  async fn test_record_from_params_rejects_unknown_field() {
    let (_dir, handler) = test_handler().await;
    let err = handler
      .record_from_params(&serde_json::json!({"title": "T", "wat": 1}))
      .unwrap_err();
    assert_eq!(err.field, "wat");
  }

  #[tokio::test]
  async fn test_blob_base64_roundtrip() {
    let (_dir, handler) = test_handler().await;
    let record = handler
      .record_from_params(&serde_json::json!({
        "title": "T",
        "raw_data": BASE64.encode(b"bytes"),
        "raw_data_type": "application/octet-stream",
      }))
      .unwrap();
    assert_eq!(record.raw_data.as_deref(), Some(b"bytes".as_slice()));

    let json = handler.record_to_json(&record);
    assert_eq!(json["raw_data"].as_str().unwrap(), BASE64.encode(b"bytes"));
  }
}
