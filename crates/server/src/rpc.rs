//! JSON-RPC 2.0 framing and the stable error-code table.

use db::DbError;
use embedding::EmbeddingError;
use serde::{Deserialize, Serialize};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const DATASET_NOT_FOUND: i32 = -32000;
pub const DOCUMENT_NOT_FOUND: i32 = -32001;
pub const EMBEDDING_ERROR: i32 = -32002;
pub const INVALID_SEARCH_MODE: i32 = -32003;
pub const FILTER_PARSE_ERROR: i32 = -32004;
// Security chain codes (outside the tool-error table)
pub const UNAUTHORIZED: i32 = -32010;
pub const FORBIDDEN: i32 = -32011;
pub const RATE_LIMITED: i32 = -32012;

/// JSON-RPC request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  #[serde(default = "default_jsonrpc")]
  pub jsonrpc: String,
  #[serde(default)]
  pub id: Option<serde_json::Value>,
  pub method: String,
  #[serde(default)]
  pub params: serde_json::Value,
}

fn default_jsonrpc() -> String {
  "2.0".to_string()
}

/// JSON-RPC response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  pub jsonrpc: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
  pub code: i32,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<serde_json::Value>,
}

impl Response {
  pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
    Self {
      jsonrpc: "2.0".to_string(),
      id,
      result: Some(result),
      error: None,
    }
  }

  pub fn error(id: Option<serde_json::Value>, code: i32, message: &str) -> Self {
    Self {
      jsonrpc: "2.0".to_string(),
      id,
      result: None,
      error: Some(RpcError {
        code,
        message: message.to_string(),
        data: None,
      }),
    }
  }

  pub fn error_with(id: Option<serde_json::Value>, code: i32, message: &str, kind: &str, details: &str) -> Self {
    Self::error_full(id, code, message, kind, details, None)
  }

  pub fn error_full(
    id: Option<serde_json::Value>,
    code: i32,
    message: &str,
    kind: &str,
    details: &str,
    suggestion: Option<&str>,
  ) -> Self {
    let mut data = serde_json::json!({ "kind": kind, "details": details });
    if let Some(suggestion) = suggestion {
      data["suggestion"] = serde_json::Value::String(suggestion.to_string());
    }
    Self {
      jsonrpc: "2.0".to_string(),
      id,
      result: None,
      error: Some(RpcError {
        code,
        message: message.to_string(),
        data: Some(data),
      }),
    }
  }

  /// Map an engine error onto the stable code table
  pub fn from_db_error(id: Option<serde_json::Value>, error: DbError) -> Self {
    match &error {
      DbError::NotFound(what) if what.starts_with("dataset") => {
        Self::error_with(id, DATASET_NOT_FOUND, &error.to_string(), "not_found", what)
      }
      DbError::NotFound(what) => Self::error_with(id, DOCUMENT_NOT_FOUND, &error.to_string(), "not_found", what),
      DbError::DuplicateUuid(uuid) => Self::error_full(
        id,
        INVALID_PARAMS,
        &error.to_string(),
        "conflict",
        uuid,
        Some("use document_update or upsert semantics to replace an existing record"),
      ),
      DbError::Validation(v) => Self::error_full(
        id,
        INVALID_PARAMS,
        &error.to_string(),
        "validation",
        &v.field,
        v.hint.as_deref(),
      ),
      DbError::DimensionMismatch { expected, actual } => Self::error_full(
        id,
        INVALID_PARAMS,
        &error.to_string(),
        "validation",
        &format!("expected {}, got {}", expected, actual),
        Some("re-embed with the dataset's configured model"),
      ),
      DbError::Filter(f) => Self::error_with(
        id,
        FILTER_PARSE_ERROR,
        &error.to_string(),
        "filter_parse",
        &format!("position {}", f.position),
      ),
      DbError::Conflict { expected, actual } => Self::error_full(
        id,
        INTERNAL_ERROR,
        &error.to_string(),
        "conflict",
        &format!("expected version {}, found {}", expected, actual),
        Some("re-read the record and retry"),
      ),
      DbError::BlobScan(details) => {
        Self::error_with(id, INTERNAL_ERROR, &error.to_string(), "blob_scan", details)
      }
      DbError::ReadOnly(details) => Self::error_with(id, INTERNAL_ERROR, &error.to_string(), "read_only", details),
      _ => Self::error_with(id, INTERNAL_ERROR, &error.to_string(), "storage", "backend failure"),
    }
  }

  /// Map an embedder failure (wrapped, surfaced verbatim in details)
  pub fn from_embedding_error(id: Option<serde_json::Value>, error: EmbeddingError) -> Self {
    Self::error_with(id, EMBEDDING_ERROR, "Embedding failed", "dependency", &error.to_string())
  }
}
