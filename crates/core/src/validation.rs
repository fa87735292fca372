//! Input validation utilities
//!
//! Centralized validation helpers with consistent error messages. Used both by
//! the record model and by the MCP tool layer when checking JSON params.

use std::fmt;
use thiserror::Error;

/// A validation error with field information and an optional remediation hint
#[derive(Debug, Clone, Error)]
pub struct ValidationError {
  pub field: String,
  pub message: String,
  pub hint: Option<String>,
}

impl fmt::Display for ValidationError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.hint {
      Some(hint) => write!(f, "{}: {} ({})", self.field, self.message, hint),
      None => write!(f, "{}: {}", self.field, self.message),
    }
  }
}

impl ValidationError {
  pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      message: message.into(),
      hint: None,
    }
  }

  pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
    self.hint = Some(hint.into());
    self
  }

  /// Create error for missing required field
  pub fn missing(field: impl Into<String>) -> Self {
    let field = field.into();
    Self {
      message: format!("{} is required", field),
      field,
      hint: None,
    }
  }

  /// Create error for invalid type
  pub fn invalid_type(field: impl Into<String>, expected: &str) -> Self {
    Self {
      field: field.into(),
      message: format!("expected {}", expected),
      hint: None,
    }
  }

  /// Create error for invalid enum value
  pub fn invalid_enum(field: impl Into<String>, valid_values: &[&str]) -> Self {
    Self {
      field: field.into(),
      message: format!("must be one of: {}", valid_values.join(", ")),
      hint: None,
    }
  }

  /// Create error for a malformed calendar date
  pub fn bad_date(field: impl Into<String>, value: &str) -> Self {
    Self {
      field: field.into(),
      message: format!("'{}' is not a valid date", value),
      hint: Some("use YYYY-MM-DD".to_string()),
    }
  }
}

/// Result type for validation
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a required string field
pub fn require_string(value: Option<&serde_json::Value>, field: &str) -> ValidationResult<String> {
  match value {
    Some(v) => v
      .as_str()
      .map(String::from)
      .ok_or_else(|| ValidationError::invalid_type(field, "string")),
    None => Err(ValidationError::missing(field)),
  }
}

/// Validate an optional string field
pub fn optional_string(value: Option<&serde_json::Value>, field: &str) -> ValidationResult<Option<String>> {
  match value {
    Some(v) if v.is_null() => Ok(None),
    Some(v) => v
      .as_str()
      .map(|s| Some(s.to_string()))
      .ok_or_else(|| ValidationError::invalid_type(field, "string")),
    None => Ok(None),
  }
}

/// Validate an optional unsigned integer field
pub fn optional_usize(value: Option<&serde_json::Value>, field: &str) -> ValidationResult<Option<usize>> {
  match value {
    Some(v) if v.is_null() => Ok(None),
    Some(v) => v
      .as_u64()
      .map(|n| Some(n as usize))
      .ok_or_else(|| ValidationError::invalid_type(field, "non-negative integer")),
    None => Ok(None),
  }
}

/// Validate an optional boolean field
pub fn optional_bool(value: Option<&serde_json::Value>, field: &str) -> ValidationResult<Option<bool>> {
  match value {
    Some(v) if v.is_null() => Ok(None),
    Some(v) => v
      .as_bool()
      .map(Some)
      .ok_or_else(|| ValidationError::invalid_type(field, "boolean")),
    None => Ok(None),
  }
}

/// Validate a required array field
pub fn require_array(value: Option<&serde_json::Value>, field: &str) -> ValidationResult<Vec<serde_json::Value>> {
  match value {
    Some(v) => v
      .as_array()
      .cloned()
      .ok_or_else(|| ValidationError::invalid_type(field, "array")),
    None => Err(ValidationError::missing(field)),
  }
}

/// Validate an optional array of strings
pub fn optional_string_array(value: Option<&serde_json::Value>, field: &str) -> ValidationResult<Option<Vec<String>>> {
  match value {
    Some(v) if v.is_null() => Ok(None),
    Some(v) => {
      let arr = v
        .as_array()
        .ok_or_else(|| ValidationError::invalid_type(field, "array"))?;
      arr
        .iter()
        .enumerate()
        .map(|(i, v)| {
          v.as_str()
            .map(String::from)
            .ok_or_else(|| ValidationError::invalid_type(format!("{}[{}]", field, i), "string"))
        })
        .collect::<ValidationResult<Vec<String>>>()
        .map(Some)
    }
    None => Ok(None),
  }
}

/// Validate a required f32 vector field (JSON array of numbers)
pub fn require_f32_vec(value: Option<&serde_json::Value>, field: &str) -> ValidationResult<Vec<f32>> {
  let arr = require_array(value, field)?;
  arr
    .into_iter()
    .enumerate()
    .map(|(i, v)| {
      v.as_f64()
        .map(|n| n as f32)
        .ok_or_else(|| ValidationError::invalid_type(format!("{}[{}]", field, i), "number"))
    })
    .collect()
}

/// Validate an enum value (string must match one of the valid values)
pub fn require_enum<'a>(
  value: Option<&serde_json::Value>,
  field: &str,
  valid_values: &[&'a str],
) -> ValidationResult<&'a str> {
  let s = require_string(value, field)?;
  valid_values
    .iter()
    .find(|&&v| v.eq_ignore_ascii_case(&s))
    .copied()
    .ok_or_else(|| ValidationError::invalid_enum(field, valid_values))
}

/// Validate an optional enum value
pub fn optional_enum<'a>(
  value: Option<&serde_json::Value>,
  field: &str,
  valid_values: &[&'a str],
) -> ValidationResult<Option<&'a str>> {
  match optional_string(value, field)? {
    Some(s) => valid_values
      .iter()
      .find(|&&v| v.eq_ignore_ascii_case(&s))
      .copied()
      .map(Some)
      .ok_or_else(|| ValidationError::invalid_enum(field, valid_values)),
    None => Ok(None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_require_string() {
    let obj = json!({"title": "hello"});
    assert_eq!(require_string(obj.get("title"), "title").unwrap(), "hello");
    assert!(require_string(obj.get("missing"), "missing").is_err());

    let obj = json!({"title": 7});
    assert!(require_string(obj.get("title"), "title").is_err());
  }

  #[test]
  fn test_optional_string_null_is_none() {
    let obj = json!({"author": null});
    assert_eq!(optional_string(obj.get("author"), "author").unwrap(), None);
  }

  #[test]
  fn test_optional_usize() {
    let obj = json!({"limit": 25});
    assert_eq!(optional_usize(obj.get("limit"), "limit").unwrap(), Some(25));

    let obj = json!({"limit": -3});
    assert!(optional_usize(obj.get("limit"), "limit").is_err());
  }

  #[test]
  fn test_require_f32_vec() {
    let obj = json!({"vector": [0.0, 1.0, 0.5]});
    let v = require_f32_vec(obj.get("vector"), "vector").unwrap();
    assert_eq!(v.len(), 3);

    let obj = json!({"vector": [0.0, "x"]});
    let err = require_f32_vec(obj.get("vector"), "vector").unwrap_err();
    assert!(err.field.contains("[1]"));
  }

  #[test]
  fn test_require_enum_case_insensitive() {
    let obj = json!({"mode": "Hybrid"});
    assert_eq!(
      require_enum(obj.get("mode"), "mode", &["text", "vector", "hybrid"]).unwrap(),
      "hybrid"
    );

    let obj = json!({"mode": "fuzzy"});
    let err = require_enum(obj.get("mode"), "mode", &["text", "vector", "hybrid"]).unwrap_err();
    assert!(err.message.contains("one of: text, vector, hybrid"));
  }

  #[test]
  fn test_optional_string_array() {
    let obj = json!({"tags": ["a", "b"]});
    assert_eq!(
      optional_string_array(obj.get("tags"), "tags").unwrap(),
      Some(vec!["a".to_string(), "b".to_string()])
    );

    let obj = json!({"tags": [1]});
    assert!(optional_string_array(obj.get("tags"), "tags").is_err());
  }

  #[test]
  fn test_hint_rendering() {
    let err = ValidationError::bad_date("created_at", "01/02/2024");
    let rendered = err.to_string();
    assert!(rendered.contains("created_at"));
    assert!(rendered.contains("YYYY-MM-DD"));
  }
}
