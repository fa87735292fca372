use arrow_schema::{DataType, Field, Fields, Schema};
use std::sync::Arc;

/// Name of the single table holding a dataset's records
pub const FRAMES_TABLE: &str = "frames";

/// Columns holding large binary payloads. Excluded from every filtered scan;
/// reached only through the explicit blob-fetch path.
pub const BLOB_COLUMNS: &[&str] = &["raw_data"];

/// Text columns covered by the full-text index
pub const FTS_COLUMNS: &[&str] = &["title", "text_content", "context"];

/// Struct fields of one relationship edge
pub fn relationship_fields() -> Fields {
  Fields::from(vec![
    Field::new("type", DataType::Utf8, true),
    Field::new("id", DataType::Utf8, true),
    Field::new("uri", DataType::Utf8, true),
    Field::new("path", DataType::Utf8, true),
    Field::new("cid", DataType::Utf8, true),
    Field::new("title", DataType::Utf8, true),
    Field::new("description", DataType::Utf8, true),
  ])
}

/// Struct fields of one custom-metadata (key, value) pair. The storage layer
/// has no map type, so metadata persists as an ordered list of string pairs.
pub fn metadata_fields() -> Fields {
  Fields::from(vec![
    Field::new("key", DataType::Utf8, true),
    Field::new("value", DataType::Utf8, true),
  ])
}

fn string_list() -> DataType {
  DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)))
}

/// Schema for the frames table
pub fn frames_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("uuid", DataType::Utf8, false),
    Field::new("title", DataType::Utf8, false),
    Field::new("record_type", DataType::Utf8, false),
    Field::new("text_content", DataType::Utf8, true),
    Field::new("context", DataType::Utf8, true),
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      true,
    ),
    Field::new("created_at", DataType::Utf8, false), // YYYY-MM-DD
    Field::new("updated_at", DataType::Utf8, false),
    Field::new("version", DataType::Utf8, true),
    Field::new("author", DataType::Utf8, true),
    Field::new("contributors", string_list(), true),
    Field::new("tags", string_list(), true),
    Field::new("status", DataType::Utf8, true),
    Field::new("collection", DataType::Utf8, true),
    Field::new("collection_id", DataType::Utf8, true),
    Field::new("collection_id_type", DataType::Utf8, true),
    Field::new("position", DataType::Int32, true),
    Field::new("source_file", DataType::Utf8, true),
    Field::new("source_type", DataType::Utf8, true),
    Field::new("source_url", DataType::Utf8, true),
    Field::new("local_path", DataType::Utf8, true),
    Field::new("uri", DataType::Utf8, true),
    Field::new("cid", DataType::Utf8, true),
    Field::new(
      "relationships",
      DataType::List(Arc::new(Field::new(
        "item",
        DataType::Struct(relationship_fields()),
        true,
      ))),
      true,
    ),
    Field::new(
      "custom_metadata",
      DataType::List(Arc::new(Field::new("item", DataType::Struct(metadata_fields()), true))),
      true,
    ),
    Field::new("raw_data", DataType::LargeBinary, true),
    Field::new("raw_data_type", DataType::Utf8, true),
  ]))
}

/// All column names of the frames table
pub fn all_columns(vector_dim: usize) -> Vec<String> {
  frames_schema(vector_dim)
    .fields()
    .iter()
    .map(|f| f.name().clone())
    .collect()
}

/// The blob-safe projection: every column except blob-typed ones
pub fn blob_safe_columns(vector_dim: usize) -> Vec<String> {
  all_columns(vector_dim)
    .into_iter()
    .filter(|c| !BLOB_COLUMNS.contains(&c.as_str()))
    .collect()
}

/// Recover the vector dimension from a table schema
pub fn vector_dim_of(schema: &Schema) -> Option<usize> {
  match schema.field_with_name("vector").ok()?.data_type() {
    DataType::FixedSizeList(_, dim) => Some(*dim as usize),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_frames_schema_fields() {
    let schema = frames_schema(4);
    assert!(schema.field_with_name("uuid").is_ok());
    assert!(schema.field_with_name("relationships").is_ok());
    assert!(schema.field_with_name("custom_metadata").is_ok());
    assert!(schema.field_with_name("raw_data").is_ok());
  }

  #[test]
  fn test_blob_safe_columns_exclude_blob() {
    let cols = blob_safe_columns(4);
    assert!(!cols.contains(&"raw_data".to_string()));
    assert!(cols.contains(&"raw_data_type".to_string()));
    assert!(cols.contains(&"uuid".to_string()));
  }

  #[test]
  fn test_vector_dim_roundtrip() {
    let schema = frames_schema(128);
    assert_eq!(vector_dim_of(&schema), Some(128));
  }
}
