use crate::validation::{ValidationError, ValidationResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a record within a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
  #[default]
  Document,
  CollectionHeader,
  DatasetHeader,
  Frameset,
}

impl RecordType {
  pub fn as_str(&self) -> &'static str {
    match self {
      RecordType::Document => "document",
      RecordType::CollectionHeader => "collection_header",
      RecordType::DatasetHeader => "dataset_header",
      RecordType::Frameset => "frameset",
    }
  }

  pub const ALL: &'static [&'static str] = &["document", "collection_header", "dataset_header", "frameset"];
}

impl std::str::FromStr for RecordType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "document" => Ok(RecordType::Document),
      "collection_header" => Ok(RecordType::CollectionHeader),
      "dataset_header" => Ok(RecordType::DatasetHeader),
      "frameset" => Ok(RecordType::Frameset),
      _ => Err(format!("Unknown record type: {}", s)),
    }
  }
}

/// Editorial status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
  Draft,
  Published,
  Archived,
  Deprecated,
}

impl Status {
  pub fn as_str(&self) -> &'static str {
    match self {
      Status::Draft => "draft",
      Status::Published => "published",
      Status::Archived => "archived",
      Status::Deprecated => "deprecated",
    }
  }

  pub const ALL: &'static [&'static str] = &["draft", "published", "archived", "deprecated"];
}

impl std::str::FromStr for Status {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "draft" => Ok(Status::Draft),
      "published" => Ok(Status::Published),
      "archived" => Ok(Status::Archived),
      "deprecated" => Ok(Status::Deprecated),
      _ => Err(format!("Unknown status: {}", s)),
    }
  }
}

/// Typed outgoing edge between records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
  Parent,
  Child,
  Related,
  Reference,
  Contains,
  MemberOf,
}

impl RelationshipType {
  pub fn as_str(&self) -> &'static str {
    match self {
      RelationshipType::Parent => "parent",
      RelationshipType::Child => "child",
      RelationshipType::Related => "related",
      RelationshipType::Reference => "reference",
      RelationshipType::Contains => "contains",
      RelationshipType::MemberOf => "member_of",
    }
  }

  pub const ALL: &'static [&'static str] = &["parent", "child", "related", "reference", "contains", "member_of"];
}

impl std::str::FromStr for RelationshipType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "parent" => Ok(RelationshipType::Parent),
      "child" => Ok(RelationshipType::Child),
      "related" => Ok(RelationshipType::Related),
      "reference" => Ok(RelationshipType::Reference),
      "contains" => Ok(RelationshipType::Contains),
      "member_of" => Ok(RelationshipType::MemberOf),
      _ => Err(format!("Unknown relationship type: {}", s)),
    }
  }
}

/// A typed, non-owning reference to another record.
///
/// At least one of `id`, `uri`, `path`, `cid` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
  #[serde(rename = "type")]
  pub rel_type: RelationshipType,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub uri: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cid: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

impl Relationship {
  /// Relationship pointing at another record by uuid
  pub fn to_id(rel_type: RelationshipType, id: impl Into<String>) -> Self {
    Self {
      rel_type,
      id: Some(id.into()),
      uri: None,
      path: None,
      cid: None,
      title: None,
      description: None,
    }
  }

  /// `member_of` edge pointing at a collection header or frameset source
  pub fn member_of(id: impl Into<String>) -> Self {
    Self::to_id(RelationshipType::MemberOf, id)
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  /// Whether any identifier field is set
  pub fn has_target(&self) -> bool {
    self.id.is_some() || self.uri.is_some() || self.path.is_some() || self.cid.is_some()
  }
}

/// Date format used throughout the dataset
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `YYYY-MM-DD` date string
pub fn parse_date(s: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// Top-level record fields accepted on JSON intake. Unknown keys outside this
/// set are rejected unless they carry the `x_` extension prefix.
pub const KNOWN_FIELDS: &[&str] = &[
  "uuid",
  "title",
  "record_type",
  "text_content",
  "context",
  "vector",
  "created_at",
  "updated_at",
  "version",
  "author",
  "contributors",
  "tags",
  "status",
  "collection",
  "collection_id",
  "collection_id_type",
  "position",
  "source_file",
  "source_type",
  "source_url",
  "local_path",
  "uri",
  "cid",
  "relationships",
  "custom_metadata",
  "raw_data",
  "raw_data_type",
];

/// A single document-shaped entity (a.k.a. Frame)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub uuid: String,
  pub title: String,
  #[serde(default)]
  pub record_type: RecordType,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub text_content: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub context: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub vector: Option<Vec<f32>>,

  pub created_at: String,
  pub updated_at: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub author: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub contributors: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<Status>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub collection: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub collection_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub collection_id_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub position: Option<i32>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_file: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub local_path: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub uri: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cid: Option<String>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub relationships: Vec<Relationship>,
  /// Ordered (key, value) pairs; keys unique per record
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub custom_metadata: Vec<(String, String)>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub raw_data: Option<Vec<u8>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub raw_data_type: Option<String>,
}

impl Record {
  /// Create a record with server-assigned defaults (fresh v4 uuid, today's dates)
  pub fn new(title: impl Into<String>) -> Self {
    let today = chrono::Utc::now().date_naive().format(DATE_FORMAT).to_string();
    Self {
      uuid: Uuid::new_v4().to_string(),
      title: title.into(),
      record_type: RecordType::Document,
      text_content: None,
      context: None,
      vector: None,
      created_at: today.clone(),
      updated_at: today,
      version: None,
      author: None,
      contributors: Vec::new(),
      tags: Vec::new(),
      status: None,
      collection: None,
      collection_id: None,
      collection_id_type: None,
      position: None,
      source_file: None,
      source_type: None,
      source_url: None,
      local_path: None,
      uri: None,
      cid: None,
      relationships: Vec::new(),
      custom_metadata: Vec::new(),
      raw_data: None,
      raw_data_type: None,
    }
  }

  pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
    self.uuid = uuid.into();
    self
  }

  pub fn with_text(mut self, text: impl Into<String>) -> Self {
    self.text_content = Some(text.into());
    self
  }

  pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
    self.vector = Some(vector);
    self
  }

  pub fn with_record_type(mut self, record_type: RecordType) -> Self {
    self.record_type = record_type;
    self
  }

  /// Parse a record from JSON, rejecting unknown top-level fields.
  ///
  /// Keys prefixed `x_` belong to the forward-compatible extension namespace
  /// and are silently dropped. Custom-metadata values that are not strings
  /// are JSON-encoded so they round-trip losslessly.
  pub fn from_json(value: serde_json::Value) -> ValidationResult<Self> {
    let mut obj = match value {
      serde_json::Value::Object(map) => map,
      _ => return Err(ValidationError::invalid_type("record", "object")),
    };

    let unknown: Vec<String> = obj
      .keys()
      .filter(|k| !KNOWN_FIELDS.contains(&k.as_str()) && !k.starts_with("x_"))
      .cloned()
      .collect();
    if let Some(key) = unknown.first() {
      return Err(
        ValidationError::new(key.clone(), "unknown field").with_hint("prefix extension fields with x_ or remove them"),
      );
    }
    obj.retain(|k, _| KNOWN_FIELDS.contains(&k.as_str()));

    // Normalize custom_metadata: accept an object or a [{key, value}] array,
    // stringifying non-string values as JSON.
    if let Some(meta) = obj.remove("custom_metadata") {
      let pairs = custom_metadata_from_json(meta)?;
      let value =
        serde_json::to_value(&pairs).map_err(|e| ValidationError::new("custom_metadata", e.to_string()))?;
      obj.insert("custom_metadata".to_string(), value);
    }

    serde_json::from_value(serde_json::Value::Object(obj))
      .map_err(|e| ValidationError::new("record", e.to_string()))
  }

  /// Validate the record against the schema rules.
  ///
  /// `dim` is the dataset's vector dimension; pass `None` to skip the
  /// dimension check (e.g. before the dataset is known).
  pub fn validate(&self, dim: Option<usize>) -> ValidationResult<()> {
    if Uuid::parse_str(&self.uuid).is_err() {
      return Err(
        ValidationError::new("uuid", format!("'{}' is not a valid UUID", self.uuid))
          .with_hint("use a stringified v4 UUID"),
      );
    }

    if self.title.trim().is_empty() {
      return Err(ValidationError::missing("title"));
    }

    if let (Some(vector), Some(dim)) = (self.vector.as_ref(), dim)
      && vector.len() != dim
    {
      return Err(
        ValidationError::new(
          "vector",
          format!("has dimension {} but the dataset expects {}", vector.len(), dim),
        )
        .with_hint("re-embed with the dataset's configured model"),
      );
    }

    for (field, value) in [("created_at", &self.created_at), ("updated_at", &self.updated_at)] {
      if parse_date(value).is_none() {
        return Err(ValidationError::bad_date(field, value));
      }
    }

    for (i, rel) in self.relationships.iter().enumerate() {
      if !rel.has_target() {
        return Err(
          ValidationError::new(
            format!("relationships[{}]", i),
            "must carry at least one of id, uri, path, cid",
          )
          .with_hint("set the target record's uuid in 'id'"),
        );
      }
    }

    let mut seen = std::collections::HashSet::new();
    for (key, _) in &self.custom_metadata {
      if !seen.insert(key.as_str()) {
        return Err(ValidationError::new(
          "custom_metadata",
          format!("duplicate key '{}'", key),
        ));
      }
    }

    match self.record_type {
      RecordType::CollectionHeader => {
        if self.collection.as_deref().is_none_or(|c| c.trim().is_empty()) {
          return Err(
            ValidationError::missing("collection").with_hint("collection_header records must name their collection"),
          );
        }
      }
      RecordType::Frameset => {
        let has_members = self
          .relationships
          .iter()
          .any(|r| r.rel_type == RelationshipType::MemberOf);
        if !has_members {
          return Err(ValidationError::new(
            "relationships",
            "frameset records must carry member_of relationships to their source documents",
          ));
        }
        if self.context.as_deref().is_none_or(|c| c.trim().is_empty()) {
          return Err(
            ValidationError::missing("context").with_hint("describe the query that produced this frameset"),
          );
        }
      }
      RecordType::Document | RecordType::DatasetHeader => {}
    }

    Ok(())
  }

  /// Iterate `member_of` target uuids
  pub fn member_of_ids(&self) -> impl Iterator<Item = &str> {
    self
      .relationships
      .iter()
      .filter(|r| r.rel_type == RelationshipType::MemberOf)
      .filter_map(|r| r.id.as_deref())
  }
}

/// Normalize a JSON custom-metadata payload into ordered (key, value) pairs.
///
/// String values pass through; everything else is JSON-encoded, which
/// round-trips losslessly for callers that layer their own convention.
pub fn custom_metadata_from_json(value: serde_json::Value) -> ValidationResult<Vec<(String, String)>> {
  match value {
    serde_json::Value::Null => Ok(Vec::new()),
    serde_json::Value::Object(map) => Ok(
      map
        .into_iter()
        .map(|(k, v)| (k, stringify_metadata_value(v)))
        .collect(),
    ),
    serde_json::Value::Array(items) => {
      let mut pairs = Vec::with_capacity(items.len());
      for (i, item) in items.into_iter().enumerate() {
        let field = format!("custom_metadata[{}]", i);
        let obj = item
          .as_object()
          .ok_or_else(|| ValidationError::invalid_type(field.clone(), "object with key and value"))?;
        let key = obj
          .get("key")
          .and_then(|k| k.as_str())
          .ok_or_else(|| ValidationError::missing(format!("{}.key", field)))?;
        let value = obj
          .get("value")
          .cloned()
          .ok_or_else(|| ValidationError::missing(format!("{}.value", field)))?;
        pairs.push((key.to_string(), stringify_metadata_value(value)));
      }
      Ok(pairs)
    }
    _ => Err(ValidationError::invalid_type("custom_metadata", "object or array")),
  }
}

fn stringify_metadata_value(value: serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s,
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn valid_record() -> Record {
    Record::new("Test").with_text("hello world")
  }

  #[test]
  fn test_new_record_defaults() {
    let r = Record::new("T");
    assert!(Uuid::parse_str(&r.uuid).is_ok());
    assert_eq!(r.record_type, RecordType::Document);
    assert!(parse_date(&r.created_at).is_some());
    assert_eq!(r.created_at, r.updated_at);
  }

  #[test]
  fn test_validate_ok() {
    assert!(valid_record().validate(Some(4)).is_ok());
    assert!(valid_record().with_vector(vec![0.0; 4]).validate(Some(4)).is_ok());
  }

  #[test]
  fn test_validate_bad_uuid() {
    let r = valid_record().with_uuid("not-a-uuid");
    let err = r.validate(None).unwrap_err();
    assert_eq!(err.field, "uuid");
  }

  #[test]
  fn test_validate_wrong_dimension() {
    let r = valid_record().with_vector(vec![0.0; 3]);
    let err = r.validate(Some(4)).unwrap_err();
    assert_eq!(err.field, "vector");
    assert!(err.message.contains("dimension 3"));
  }

  #[test]
  fn test_validate_bad_date() {
    let mut r = valid_record();
    r.created_at = "01/02/2024".to_string();
    let err = r.validate(None).unwrap_err();
    assert_eq!(err.field, "created_at");
  }

  #[test]
  fn test_validate_relationship_without_target() {
    let mut r = valid_record();
    r.relationships.push(Relationship {
      rel_type: RelationshipType::Related,
      id: None,
      uri: None,
      path: None,
      cid: None,
      title: None,
      description: None,
    });
    let err = r.validate(None).unwrap_err();
    assert!(err.field.starts_with("relationships"));
  }

  #[test]
  fn test_validate_duplicate_metadata_key() {
    let mut r = valid_record();
    r.custom_metadata = vec![("a".into(), "1".into()), ("a".into(), "2".into())];
    let err = r.validate(None).unwrap_err();
    assert!(err.message.contains("duplicate key 'a'"));
  }

  #[test]
  fn test_collection_header_requires_collection() {
    let r = valid_record().with_record_type(RecordType::CollectionHeader);
    assert!(r.validate(None).is_err());

    let mut r = valid_record().with_record_type(RecordType::CollectionHeader);
    r.collection = Some("A".to_string());
    assert!(r.validate(None).is_ok());
  }

  #[test]
  fn test_frameset_requires_members_and_context() {
    let mut r = valid_record().with_record_type(RecordType::Frameset);
    r.context = Some("what is hybrid search?".to_string());
    assert!(r.validate(None).is_err());

    r.relationships.push(Relationship::member_of(Uuid::new_v4().to_string()));
    assert!(r.validate(None).is_ok());
  }

  #[test]
  fn test_from_json_rejects_unknown_field() {
    let value = json!({"uuid": Uuid::new_v4().to_string(), "title": "T",
      "created_at": "2024-01-01", "updated_at": "2024-01-01", "bogus": 1});
    let err = Record::from_json(value).unwrap_err();
    assert_eq!(err.field, "bogus");
  }

  #[test]
  fn test_from_json_allows_extension_namespace() {
    let value = json!({"uuid": Uuid::new_v4().to_string(), "title": "T",
      "created_at": "2024-01-01", "updated_at": "2024-01-01", "x_pipeline": "v2"});
    assert!(Record::from_json(value).is_ok());
  }

  #[test]
  fn test_custom_metadata_stringifies_non_strings() {
    let pairs = custom_metadata_from_json(json!({"a": "plain", "b": 3, "c": {"k": true}})).unwrap();
    assert!(pairs.contains(&("a".to_string(), "plain".to_string())));
    assert!(pairs.contains(&("b".to_string(), "3".to_string())));
    assert!(pairs.contains(&("c".to_string(), "{\"k\":true}".to_string())));

    // Lossless round-trip for the JSON-encoded values
    let encoded = pairs.iter().find(|(k, _)| k == "c").unwrap().1.clone();
    let decoded: serde_json::Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, json!({"k": true}));
  }

  #[test]
  fn test_custom_metadata_pair_array_form() {
    let pairs = custom_metadata_from_json(json!([{"key": "a", "value": "1"}, {"key": "b", "value": 2}])).unwrap();
    assert_eq!(pairs, vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
  }

  #[test]
  fn test_record_json_roundtrip() {
    let mut r = valid_record().with_vector(vec![0.0, 1.0]);
    r.tags = vec!["x".to_string()];
    r.relationships.push(Relationship::member_of("abc"));
    r.custom_metadata = vec![("k".to_string(), "v".to_string())];

    let json = serde_json::to_value(&r).unwrap();
    let back: Record = serde_json::from_value(json).unwrap();
    assert_eq!(r, back);
  }

  #[test]
  fn test_record_type_parse() {
    assert_eq!("frameset".parse::<RecordType>().unwrap(), RecordType::Frameset);
    assert!("card".parse::<RecordType>().is_err());
  }
}
