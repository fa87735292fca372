//! Conversion between in-memory records and Arrow record batches.
//!
//! `relationships` and `custom_metadata` persist as `List<Struct>` columns;
//! `vector` as `FixedSizeList<Float32, D>`; `raw_data` as `LargeBinary`.
//! Reads tolerate projected-away columns so the blob-safe scan path can hand
//! its batches straight back through `batch_to_records`.

use arrow_array::{
  Array, ArrayRef, FixedSizeListArray, Float32Array, Int32Array, LargeBinaryArray, ListArray, RecordBatch,
  StringArray, StructArray,
};
use arrow::buffer::{NullBuffer, OffsetBuffer};
use arrow_schema::{DataType, Field};
use frame_core::{Record, Relationship};
use std::sync::Arc;

use crate::dataset::{DbError, Result};
use crate::schema::{frames_schema, metadata_fields, relationship_fields};

/// Convert records to a single Arrow batch matching `frames_schema(dim)`
pub fn records_to_batch(records: &[Record], dim: usize) -> Result<RecordBatch> {
  for record in records {
    if let Some(vector) = &record.vector
      && vector.len() != dim
    {
      return Err(DbError::DimensionMismatch {
        expected: dim,
        actual: vector.len(),
      });
    }
  }

  let opt = |f: fn(&Record) -> Option<&str>| -> ArrayRef {
    Arc::new(StringArray::from(
      records.iter().map(|r| f(r)).collect::<Vec<Option<&str>>>(),
    ))
  };

  let uuid: ArrayRef = Arc::new(StringArray::from(
    records.iter().map(|r| r.uuid.as_str()).collect::<Vec<&str>>(),
  ));
  let title: ArrayRef = Arc::new(StringArray::from(
    records.iter().map(|r| r.title.as_str()).collect::<Vec<&str>>(),
  ));
  let record_type: ArrayRef = Arc::new(StringArray::from(
    records.iter().map(|r| r.record_type.as_str()).collect::<Vec<&str>>(),
  ));
  let created_at: ArrayRef = Arc::new(StringArray::from(
    records.iter().map(|r| r.created_at.as_str()).collect::<Vec<&str>>(),
  ));
  let updated_at: ArrayRef = Arc::new(StringArray::from(
    records.iter().map(|r| r.updated_at.as_str()).collect::<Vec<&str>>(),
  ));
  let status: ArrayRef = Arc::new(StringArray::from(
    records
      .iter()
      .map(|r| r.status.map(|s| s.as_str()))
      .collect::<Vec<Option<&str>>>(),
  ));
  let position: ArrayRef = Arc::new(Int32Array::from(
    records.iter().map(|r| r.position).collect::<Vec<Option<i32>>>(),
  ));

  let raw_data: ArrayRef = Arc::new(LargeBinaryArray::from(
    records
      .iter()
      .map(|r| r.raw_data.as_deref())
      .collect::<Vec<Option<&[u8]>>>(),
  ));

  let batch = RecordBatch::try_new(
    frames_schema(dim),
    vec![
      uuid,
      title,
      record_type,
      opt(|r| r.text_content.as_deref()),
      opt(|r| r.context.as_deref()),
      vectors_to_array(records, dim)?,
      created_at,
      updated_at,
      opt(|r| r.version.as_deref()),
      opt(|r| r.author.as_deref()),
      string_lists_to_array(records.iter().map(|r| r.contributors.as_slice()))?,
      string_lists_to_array(records.iter().map(|r| r.tags.as_slice()))?,
      status,
      opt(|r| r.collection.as_deref()),
      opt(|r| r.collection_id.as_deref()),
      opt(|r| r.collection_id_type.as_deref()),
      position,
      opt(|r| r.source_file.as_deref()),
      opt(|r| r.source_type.as_deref()),
      opt(|r| r.source_url.as_deref()),
      opt(|r| r.local_path.as_deref()),
      opt(|r| r.uri.as_deref()),
      opt(|r| r.cid.as_deref()),
      relationships_to_array(records)?,
      metadata_to_array(records)?,
      raw_data,
      opt(|r| r.raw_data_type.as_deref()),
    ],
  )?;

  Ok(batch)
}

fn vectors_to_array(records: &[Record], dim: usize) -> Result<ArrayRef> {
  let mut values = Vec::with_capacity(records.len() * dim);
  let mut validity = Vec::with_capacity(records.len());
  for record in records {
    match &record.vector {
      Some(vector) => {
        values.extend_from_slice(vector);
        validity.push(true);
      }
      None => {
        values.extend(std::iter::repeat_n(0.0f32, dim));
        validity.push(false);
      }
    }
  }

  let field = Arc::new(Field::new("item", DataType::Float32, true));
  let array = FixedSizeListArray::try_new(
    field,
    dim as i32,
    Arc::new(Float32Array::from(values)),
    Some(NullBuffer::from(validity)),
  )?;
  Ok(Arc::new(array))
}

fn string_lists_to_array<'a>(lists: impl Iterator<Item = &'a [String]>) -> Result<ArrayRef> {
  let mut lengths = Vec::new();
  let mut values = Vec::new();
  for list in lists {
    lengths.push(list.len());
    values.extend(list.iter().map(|s| s.as_str()));
  }

  let array = ListArray::try_new(
    Arc::new(Field::new("item", DataType::Utf8, true)),
    OffsetBuffer::from_lengths(lengths),
    Arc::new(StringArray::from(values)),
    None,
  )?;
  Ok(Arc::new(array))
}

fn relationships_to_array(records: &[Record]) -> Result<ArrayRef> {
  let mut lengths = Vec::with_capacity(records.len());
  let mut types = Vec::new();
  let mut ids = Vec::new();
  let mut uris = Vec::new();
  let mut paths = Vec::new();
  let mut cids = Vec::new();
  let mut titles = Vec::new();
  let mut descriptions = Vec::new();

  for record in records {
    lengths.push(record.relationships.len());
    for rel in &record.relationships {
      types.push(Some(rel.rel_type.as_str().to_string()));
      ids.push(rel.id.clone());
      uris.push(rel.uri.clone());
      paths.push(rel.path.clone());
      cids.push(rel.cid.clone());
      titles.push(rel.title.clone());
      descriptions.push(rel.description.clone());
    }
  }

  let children: Vec<ArrayRef> = vec![
    Arc::new(StringArray::from(types)),
    Arc::new(StringArray::from(ids)),
    Arc::new(StringArray::from(uris)),
    Arc::new(StringArray::from(paths)),
    Arc::new(StringArray::from(cids)),
    Arc::new(StringArray::from(titles)),
    Arc::new(StringArray::from(descriptions)),
  ];
  let fields = relationship_fields();
  let structs = StructArray::try_new(fields.clone(), children, None)?;
  let array = ListArray::try_new(
    Arc::new(Field::new("item", DataType::Struct(fields), true)),
    OffsetBuffer::from_lengths(lengths),
    Arc::new(structs),
    None,
  )?;
  Ok(Arc::new(array))
}

fn metadata_to_array(records: &[Record]) -> Result<ArrayRef> {
  let mut lengths = Vec::with_capacity(records.len());
  let mut keys = Vec::new();
  let mut values = Vec::new();
  for record in records {
    lengths.push(record.custom_metadata.len());
    for (key, value) in &record.custom_metadata {
      keys.push(Some(key.clone()));
      values.push(Some(value.clone()));
    }
  }

  let children: Vec<ArrayRef> = vec![
    Arc::new(StringArray::from(keys)),
    Arc::new(StringArray::from(values)),
  ];
  let fields = metadata_fields();
  let structs = StructArray::try_new(fields.clone(), children, None)?;
  let array = ListArray::try_new(
    Arc::new(Field::new("item", DataType::Struct(fields), true)),
    OffsetBuffer::from_lengths(lengths),
    Arc::new(structs),
    None,
  )?;
  Ok(Arc::new(array))
}

/// Convert every row of a batch into records
pub fn batch_to_records(batch: &RecordBatch) -> Result<Vec<Record>> {
  (0..batch.num_rows()).map(|row| batch_to_record(batch, row)).collect()
}

/// Convert one row of a batch into a record.
///
/// Columns missing from the batch (projected away) read back as their empty
/// defaults; required scalar columns must be present.
pub fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<Record> {
  let required = |name: &str| -> Result<String> {
    string_at(batch, name, row)?.ok_or_else(|| DbError::SchemaMismatch(format!("column {} is null", name)))
  };

  let record_type = required("record_type")?
    .parse()
    .map_err(DbError::SchemaMismatch)?;
  let status = match string_at(batch, "status", row)? {
    Some(s) => Some(s.parse().map_err(DbError::SchemaMismatch)?),
    None => None,
  };

  Ok(Record {
    uuid: required("uuid")?,
    title: required("title")?,
    record_type,
    text_content: string_at(batch, "text_content", row)?,
    context: string_at(batch, "context", row)?,
    vector: vector_at(batch, row),
    created_at: required("created_at")?,
    updated_at: required("updated_at")?,
    version: string_at(batch, "version", row)?,
    author: string_at(batch, "author", row)?,
    contributors: string_list_at(batch, "contributors", row),
    tags: string_list_at(batch, "tags", row),
    status,
    collection: string_at(batch, "collection", row)?,
    collection_id: string_at(batch, "collection_id", row)?,
    collection_id_type: string_at(batch, "collection_id_type", row)?,
    position: int_at(batch, "position", row),
    source_file: string_at(batch, "source_file", row)?,
    source_type: string_at(batch, "source_type", row)?,
    source_url: string_at(batch, "source_url", row)?,
    local_path: string_at(batch, "local_path", row)?,
    uri: string_at(batch, "uri", row)?,
    cid: string_at(batch, "cid", row)?,
    relationships: relationships_at(batch, row)?,
    custom_metadata: metadata_at(batch, row),
    raw_data: blob_of(batch, row),
    raw_data_type: string_at(batch, "raw_data_type", row)?,
  })
}

fn string_at(batch: &RecordBatch, name: &str, row: usize) -> Result<Option<String>> {
  let Some(column) = batch.column_by_name(name) else {
    return Ok(None);
  };
  let array = column
    .as_any()
    .downcast_ref::<StringArray>()
    .ok_or_else(|| DbError::SchemaMismatch(format!("column {} is not a string column", name)))?;
  if array.is_null(row) {
    Ok(None)
  } else {
    Ok(Some(array.value(row).to_string()))
  }
}

fn int_at(batch: &RecordBatch, name: &str, row: usize) -> Option<i32> {
  let array = batch.column_by_name(name)?.as_any().downcast_ref::<Int32Array>()?;
  if array.is_null(row) { None } else { Some(array.value(row)) }
}

fn vector_at(batch: &RecordBatch, row: usize) -> Option<Vec<f32>> {
  let array = batch
    .column_by_name("vector")?
    .as_any()
    .downcast_ref::<FixedSizeListArray>()?;
  if array.is_null(row) {
    return None;
  }
  let values = array.value(row);
  let floats = values.as_any().downcast_ref::<Float32Array>()?;
  Some(floats.values().to_vec())
}

fn string_list_at(batch: &RecordBatch, name: &str, row: usize) -> Vec<String> {
  let Some(column) = batch.column_by_name(name) else {
    return Vec::new();
  };
  let Some(array) = column.as_any().downcast_ref::<ListArray>() else {
    return Vec::new();
  };
  if array.is_null(row) {
    return Vec::new();
  }
  let values = array.value(row);
  let Some(strings) = values.as_any().downcast_ref::<StringArray>() else {
    return Vec::new();
  };
  (0..strings.len())
    .filter(|&i| !strings.is_null(i))
    .map(|i| strings.value(i).to_string())
    .collect()
}

fn relationships_at(batch: &RecordBatch, row: usize) -> Result<Vec<Relationship>> {
  let Some(column) = batch.column_by_name("relationships") else {
    return Ok(Vec::new());
  };
  let array = column
    .as_any()
    .downcast_ref::<ListArray>()
    .ok_or_else(|| DbError::SchemaMismatch("relationships is not a list column".to_string()))?;
  if array.is_null(row) {
    return Ok(Vec::new());
  }
  let values = array.value(row);
  let structs = values
    .as_any()
    .downcast_ref::<StructArray>()
    .ok_or_else(|| DbError::SchemaMismatch("relationships items are not structs".to_string()))?;

  let field = |name: &str| -> Result<&StringArray> {
    structs
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .ok_or_else(|| DbError::SchemaMismatch(format!("relationship field {} missing", name)))
  };

  let types = field("type")?;
  let ids = field("id")?;
  let uris = field("uri")?;
  let paths = field("path")?;
  let cids = field("cid")?;
  let titles = field("title")?;
  let descriptions = field("description")?;

  let opt = |array: &StringArray, i: usize| -> Option<String> {
    if array.is_null(i) {
      None
    } else {
      Some(array.value(i).to_string())
    }
  };

  let mut relationships = Vec::with_capacity(structs.len());
  for i in 0..structs.len() {
    let rel_type = opt(types, i)
      .ok_or_else(|| DbError::SchemaMismatch("relationship without a type".to_string()))?
      .parse()
      .map_err(DbError::SchemaMismatch)?;
    relationships.push(Relationship {
      rel_type,
      id: opt(ids, i),
      uri: opt(uris, i),
      path: opt(paths, i),
      cid: opt(cids, i),
      title: opt(titles, i),
      description: opt(descriptions, i),
    });
  }
  Ok(relationships)
}

fn metadata_at(batch: &RecordBatch, row: usize) -> Vec<(String, String)> {
  let Some(column) = batch.column_by_name("custom_metadata") else {
    return Vec::new();
  };
  let Some(array) = column.as_any().downcast_ref::<ListArray>() else {
    return Vec::new();
  };
  if array.is_null(row) {
    return Vec::new();
  }
  let values = array.value(row);
  let Some(structs) = values.as_any().downcast_ref::<StructArray>() else {
    return Vec::new();
  };
  let keys = structs
    .column_by_name("key")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>());
  let vals = structs
    .column_by_name("value")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>());
  let (Some(keys), Some(vals)) = (keys, vals) else {
    return Vec::new();
  };

  (0..structs.len())
    .filter(|&i| !keys.is_null(i) && !vals.is_null(i))
    .map(|i| (keys.value(i).to_string(), vals.value(i).to_string()))
    .collect()
}

/// Read the blob cell of a row, if the column is present in the batch
pub(crate) fn blob_of(batch: &RecordBatch, row: usize) -> Option<Vec<u8>> {
  let array = batch
    .column_by_name("raw_data")?
    .as_any()
    .downcast_ref::<LargeBinaryArray>()?;
  if array.is_null(row) {
    return None;
  }
  Some(array.value(row).to_vec())
}
