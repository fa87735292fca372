//! Document CRUD tools.

use frame_core::validation::{ValidationError, optional_bool, optional_string, optional_usize, require_array,
  require_string};
use serde_json::json;
use tracing::debug;

use crate::rpc::{Request, Response};
use crate::tools::{ToolHandler, invalid_params, parse_filter_param};
use db::SortSpec;

impl ToolHandler {
  pub async fn document_create(&self, request: Request) -> Response {
    let mut record = match self.record_from_params(&request.params) {
      Ok(record) => record,
      Err(e) => return invalid_params(request.id, &e),
    };

    // Embed on create when no vector was supplied
    if record.vector.is_none()
      && let Some(text) = record.text_content.clone()
    {
      match self.embed_one(&text).await {
        Ok(vector) => record.vector = Some(vector),
        Err(e) => return Response::from_embedding_error(request.id, e),
      }
    }

    if let Err(e) = self.dataset.add(&record).await {
      return Response::from_db_error(request.id, e);
    }
    debug!("Created document {}", record.uuid);
    Response::success(request.id, self.record_to_json(&record))
  }

  pub async fn document_get(&self, request: Request) -> Response {
    let uuid = match require_string(request.params.get("uuid"), "uuid") {
      Ok(uuid) => uuid,
      Err(e) => return invalid_params(request.id, &e),
    };
    let include_blob = match optional_bool(request.params.get("include_blob"), "include_blob") {
      Ok(flag) => flag.unwrap_or(false),
      Err(e) => return invalid_params(request.id, &e),
    };

    match self.dataset.get(&uuid, include_blob).await {
      Ok(Some(record)) => Response::success(request.id, self.record_to_json(&record)),
      Ok(None) => Response::error_with(
        request.id,
        crate::rpc::DOCUMENT_NOT_FOUND,
        &format!("Document {} not found", uuid),
        "not_found",
        &uuid,
      ),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn document_update(&self, request: Request) -> Response {
    let uuid = match require_string(request.params.get("uuid"), "uuid") {
      Ok(uuid) => uuid,
      Err(e) => return invalid_params(request.id, &e),
    };

    let existing = match self.dataset.get(&uuid, true).await {
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

    let updated = match self.apply_patch(&existing, &request.params) {
      Ok(record) => record,
      Err(e) => return invalid_params(request.id, &e),
    };

    if let Err(e) = self.dataset.update_record(&uuid, &updated).await {
      return Response::from_db_error(request.id, e);
    }
    Response::success(request.id, self.record_to_json(&updated))
  }

  pub async fn document_delete(&self, request: Request) -> Response {
    let uuid = match require_string(request.params.get("uuid"), "uuid") {
      Ok(uuid) => uuid,
      Err(e) => return invalid_params(request.id, &e),
    };

    match self.dataset.delete_record(&uuid).await {
      Ok(()) => Response::success(request.id, json!({"deleted": uuid})),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn document_exists(&self, request: Request) -> Response {
    let uuid = match require_string(request.params.get("uuid"), "uuid") {
      Ok(uuid) => uuid,
      Err(e) => return invalid_params(request.id, &e),
    };

    match self.dataset.exists(&uuid).await {
      Ok(exists) => Response::success(request.id, json!({"exists": exists})),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn document_list(&self, request: Request) -> Response {
    let filter = match parse_filter_param(&request.id, &request.params) {
      Ok(filter) => filter,
      Err(response) => return response,
    };
    let limit = match optional_usize(request.params.get("limit"), "limit") {
      Ok(limit) => Some(limit.unwrap_or(self.config.search.default_limit)),
      Err(e) => return invalid_params(request.id, &e),
    };
    let offset = match optional_usize(request.params.get("offset"), "offset") {
      Ok(offset) => offset,
      Err(e) => return invalid_params(request.id, &e),
    };
    let sort = match optional_string(request.params.get("sort_by"), "sort_by") {
      Ok(column) => column.map(|column| SortSpec {
        column,
        ascending: request.params.get("ascending").and_then(|v| v.as_bool()).unwrap_or(true),
      }),
      Err(e) => return invalid_params(request.id, &e),
    };

    match self.dataset.list(filter.as_ref(), limit, offset, sort.as_ref()).await {
      Ok(records) => {
        let documents: Vec<serde_json::Value> = records.iter().map(|r| self.record_to_json(r)).collect();
        Response::success(request.id, json!({"documents": documents, "count": documents.len()}))
      }
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn document_create_batch(&self, request: Request) -> Response {
    let documents = match require_array(request.params.get("documents"), "documents") {
      Ok(documents) => documents,
      Err(e) => return invalid_params(request.id, &e),
    };
    let batch_size = match optional_usize(request.params.get("batch_size"), "batch_size") {
      Ok(size) => size.unwrap_or(self.config.transfer.batch_size),
      Err(e) => return invalid_params(request.id, &e),
    };

    let mut records = Vec::with_capacity(documents.len());
    for (i, document) in documents.iter().enumerate() {
      match self.record_from_params(document) {
        Ok(mut record) => {
          if record.vector.is_none()
            && let Some(text) = record.text_content.clone()
          {
            match self.embed_one(&text).await {
              Ok(vector) => record.vector = Some(vector),
              Err(e) => return Response::from_embedding_error(request.id, e),
            }
          }
          records.push(record);
        }
        Err(e) => {
          let scoped = ValidationError::new(format!("documents[{}].{}", i, e.field), e.message);
          return invalid_params(request.id, &scoped);
        }
      }
    }

    match self.dataset.add_many(&records, batch_size).await {
      Ok(count) => {
        let uuids: Vec<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
        Response::success(request.id, json!({"created": count, "uuids": uuids}))
      }
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn document_update_batch(&self, request: Request) -> Response {
    let documents = match require_array(request.params.get("documents"), "documents") {
      Ok(documents) => documents,
      Err(e) => return invalid_params(request.id, &e),
    };

    let mut updated = Vec::with_capacity(documents.len());
    for (i, patch) in documents.iter().enumerate() {
      let Some(uuid) = patch.get("uuid").and_then(|v| v.as_str()) else {
        return invalid_params(
          request.id,
          &ValidationError::missing(format!("documents[{}].uuid", i)),
        );
      };

      let existing = match self.dataset.get(uuid, true).await {
        Ok(Some(record)) => record,
        Ok(None) => {
          return Response::error_with(
            request.id,
            crate::rpc::DOCUMENT_NOT_FOUND,
            &format!("Document {} not found", uuid),
            "not_found",
            uuid,
          );
        }
        Err(e) => return Response::from_db_error(request.id, e),
      };

      let record = match self.apply_patch(&existing, patch) {
        Ok(record) => record,
        Err(e) => return invalid_params(request.id, &e),
      };
      if let Err(e) = self.dataset.update_record(uuid, &record).await {
        return Response::from_db_error(request.id, e);
      }
      updated.push(uuid.to_string());
    }

    Response::success(request.id, json!({"updated": updated.len(), "uuids": updated}))
  }

  pub async fn document_delete_batch(&self, request: Request) -> Response {
    let uuids = match require_array(request.params.get("uuids"), "uuids") {
      Ok(values) => values,
      Err(e) => return invalid_params(request.id, &e),
    };

    let mut deleted = 0usize;
    for (i, value) in uuids.iter().enumerate() {
      let Some(uuid) = value.as_str() else {
        return invalid_params(
          request.id,
          &ValidationError::invalid_type(format!("uuids[{}]", i), "string"),
        );
      };
      if let Err(e) = self.dataset.delete_record(uuid).await {
        return Response::from_db_error(request.id, e);
      }
      deleted += 1;
    }
    Response::success(request.id, json!({"deleted": deleted}))
  }

  /// Overlay patch fields onto an existing record. `uuid` and `created_at`
  /// are immutable; `updated_at` is refreshed from the clock.
  pub(crate) fn apply_patch(
    &self,
    existing: &frame_core::Record,
    patch: &serde_json::Value,
  ) -> Result<frame_core::Record, ValidationError> {
    let patch_object = patch
      .as_object()
      .ok_or_else(|| ValidationError::invalid_type("params", "object"))?;

    let mut merged = match self.record_to_json(existing) {
      serde_json::Value::Object(map) => map,
      _ => return Err(ValidationError::invalid_type("record", "object")),
    };
    for (key, value) in patch_object {
      if key == "uuid" || key == "created_at" {
        continue;
      }
      merged.insert(key.clone(), value.clone());
    }
    merged.insert(
      "updated_at".to_string(),
      serde_json::Value::String(self.today()),
    );

    let mut record = self.record_from_params(&serde_json::Value::Object(merged))?;
    record.uuid = existing.uuid.clone();
    record.created_at = existing.created_at.clone();
    Ok(record)
  }
}
