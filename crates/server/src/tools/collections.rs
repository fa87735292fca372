//! Collection tools.

use frame_core::validation::{ValidationError, optional_string, require_array, require_string};
use frame_core::RecordType;
use serde_json::json;

use crate::rpc::{Request, Response};
use crate::tools::{ToolHandler, invalid_params};

impl ToolHandler {
  pub async fn collection_create(&self, request: Request) -> Response {
    let name = match require_string(request.params.get("collection"), "collection") {
      Ok(name) => name,
      Err(e) => return invalid_params(request.id, &e),
    };
    let title = match optional_string(request.params.get("title"), "title") {
      Ok(title) => title.unwrap_or_else(|| name.clone()),
      Err(e) => return invalid_params(request.id, &e),
    };
    let context = match optional_string(request.params.get("context"), "context") {
      Ok(context) => context,
      Err(e) => return invalid_params(request.id, &e),
    };

    let mut header = match self.record_from_params(&json!({
      "title": title,
      "record_type": "collection_header",
      "collection": name,
      "uuid": request.params.get("uuid").cloned().unwrap_or(serde_json::Value::Null),
    })) {
      Ok(header) => header,
      Err(e) => return invalid_params(request.id, &e),
    };
    header.context = context;

    match self.dataset.create_collection(&header).await {
      Ok(()) => Response::success(request.id, self.record_to_json(&header)),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn collection_get(&self, request: Request) -> Response {
    let collection_id = match require_string(request.params.get("collection_id"), "collection_id") {
      Ok(id) => id,
      Err(e) => return invalid_params(request.id, &e),
    };

    let header = match self.dataset.get(&collection_id, false).await {
      Ok(Some(header)) if header.record_type == RecordType::CollectionHeader => header,
      Ok(_) => {
        return Response::error_with(
          request.id,
          crate::rpc::DOCUMENT_NOT_FOUND,
          &format!("Collection {} not found", collection_id),
          "not_found",
          &collection_id,
        );
      }
      Err(e) => return Response::from_db_error(request.id, e),
    };

    match self.dataset.collection_stats(&collection_id).await {
      Ok(stats) => Response::success(
        request.id,
        json!({"header": self.record_to_json(&header), "member_count": stats.member_count}),
      ),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn collection_update(&self, request: Request) -> Response {
    let collection_id = match require_string(request.params.get("collection_id"), "collection_id") {
      Ok(id) => id,
      Err(e) => return invalid_params(request.id, &e),
    };

    let existing = match self.dataset.get(&collection_id, false).await {
      Ok(Some(header)) if header.record_type == RecordType::CollectionHeader => header,
      Ok(_) => {
        return Response::error_with(
          request.id,
          crate::rpc::DOCUMENT_NOT_FOUND,
          &format!("Collection {} not found", collection_id),
          "not_found",
          &collection_id,
        );
      }
      Err(e) => return Response::from_db_error(request.id, e),
    };

    let mut patch = serde_json::Map::new();
    for field in ["title", "context"] {
      if let Some(value) = request.params.get(field) {
        patch.insert(field.to_string(), value.clone());
      }
    }

    let updated = match self.apply_patch(&existing, &serde_json::Value::Object(patch)) {
      Ok(record) => record,
      Err(e) => return invalid_params(request.id, &e),
    };
    match self.dataset.update_record(&collection_id, &updated).await {
      Ok(()) => Response::success(request.id, self.record_to_json(&updated)),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  /// Unlinks every member, then deletes the header
  pub async fn collection_delete(&self, request: Request) -> Response {
    let collection_id = match require_string(request.params.get("collection_id"), "collection_id") {
      Ok(id) => id,
      Err(e) => return invalid_params(request.id, &e),
    };

    let members = match self.dataset.collection_members(&collection_id).await {
      Ok(members) => members,
      Err(db::DbError::NotFound(_)) => Vec::new(),
      Err(e) => return Response::from_db_error(request.id, e),
    };
    for member in &members {
      if let Err(e) = self.dataset.remove_from_collection(&member.uuid, &collection_id).await {
        return Response::from_db_error(request.id, e);
      }
    }

    match self.dataset.delete_record(&collection_id).await {
      Ok(()) => Response::success(
        request.id,
        json!({"deleted": collection_id, "unlinked_members": members.len()}),
      ),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn collection_list(&self, request: Request) -> Response {
    match self.dataset.list_collections().await {
      Ok(headers) => {
        let collections: Vec<serde_json::Value> = headers.iter().map(|h| self.record_to_json(h)).collect();
        Response::success(request.id, json!({"collections": collections, "count": collections.len()}))
      }
      Err(e) => Response::from_db_error(request.id, e),
    }
  }

  pub async fn collection_add_documents(&self, request: Request) -> Response {
    let collection_id = match require_string(request.params.get("collection_id"), "collection_id") {
      Ok(id) => id,
      Err(e) => return invalid_params(request.id, &e),
    };
    let uuids = match string_array(&request.params, "document_uuids") {
      Ok(uuids) => uuids,
      Err(e) => return invalid_params(request.id, &e),
    };

    for uuid in &uuids {
      if let Err(e) = self.dataset.add_to_collection(uuid, &collection_id, None).await {
        return Response::from_db_error(request.id, e);
      }
    }
    Response::success(request.id, json!({"added": uuids.len()}))
  }

  pub async fn collection_remove_documents(&self, request: Request) -> Response {
    let collection_id = match require_string(request.params.get("collection_id"), "collection_id") {
      Ok(id) => id,
      Err(e) => return invalid_params(request.id, &e),
    };
    let uuids = match string_array(&request.params, "document_uuids") {
      Ok(uuids) => uuids,
      Err(e) => return invalid_params(request.id, &e),
    };

    for uuid in &uuids {
      if let Err(e) = self.dataset.remove_from_collection(uuid, &collection_id).await {
        return Response::from_db_error(request.id, e);
      }
    }
    Response::success(request.id, json!({"removed": uuids.len()}))
  }

  pub async fn collection_stats_tool(&self, request: Request) -> Response {
    let collection_id = match require_string(request.params.get("collection_id"), "collection_id") {
      Ok(id) => id,
      Err(e) => return invalid_params(request.id, &e),
    };

    match self.dataset.collection_stats(&collection_id).await {
      Ok(stats) => Response::success(request.id, serde_json::to_value(&stats).unwrap_or_default()),
      Err(e) => Response::from_db_error(request.id, e),
    }
  }
}

fn string_array(params: &serde_json::Value, field: &str) -> Result<Vec<String>, ValidationError> {
  let values = require_array(params.get(field), field)?;
  values
    .into_iter()
    .enumerate()
    .map(|(i, value)| {
      value
        .as_str()
        .map(String::from)
        .ok_or_else(|| ValidationError::invalid_type(format!("{}[{}]", field, i), "string"))
    })
    .collect()
}
