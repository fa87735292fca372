//! Async import/export tools. Both return a task id immediately; progress
//! flows over the SSE channel and the `task_status` tool.

use frame_core::validation::{optional_usize, require_array, require_string};
use serde_json::json;
use tracing::{debug, error};

use crate::rpc::{Request, Response};
use crate::tools::{ToolHandler, invalid_params, parse_filter_param};

impl ToolHandler {
  pub async fn import_documents(&self, request: Request) -> Response {
    let documents = match require_array(request.params.get("documents"), "documents") {
      Ok(documents) => documents,
      Err(e) => return invalid_params(request.id, &e),
    };
    let batch_size = match optional_usize(request.params.get("batch_size"), "batch_size") {
      Ok(size) => size.unwrap_or(self.config.transfer.batch_size).max(1),
      Err(e) => return invalid_params(request.id, &e),
    };
    let split_max_chars = match optional_usize(request.params.get("split_max_chars"), "split_max_chars") {
      Ok(value) => value,
      Err(e) => return invalid_params(request.id, &e),
    };

    // Validate and embed up front so the background phase only does storage
    // writes; a bad document fails the whole call before the task exists.
    let mut records = Vec::with_capacity(documents.len());
    for (i, document) in documents.iter().enumerate() {
      let mut record = match self.record_from_params(document) {
        Ok(record) => record,
        Err(e) => {
          let scoped = frame_core::ValidationError::new(format!("documents[{}].{}", i, e.field), e.message.clone());
          return invalid_params(request.id, &scoped);
        }
      };

      // Long documents split into positioned chunk records when asked
      if let (Some(max_chars), Some(text)) = (split_max_chars, record.text_content.clone())
        && text.len() > max_chars
      {
        let chunks = self.splitter.split(&text, max_chars, max_chars / 5);
        for (position, chunk) in chunks.into_iter().enumerate() {
          let mut part = record.clone();
          part.uuid = self.ids.generate();
          part.title = format!("{} ({})", record.title, position + 1);
          part.text_content = Some(chunk);
          part.position = Some(position as i32);
          records.push(part);
        }
        continue;
      }
      records.push(record);
    }

    for record in &mut records {
      if record.vector.is_none()
        && let Some(text) = record.text_content.clone()
      {
        match self.embed_one(&text).await {
          Ok(vector) => record.vector = Some(vector),
          Err(e) => return Response::from_embedding_error(request.id, e),
        }
      }
    }

    let task_id = self.tasks.create();
    let dataset = self.dataset.clone();
    let tasks = self.tasks.clone();
    let id_for_log = task_id.clone();
    let total = records.len();

    tokio::spawn(async move {
      let mut written = 0usize;
      for chunk in records.chunks(batch_size) {
        match dataset.add_many(chunk, batch_size).await {
          Ok(count) => {
            written += count;
            let percent = (written as f32 / total.max(1) as f32) * 100.0;
            tasks.progress(&id_for_log, percent, format!("{}/{} imported", written, total));
          }
          Err(e) => {
            error!("Import task {} failed: {}", id_for_log, e);
            tasks.fail(&id_for_log, e.to_string());
            return;
          }
        }
      }
      tasks.complete(&id_for_log, format!("{} documents imported", written));
    });

    debug!("Import task {} started ({} documents)", task_id, total);
    Response::success(request.id, json!({"task_id": task_id, "total": total}))
  }

  pub async fn export_documents(&self, request: Request) -> Response {
    let path = match require_string(request.params.get("path"), "path") {
      Ok(path) => path,
      Err(e) => return invalid_params(request.id, &e),
    };
    let filter = match parse_filter_param(&request.id, &request.params) {
      Ok(filter) => filter,
      Err(response) => return response,
    };

    let task_id = self.tasks.create();
    let dataset = self.dataset.clone();
    let tasks = self.tasks.clone();
    let id_for_log = task_id.clone();

    tokio::spawn(async move {
      let records = match dataset.list(filter.as_ref(), None, None, None).await {
        Ok(records) => records,
        Err(e) => {
          error!("Export task {} failed: {}", id_for_log, e);
          tasks.fail(&id_for_log, e.to_string());
          return;
        }
      };

      let total = records.len();
      let mut lines = String::new();
      for (i, record) in records.iter().enumerate() {
        match serde_json::to_string(record) {
          Ok(line) => {
            lines.push_str(&line);
            lines.push('\n');
          }
          Err(e) => {
            tasks.fail(&id_for_log, e.to_string());
            return;
          }
        }
        if i % 100 == 0 {
          let percent = (i as f32 / total.max(1) as f32) * 100.0;
          tasks.progress(&id_for_log, percent, format!("{}/{} serialized", i, total));
        }
      }

      if let Err(e) = tokio::fs::write(&path, lines).await {
        tasks.fail(&id_for_log, e.to_string());
        return;
      }
      tasks.complete(&id_for_log, format!("{} documents exported to {}", total, path));
    });

    Response::success(request.id, json!({"task_id": task_id}))
  }

  pub async fn task_status(&self, request: Request) -> Response {
    let task_id = match require_string(request.params.get("task_id"), "task_id") {
      Ok(task_id) => task_id,
      Err(e) => return invalid_params(request.id, &e),
    };

    match self.tasks.status(&task_id) {
      Some(status) => Response::success(request.id, serde_json::to_value(&status).unwrap_or_default()),
      None => Response::error_with(
        request.id,
        crate::rpc::DOCUMENT_NOT_FOUND,
        &format!("Task {} not found", task_id),
        "not_found",
        &task_id,
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tasks::TaskState;
  use crate::tools::tests::test_handler;

  fn request(params: serde_json::Value) -> Request {
    Request {
      jsonrpc: "2.0".to_string(),
      id: Some(json!(1)),
      method: "transfer".to_string(),
      params,
    }
  }

  async fn wait_for_terminal(handler: &crate::tools::ToolHandler, task_id: &str) -> TaskState {
    for _ in 0..100 {
      if let Some(status) = handler.tasks.status(task_id)
        && status.state != TaskState::Running
      {
        return status.state;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("task {} never finished", task_id);
  }

  #[tokio::test]
  async fn test_import_then_export() {
    let (dir, handler) = test_handler().await;

    let imported = handler
      .import_documents(request(json!({
        "documents": [{"title": "A", "text_content": "alpha"}, {"title": "B", "text_content": "beta"}],
        "batch_size": 1,
      })))
      .await;
    assert!(imported.error.is_none(), "{:?}", imported.error);
    let task_id = imported.result.unwrap()["task_id"].as_str().unwrap().to_string();

    assert_eq!(wait_for_terminal(&handler, &task_id).await, TaskState::Complete);
    assert_eq!(handler.dataset.count().await.unwrap(), 2);

    let out = dir.path().join("export.jsonl");
    let exported = handler
      .export_documents(request(json!({"path": out.to_string_lossy()})))
      .await;
    let task_id = exported.result.unwrap()["task_id"].as_str().unwrap().to_string();
    assert_eq!(wait_for_terminal(&handler, &task_id).await, TaskState::Complete);

    let contents = std::fs::read_to_string(&out).unwrap();
    assert_eq!(contents.lines().count(), 2);
  }

  #[tokio::test]
  async fn test_import_splits_long_documents() {
    let (_dir, handler) = test_handler().await;
    let long_text = "one sentence here. ".repeat(30);

    let imported = handler
      .import_documents(request(json!({
        "documents": [{"title": "Long", "text_content": long_text}],
        "split_max_chars": 100,
      })))
      .await;
    let result = imported.result.unwrap();
    assert!(result["total"].as_u64().unwrap() > 1);
    let task_id = result["task_id"].as_str().unwrap().to_string();
    assert_eq!(wait_for_terminal(&handler, &task_id).await, TaskState::Complete);
  }

  #[tokio::test]
  async fn test_task_status_unknown() {
    let (_dir, handler) = test_handler().await;
    let response = handler.task_status(request(json!({"task_id": "nope"}))).await;
    assert_eq!(response.error.unwrap().code, crate::rpc::DOCUMENT_NOT_FOUND);
  }
}
