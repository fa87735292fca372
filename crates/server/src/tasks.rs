//! Background task tracking for long-running tools (import/export).
//!
//! Each task owns a broadcast channel of progress events. Slow SSE consumers
//! may drop intermediate events (bounded channel, lagging receivers skip
//! ahead); the terminal `complete`/`error` event is also stored on the task
//! entry so late or lagging subscribers always observe it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Progress frame sent over the SSE channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
  pub event: String, // progress | complete | error
  pub task_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub percent: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

/// Current state of a task
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  Running,
  Complete,
  Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
  pub task_id: String,
  pub state: TaskState,
  pub percent: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

struct TaskEntry {
  sender: broadcast::Sender<ProgressEvent>,
  status: TaskStatus,
}

/// Registry of running and finished tasks
#[derive(Default)]
pub struct TaskManager {
  tasks: Mutex<HashMap<String, TaskEntry>>,
}

const CHANNEL_CAPACITY: usize = 64;

impl TaskManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new task and return its id
  pub fn create(&self) -> String {
    let task_id = Uuid::new_v4().to_string();
    let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
    let entry = TaskEntry {
      sender,
      status: TaskStatus {
        task_id: task_id.clone(),
        state: TaskState::Running,
        percent: 0.0,
        message: None,
      },
    };
    self.tasks.lock().expect("task registry poisoned").insert(task_id.clone(), entry);
    debug!("Task {} created", task_id);
    task_id
  }

  /// Report intermediate progress
  pub fn progress(&self, task_id: &str, percent: f32, message: impl Into<String>) {
    self.publish(task_id, TaskState::Running, percent, Some(message.into()));
  }

  /// Mark the task complete (terminal)
  pub fn complete(&self, task_id: &str, message: impl Into<String>) {
    self.publish(task_id, TaskState::Complete, 100.0, Some(message.into()));
  }

  /// Mark the task failed (terminal)
  pub fn fail(&self, task_id: &str, message: impl Into<String>) {
    self.publish(task_id, TaskState::Error, 100.0, Some(message.into()));
  }

  fn publish(&self, task_id: &str, state: TaskState, percent: f32, message: Option<String>) {
    let mut tasks = self.tasks.lock().expect("task registry poisoned");
    let Some(entry) = tasks.get_mut(task_id) else {
      return;
    };
    entry.status.state = state.clone();
    entry.status.percent = percent;
    entry.status.message = message.clone();

    let event = ProgressEvent {
      event: match state {
        TaskState::Running => "progress".to_string(),
        TaskState::Complete => "complete".to_string(),
        TaskState::Error => "error".to_string(),
      },
      task_id: task_id.to_string(),
      percent: Some(percent),
      message,
    };
    // No receivers is fine; the stored status covers late subscribers
    let _ = entry.sender.send(event);
  }

  /// Status snapshot for polling
  pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
    self
      .tasks
      .lock()
      .expect("task registry poisoned")
      .get(task_id)
      .map(|e| e.status.clone())
  }

  /// Subscribe to a task's event stream alongside its current status
  pub fn subscribe(&self, task_id: &str) -> Option<(TaskStatus, broadcast::Receiver<ProgressEvent>)> {
    self
      .tasks
      .lock()
      .expect("task registry poisoned")
      .get(task_id)
      .map(|e| (e.status.clone(), e.sender.subscribe()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lifecycle() {
    let manager = TaskManager::new();
    let id = manager.create();

    assert_eq!(manager.status(&id).unwrap().state, TaskState::Running);

    manager.progress(&id, 40.0, "importing");
    let status = manager.status(&id).unwrap();
    assert_eq!(status.percent, 40.0);
    assert_eq!(status.message.as_deref(), Some("importing"));

    manager.complete(&id, "done");
    assert_eq!(manager.status(&id).unwrap().state, TaskState::Complete);
  }

  #[test]
  fn test_unknown_task() {
    let manager = TaskManager::new();
    assert!(manager.status("nope").is_none());
    // Publishing to an unknown task is a no-op
    manager.progress("nope", 10.0, "x");
  }

  #[tokio::test]
  async fn test_subscriber_receives_terminal_event() {
    let manager = TaskManager::new();
    let id = manager.create();
    let (_status, mut rx) = manager.subscribe(&id).unwrap();

    manager.progress(&id, 50.0, "half");
    manager.complete(&id, "done");

    let first = rx.recv().await.unwrap();
    assert_eq!(first.event, "progress");
    let second = rx.recv().await.unwrap();
    assert_eq!(second.event, "complete");
  }

  #[test]
  fn test_late_subscriber_sees_stored_terminal_state() {
    let manager = TaskManager::new();
    let id = manager.create();
    manager.fail(&id, "boom");

    let (status, _rx) = manager.subscribe(&id).unwrap();
    assert_eq!(status.state, TaskState::Error);
    assert_eq!(status.message.as_deref(), Some("boom"));
  }
}
