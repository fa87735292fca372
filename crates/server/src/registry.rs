//! The tool registry: every MCP tool with its JSON-schema-described input.
//!
//! Built once at startup and immutable afterwards.

use serde::Serialize;
use serde_json::{Value, json};

/// One registered tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
  pub name: &'static str,
  pub description: &'static str,
  pub input_schema: Value,
}

fn schema(properties: Value, required: &[&str]) -> Value {
  json!({
    "type": "object",
    "properties": properties,
    "required": required,
    "additionalProperties": false,
  })
}

fn record_properties() -> Value {
  json!({
    "uuid": {"type": "string", "description": "v4 UUID; assigned when omitted"},
    "title": {"type": "string"},
    "record_type": {"type": "string", "enum": ["document", "collection_header", "dataset_header", "frameset"]},
    "text_content": {"type": "string"},
    "context": {"type": "string"},
    "vector": {"type": "array", "items": {"type": "number"}},
    "version": {"type": "string"},
    "author": {"type": "string"},
    "contributors": {"type": "array", "items": {"type": "string"}},
    "tags": {"type": "array", "items": {"type": "string"}},
    "status": {"type": "string", "enum": ["draft", "published", "archived", "deprecated"]},
    "collection": {"type": "string"},
    "collection_id": {"type": "string"},
    "collection_id_type": {"type": "string"},
    "position": {"type": "integer"},
    "source_file": {"type": "string"},
    "source_type": {"type": "string"},
    "source_url": {"type": "string"},
    "local_path": {"type": "string"},
    "uri": {"type": "string"},
    "cid": {"type": "string"},
    "relationships": {"type": "array", "items": {"type": "object"}},
    "custom_metadata": {"description": "object or [{key, value}] array; non-string values JSON-encoded"},
    "raw_data": {"type": "string", "description": "base64-encoded binary payload"},
    "raw_data_type": {"type": "string", "description": "MIME type of raw_data"},
  })
}

/// The complete tool set
pub fn builtin_tools() -> Vec<ToolDef> {
  vec![
    // Document ops
    ToolDef {
      name: "document_create",
      description: "Create a document record; uuid and dates are assigned when omitted",
      input_schema: schema(record_properties(), &["title"]),
    },
    ToolDef {
      name: "document_get",
      description: "Fetch a record by uuid (blob elided unless include_blob)",
      input_schema: schema(
        json!({
          "uuid": {"type": "string"},
          "include_blob": {"type": "boolean", "default": false},
        }),
        &["uuid"],
      ),
    },
    ToolDef {
      name: "document_update",
      description: "Patch fields of an existing record; updated_at is refreshed",
      input_schema: schema(record_properties(), &["uuid"]),
    },
    ToolDef {
      name: "document_delete",
      description: "Delete a record by uuid (idempotent)",
      input_schema: schema(json!({"uuid": {"type": "string"}}), &["uuid"]),
    },
    ToolDef {
      name: "document_exists",
      description: "Check whether a record exists",
      input_schema: schema(json!({"uuid": {"type": "string"}}), &["uuid"]),
    },
    ToolDef {
      name: "document_list",
      description: "List records with an optional filter expression, paging, and sort",
      input_schema: schema(
        json!({
          "filter": {"type": "string", "description": "restricted SQL boolean expression"},
          "limit": {"type": "integer", "default": 10},
          "offset": {"type": "integer", "default": 0},
          "sort_by": {"type": "string", "enum": ["uuid", "title", "created_at", "updated_at", "position"]},
          "ascending": {"type": "boolean", "default": true},
        }),
        &[],
      ),
    },
    ToolDef {
      name: "document_create_batch",
      description: "Create many records in bounded chunks; all-or-nothing validation",
      input_schema: schema(
        json!({
          "documents": {"type": "array", "items": {"type": "object"}},
          "batch_size": {"type": "integer", "default": 100},
        }),
        &["documents"],
      ),
    },
    ToolDef {
      name: "document_update_batch",
      description: "Patch many records; each entry must carry a uuid",
      input_schema: schema(
        json!({"documents": {"type": "array", "items": {"type": "object"}}}),
        &["documents"],
      ),
    },
    ToolDef {
      name: "document_delete_batch",
      description: "Delete many records by uuid (idempotent per uuid)",
      input_schema: schema(
        json!({"uuids": {"type": "array", "items": {"type": "string"}}}),
        &["uuids"],
      ),
    },
    // Search
    ToolDef {
      name: "search_documents",
      description: "Search records in text, vector, or hybrid mode",
      input_schema: schema(
        json!({
          "query": {"type": "string"},
          "vector": {"type": "array", "items": {"type": "number"}},
          "mode": {"type": "string", "enum": ["text", "vector", "hybrid"], "default": "hybrid"},
          "limit": {"type": "integer", "default": 10},
          "filter": {"type": "string"},
          "collection_id": {"type": "string"},
          "auto_index": {"type": "boolean"},
        }),
        &[],
      ),
    },
    ToolDef {
      name: "search_similar",
      description: "Find records nearest to an existing record's embedding",
      input_schema: schema(
        json!({
          "uuid": {"type": "string"},
          "limit": {"type": "integer", "default": 10},
          "filter": {"type": "string"},
        }),
        &["uuid"],
      ),
    },
    ToolDef {
      name: "search_by_metadata",
      description: "Find records carrying a custom-metadata key (optionally a specific value)",
      input_schema: schema(
        json!({
          "key": {"type": "string"},
          "value": {"type": "string"},
          "limit": {"type": "integer", "default": 10},
        }),
        &["key"],
      ),
    },
    ToolDef {
      name: "search_within_collection",
      description: "Search restricted to one collection's members ('*' lists all)",
      input_schema: schema(
        json!({
          "collection_id": {"type": "string"},
          "query": {"type": "string"},
          "mode": {"type": "string", "enum": ["text", "vector", "hybrid"], "default": "text"},
          "limit": {"type": "integer", "default": 10},
        }),
        &["collection_id", "query"],
      ),
    },
    ToolDef {
      name: "search_stream",
      description: "Cursor-paged search: pass query params to open, then cursor to continue",
      input_schema: schema(
        json!({
          "cursor": {"type": "string"},
          "query": {"type": "string"},
          "mode": {"type": "string", "enum": ["text", "vector", "hybrid"], "default": "hybrid"},
          "filter": {"type": "string"},
          "limit": {"type": "integer", "default": 100},
          "batch_size": {"type": "integer", "default": 10},
        }),
        &[],
      ),
    },
    // Collections
    ToolDef {
      name: "collection_create",
      description: "Create a collection header record",
      input_schema: schema(
        json!({
          "collection": {"type": "string", "description": "collection name"},
          "title": {"type": "string"},
          "uuid": {"type": "string"},
          "context": {"type": "string"},
        }),
        &["collection"],
      ),
    },
    ToolDef {
      name: "collection_get",
      description: "Fetch a collection header and its member count",
      input_schema: schema(json!({"collection_id": {"type": "string"}}), &["collection_id"]),
    },
    ToolDef {
      name: "collection_update",
      description: "Patch a collection header",
      input_schema: schema(
        json!({
          "collection_id": {"type": "string"},
          "title": {"type": "string"},
          "context": {"type": "string"},
        }),
        &["collection_id"],
      ),
    },
    ToolDef {
      name: "collection_delete",
      description: "Delete a collection header and unlink its members",
      input_schema: schema(json!({"collection_id": {"type": "string"}}), &["collection_id"]),
    },
    ToolDef {
      name: "collection_list",
      description: "List collection headers",
      input_schema: schema(json!({}), &[]),
    },
    ToolDef {
      name: "collection_add_documents",
      description: "Link existing records into a collection",
      input_schema: schema(
        json!({
          "collection_id": {"type": "string"},
          "document_uuids": {"type": "array", "items": {"type": "string"}},
        }),
        &["collection_id", "document_uuids"],
      ),
    },
    ToolDef {
      name: "collection_remove_documents",
      description: "Unlink records from a collection",
      input_schema: schema(
        json!({
          "collection_id": {"type": "string"},
          "document_uuids": {"type": "array", "items": {"type": "string"}},
        }),
        &["collection_id", "document_uuids"],
      ),
    },
    ToolDef {
      name: "collection_stats",
      description: "Member count and name for one collection",
      input_schema: schema(json!({"collection_id": {"type": "string"}}), &["collection_id"]),
    },
    // Import / export
    ToolDef {
      name: "import_documents",
      description: "Async bulk import; returns a task id, progress over SSE",
      input_schema: schema(
        json!({
          "documents": {"type": "array", "items": {"type": "object"}},
          "batch_size": {"type": "integer", "default": 100},
        }),
        &["documents"],
      ),
    },
    ToolDef {
      name: "export_documents",
      description: "Async export to a JSONL file; returns a task id, progress over SSE",
      input_schema: schema(
        json!({
          "path": {"type": "string"},
          "filter": {"type": "string"},
        }),
        &["path"],
      ),
    },
    ToolDef {
      name: "task_status",
      description: "Poll the state of an async import/export task",
      input_schema: schema(json!({"task_id": {"type": "string"}}), &["task_id"]),
    },
    // System
    ToolDef {
      name: "health_check",
      description: "Liveness and dataset reachability",
      input_schema: schema(json!({}), &[]),
    },
    ToolDef {
      name: "list_tools",
      description: "Names and descriptions of every registered tool",
      input_schema: schema(json!({}), &[]),
    },
    ToolDef {
      name: "get_tool_info",
      description: "Full definition of one tool, including its input schema",
      input_schema: schema(json!({"name": {"type": "string"}}), &["name"]),
    },
    ToolDef {
      name: "validate_dataset",
      description: "Scan every record and report schema violations and broken edges",
      input_schema: schema(json!({"max_issues": {"type": "integer", "default": 50}}), &[]),
    },
    ToolDef {
      name: "optimize_dataset",
      description: "Compact fragments, refresh indices, and prune old versions",
      input_schema: schema(
        json!({
          "target_rows_per_fragment": {"type": "integer", "default": 1048576},
          "prune_older_than_days": {"type": "integer"},
        }),
        &[],
      ),
    },
    ToolDef {
      name: "clear_cache",
      description: "Drop server-side search cursors",
      input_schema: schema(json!({}), &[]),
    },
    ToolDef {
      name: "server_info",
      description: "Server version, dataset, and embedder identity",
      input_schema: schema(json!({}), &[]),
    },
    ToolDef {
      name: "dataset_stats",
      description: "Version, row count, fragments, size, and indices of the dataset",
      input_schema: schema(json!({}), &[]),
    },
  ]
}

/// Look up a tool by name
pub fn find_tool<'a>(tools: &'a [ToolDef], name: &str) -> Option<&'a ToolDef> {
  tools.iter().find(|t| t.name == name)
}
