//! Todo tool — structured per-session task list, replace-not-merge semantics.
//!
//! Grounded on `sven-tools::builtin::todo_write` (`TodoWriteTool`, status
//! enum, at-most-one-`in_progress` validation, `format_todos` summary) —
//! adapted to this crate's `Tool` trait (no `ToolEvent` broadcast channel;
//! state lives in a `tokio::sync::Mutex` owned by the tool instance, one per
//! session, matching how `BashTool` owns its own `workspace_root`).

use crate::registry::{Tool, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: String,
}

pub struct TodoTool {
    todos: Mutex<Vec<TodoItem>>,
}

impl Default for TodoTool {
    fn default() -> Self {
        Self::new()
    }
}

impl TodoTool {
    pub fn new() -> Self {
        Self {
            todos: Mutex::new(Vec::new()),
        }
    }

    pub async fn current(&self) -> Vec<TodoItem> {
        self.todos.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Tool for TodoTool {
    fn name(&self) -> &str {
        "todo"
    }

    fn description(&self) -> &str {
        "Create and manage a structured task list for the current session.\n\n\
         ## Task Statuses\n\
         - pending: Not yet started\n\
         - in_progress: Currently being worked on (only ONE at a time)\n\
         - completed: Finished successfully\n\
         - cancelled: No longer relevant\n\n\
         ## When to Use\n\
         Use proactively for multi-step tasks (3+ distinct steps) or when the\n\
         user provides multiple tasks to accomplish. Skip for single,\n\
         straightforward tasks.\n\n\
         Calling this tool replaces the entire list, it does not merge or patch."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "Array of todo items to set (replaces existing list)",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed", "cancelled"]
                            }
                        },
                        "required": ["id", "content", "status"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let todos_value = match args.get("todos").and_then(|v| v.as_array()) {
            Some(arr) => arr.clone(),
            None => return ToolResult::error("Missing required parameter: todos"),
        };

        let mut items: Vec<TodoItem> = Vec::new();
        for item in &todos_value {
            let id = match item.get("id").and_then(|v| v.as_str()) {
                Some(s) => s.to_string(),
                None => return ToolResult::error("todo item missing 'id'"),
            };
            let content = match item.get("content").and_then(|v| v.as_str()) {
                Some(s) => s.to_string(),
                None => return ToolResult::error(format!("todo '{id}' missing 'content'")),
            };
            let status = match item.get("status").and_then(|v| v.as_str()) {
                Some(s) => s.to_string(),
                None => return ToolResult::error(format!("todo '{id}' missing 'status'")),
            };
            if !["pending", "in_progress", "completed", "cancelled"].contains(&status.as_str()) {
                return ToolResult::error(format!("invalid status '{status}' for todo '{id}'"));
            }
            items.push(TodoItem { id, content, status });
        }

        let in_progress_count = items.iter().filter(|t| t.status == "in_progress").count();
        if in_progress_count > 1 {
            return ToolResult::error("at most one todo can be 'in_progress' at a time");
        }

        *self.todos.lock().await = items.clone();
        ToolResult::text(format_todos(&items))
    }
}

fn format_todos(items: &[TodoItem]) -> String {
    if items.is_empty() {
        return "Todo list cleared.".to_string();
    }
    let lines: Vec<String> = items
        .iter()
        .map(|t| {
            let icon = match t.status.as_str() {
                "completed" => "x",
                "in_progress" => "~",
                "cancelled" => "-",
                _ => "o",
            };
            format!("[{icon}] {}: {}", t.id, t.content)
        })
        .collect();
    format!("Todos updated:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sets_todos_and_replaces() {
        let tool = TodoTool::new();
        tool.execute(json!({
            "todos": [{"id": "1", "content": "a", "status": "pending"}]
        }))
        .await;
        tool.execute(json!({
            "todos": [{"id": "2", "content": "b", "status": "in_progress"}]
        }))
        .await;
        let current = tool.current().await;
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, "2");
    }

    #[tokio::test]
    async fn rejects_multiple_in_progress() {
        let tool = TodoTool::new();
        let out = tool
            .execute(json!({
                "todos": [
                    {"id": "1", "content": "a", "status": "in_progress"},
                    {"id": "2", "content": "b", "status": "in_progress"}
                ]
            }))
            .await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn missing_todos_is_error() {
        let tool = TodoTool::new();
        let out = tool.execute(json!({})).await;
        assert!(out.is_error());
    }
}
