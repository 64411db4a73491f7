//! Think tool — a no-op scratchpad for the model to reason in, without
//! touching the filesystem or network. Modeled on the same "state lives in
//! the tool instance" shape as `TodoTool`, but with no validation: the
//! point is that the model can always call it and always get an ack.

use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub struct ThinkTool {
    log: Mutex<Vec<String>>,
}

impl Default for ThinkTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkTool {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
        }
    }

    pub async fn entries(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Use this tool to think through a problem step by step without taking\n\
         any action. Nothing you write here is shown to the user or affects\n\
         the workspace — it's purely for your own reasoning before calling\n\
         another tool."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "thought": {
                    "type": "string",
                    "description": "The reasoning to record"
                }
            },
            "required": ["thought"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let thought = match args.get("thought").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolResult::error("Missing required parameter: thought"),
        };
        self.log.lock().await.push(thought);
        ToolResult::text("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_thought() {
        let tool = ThinkTool::new();
        let out = tool.execute(json!({"thought": "considering options"})).await;
        assert!(!out.is_error());
        assert_eq!(tool.entries().await, vec!["considering options".to_string()]);
    }

    #[tokio::test]
    async fn missing_thought_is_error() {
        let tool = ThinkTool::new();
        let out = tool.execute(json!({})).await;
        assert!(out.is_error());
    }
}
