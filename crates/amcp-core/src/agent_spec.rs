//! Agent specification — the configuration an agent loop runs under.

use serde::{Deserialize, Serialize};

/// Whether an agent runs as the top-level conversational agent or as a
/// delegated subagent spawned by the `task` tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Primary,
    Subagent,
}

/// Static description of an agent: identity, tool access, and model
/// binding. One `AgentSpec` can back many sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub mode: AgentMode,
    pub description: String,
    /// Reference to a system prompt — either literal text or a path,
    /// resolved by the session manager at session creation time.
    pub system_prompt: SystemPromptRef,
    /// Tool names explicitly allowed. Empty means "all tools not excluded".
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tool names explicitly excluded, applied after `allowed_tools`.
    #[serde(default)]
    pub excluded_tools: Vec<String>,
    pub max_steps: usize,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub can_delegate: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SystemPromptRef {
    Literal(String),
    Path(String),
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            mode: AgentMode::Primary,
            description: String::new(),
            system_prompt: SystemPromptRef::Literal(String::new()),
            allowed_tools: Vec::new(),
            excluded_tools: Vec::new(),
            max_steps: 25,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
            can_delegate: true,
        }
    }
}

impl AgentSpec {
    /// Whether `tool_name` is reachable by this agent: in `allowed_tools`
    /// (or the allow-list is empty, meaning "everything"), and not in
    /// `excluded_tools`. Exclusion always wins over an empty/wildcard allow.
    pub fn tool_allowed(&self, tool_name: &str) -> bool {
        if self.excluded_tools.iter().any(|t| t == tool_name) {
            return false;
        }
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_everything_not_excluded() {
        let mut spec = AgentSpec::default();
        spec.excluded_tools.push("bash".to_string());
        assert!(spec.tool_allowed("read_file"));
        assert!(!spec.tool_allowed("bash"));
    }

    #[test]
    fn explicit_allow_list_restricts() {
        let mut spec = AgentSpec::default();
        spec.allowed_tools.push("read_file".to_string());
        assert!(spec.tool_allowed("read_file"));
        assert!(!spec.tool_allowed("write_file"));
    }

    #[test]
    fn exclude_wins_over_allow() {
        let mut spec = AgentSpec::default();
        spec.allowed_tools.push("bash".to_string());
        spec.excluded_tools.push("bash".to_string());
        assert!(!spec.tool_allowed("bash"));
    }
}
