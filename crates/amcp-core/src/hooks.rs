//! Hook pipeline data types — external-process hook contract (§4.D).

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookEventKind {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    SessionStart,
    SessionEnd,
    Stop,
    PreCompact,
}

impl HookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::Stop => "Stop",
            Self::PreCompact => "PreCompact",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Command,
    Script,
    Function,
}

/// A registered hook handler: runs when `event` fires and `name_pattern`
/// matches the tool name (for tool-scoped events) or is empty/`*` for
/// session-scoped events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookHandler {
    pub name: String,
    pub event: HookEventKind,
    pub name_pattern: String,
    pub kind: HookKind,
    /// Command line (for `Command`/`Script`) or registered function id
    /// (for `Function`).
    pub command: String,
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl HookHandler {
    pub fn default_timeout_secs() -> u64 {
        30
    }
}

/// JSON payload piped to a hook process on stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookInput {
    pub session_id: String,
    pub hook_event_name: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HookSpecificOutput {
    #[serde(default)]
    pub permission_decision: Option<String>,
    #[serde(default)]
    pub updated_input: Option<serde_json::Value>,
    #[serde(default)]
    pub updated_response: Option<serde_json::Value>,
}

/// Parsed JSON a hook process prints to stdout on exit 0.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HookResponse {
    #[serde(default)]
    pub r#continue: Option<bool>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub hook_specific_output: Option<HookSpecificOutput>,
}

/// The outcome of running one hook handler, per the exit-code contract:
/// exit 0 + empty stdout => `NoChange`; exit 0 + JSON => `Modified`;
/// exit 2 => `Blocked` (stderr is the reason); anything else =>
/// `NonBlockingError` (logged, pipeline continues as if unhandled).
#[derive(Clone, Debug)]
pub enum HookOutcome {
    NoChange,
    Modified(HookResponse),
    Blocked(String),
    NonBlockingError(String),
}

impl HookOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_event_kind_serializes_pascal_case() {
        assert_eq!(HookEventKind::PreToolUse.as_str(), "PreToolUse");
    }

    #[test]
    fn hook_input_omits_absent_fields() {
        let input = HookInput {
            session_id: "s1".into(),
            hook_event_name: "SessionStart".into(),
            cwd: "/tmp".into(),
            tool_name: None,
            tool_input: None,
            tool_response: None,
            prompt: None,
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(!json.contains("tool_name"));
    }
}
