//! Session history persistence — append-only JSONL files under
//! `sessions/<id>.jsonl` (§6.6).
//!
//! Grounded on the teacher's `ctx_file` module (create/append/read, one
//! function per message shape) for the file-I/O shape, but the wire format
//! changes: the teacher wrote a bespoke `<up>`-tagged plain-text journal
//! and re-parsed it to resume a session. Per §9 Open Question (c) this
//! rewrite picks *advisory* persistence — the in-memory `Session` is the
//! sole store of truth for an active process; the JSONL file exists so an
//! operator can inspect or replay a session after the fact, not so the
//! server reads it back on startup. That collapses the teacher's
//! create/resume/parse-for-resume trio into one `append` path plus a
//! `read_all` used only by diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line of a session's JSONL history file. Mirrors §3 Message: role,
/// text content, optional tool calls, optional originating tool-call id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub ts: DateTime<Utc>,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Resolve `sessions/<id>.jsonl` within a workspace's `.amcp/` directory,
/// per §6.6's project-scoped layout (`<cwd>/.amcp/` takes precedence).
pub fn session_history_path(workspace: &Path, session_id: &str) -> PathBuf {
    workspace.join(".amcp").join("sessions").join(format!("{session_id}.jsonl"))
}

fn append_line(path: &Path, record: &HistoryRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record).unwrap_or_default();
    writeln!(f, "{line}")
}

pub fn append_user(path: &Path, content: &str) -> std::io::Result<()> {
    append_line(
        path,
        &HistoryRecord {
            ts: Utc::now(),
            role: "user".to_string(),
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: None,
        },
    )
}

pub fn append_assistant(
    path: &Path,
    content: Option<&str>,
    tool_calls: Vec<ToolCallRecord>,
) -> std::io::Result<()> {
    append_line(
        path,
        &HistoryRecord {
            ts: Utc::now(),
            role: "assistant".to_string(),
            content: content.unwrap_or_default().to_string(),
            tool_calls,
            tool_call_id: None,
            is_error: None,
        },
    )
}

pub fn append_tool_result(
    path: &Path,
    tool_call_id: &str,
    content: &str,
    is_error: bool,
) -> std::io::Result<()> {
    append_line(
        path,
        &HistoryRecord {
            ts: Utc::now(),
            role: "tool".to_string(),
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.to_string()),
            is_error: Some(is_error),
        },
    )
}

/// Read back every record in a session's history file, in append order.
/// Advisory only (see module docs) — used by diagnostics, never on the
/// server's hot path.
pub fn read_all(path: &Path) -> std::io::Result<Vec<HistoryRecord>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
