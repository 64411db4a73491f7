//! Session state — in-memory conversation plus advisory JSONL history
//! persistence (§6.6).
//!
//! Grounded on the teacher's `SessionRegistry`/`Session` (DashMap-sharded
//! registry, append-only journal). The teacher's "sleep" concept —
//! returning a bool from `add_user_message` telling the caller to suspend
//! the whole layer once token usage crosses a threshold — has no spec
//! counterpart; it is replaced by `amcp_agent::compactor::Compactor`, which
//! the agent loop consults before every model call. This module now only
//! owns message storage, `sessions/<id>.jsonl` persistence, and the
//! status/usage bookkeeping a session listing (§3 Session, §6.1
//! `GET /sessions`) needs. Per §9 Open Question (c), the in-memory history
//! is authoritative; the JSONL file is advisory and never read back to
//! reconstruct a session (AGENTS.md-style bootstrap-file discovery is out
//! of scope per §1).

use crate::history::{self, ToolCallRecord};
use amcp_llm::{ContentBlock, LlmContent, LlmMessage};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use amcp_core::SessionKey;

/// Lifecycle status of a session (§3 Session).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Cancelled,
    Error,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a session with advisory JSONL persistence under
    /// `<workspace>/.amcp/sessions/<id>.jsonl` (§6.6).
    pub fn create_with_ctx(
        &self,
        key: &SessionKey,
        system_prompt: Option<&str>,
        workspace: &Path,
    ) -> Arc<Session> {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| {
                let session_id = key.as_str().to_string();
                let history_path = history::session_history_path(workspace, &session_id);

                info!("Session {} created: history -> {}", session_id, history_path.display());

                Arc::new(Session::new_with_ctx(key.clone(), system_prompt, Some(history_path)))
            })
            .clone()
    }

    pub fn get_or_create(&self, key: &SessionKey, system_prompt: Option<&str>) -> Arc<Session> {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Session::new(key.clone(), system_prompt)))
            .clone()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.remove(key).map(|(_, s)| s)
    }
}

pub struct Session {
    pub key: SessionKey,
    system_prompt: RwLock<Option<String>>,
    messages: RwLock<Vec<LlmMessage>>,
    model: RwLock<Option<String>>,
    history_path: Option<PathBuf>,
    abort_tx: mpsc::Sender<()>,
    abort_rx: RwLock<Option<mpsc::Receiver<()>>>,
    /// Cancellation handle for the turn currently running under this
    /// session, if any. Swapped for a fresh token after each turn so a
    /// stale cancellation can't bleed into the next prompt.
    cancel_token: RwLock<CancellationToken>,
    status: RwLock<SessionStatus>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: RwLock<chrono::DateTime<chrono::Utc>>,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    connected_clients: AtomicUsize,
    /// `(allowed_tools, excluded_tools)` from the session's `AgentSpec`
    /// (§4.B `schema_for_model`), consulted before every model call so a
    /// restricted agent never sees tools outside its spec.
    tool_filter: RwLock<(Vec<String>, Vec<String>)>,
}

impl Session {
    pub fn new(key: SessionKey, system_prompt: Option<&str>) -> Self {
        Self::new_with_ctx(key, system_prompt, None)
    }

    pub fn new_with_ctx(
        key: SessionKey,
        system_prompt: Option<&str>,
        history_path: Option<PathBuf>,
    ) -> Self {
        let (abort_tx, abort_rx) = mpsc::channel(1);
        let now = chrono::Utc::now();
        Self {
            key,
            system_prompt: RwLock::new(system_prompt.map(String::from)),
            messages: RwLock::new(Vec::new()),
            model: RwLock::new(None),
            history_path,
            abort_tx,
            abort_rx: RwLock::new(Some(abort_rx)),
            cancel_token: RwLock::new(CancellationToken::new()),
            status: RwLock::new(SessionStatus::Idle),
            created_at: now,
            updated_at: RwLock::new(now),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            connected_clients: AtomicUsize::new(0),
            tool_filter: RwLock::new((Vec::new(), Vec::new())),
        }
    }

    pub fn history_path(&self) -> Option<&Path> {
        self.history_path.as_deref()
    }

    /// Advisory replay of this session's on-disk JSONL history. Never used
    /// to reconstruct in-memory state (§9 Open Question (c)).
    pub fn read_history(&self) -> Option<Vec<history::HistoryRecord>> {
        self.history_path.as_ref().and_then(|p| history::read_all(p).ok())
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    pub async fn updated_at(&self) -> chrono::DateTime<chrono::Utc> {
        *self.updated_at.read().await
    }

    async fn touch(&self) {
        *self.updated_at.write().await = chrono::Utc::now();
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: SessionStatus) {
        *self.status.write().await = status;
        self.touch().await;
    }

    pub fn record_usage(&self, input_tokens: u32, output_tokens: u32) {
        self.input_tokens
            .fetch_add(input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(output_tokens as u64, Ordering::Relaxed);
    }

    pub fn usage(&self) -> (u64, u64) {
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }

    pub fn add_client(&self) -> usize {
        self.connected_clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn remove_client(&self) -> usize {
        self.connected_clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0)
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::SeqCst)
    }

    pub async fn system_prompt(&self) -> Option<String> {
        self.system_prompt.read().await.clone()
    }

    pub async fn set_system_prompt(&self, prompt: &str) {
        *self.system_prompt.write().await = Some(prompt.to_string());
    }

    pub async fn add_user_message(&self, content: &str) {
        let message = LlmMessage {
            role: "user".to_string(),
            content: LlmContent::Text(content.to_string()),
        };
        self.messages.write().await.push(message);
        self.touch().await;

        if let Some(ref path) = self.history_path {
            let _ = history::append_user(path, content);
        }
    }

    pub async fn add_assistant_text(&self, content: &str) {
        let message = LlmMessage {
            role: "assistant".to_string(),
            content: LlmContent::Text(content.to_string()),
        };
        self.messages.write().await.push(message);
        self.touch().await;

        if let Some(ref path) = self.history_path {
            let _ = history::append_assistant(path, Some(content), Vec::new());
        }
    }

    pub async fn add_assistant_with_tools(&self, text: Option<&str>, tool_calls: Vec<ContentBlock>) {
        let mut blocks = Vec::new();
        if let Some(t) = text {
            if !t.is_empty() {
                blocks.push(ContentBlock::Text { text: t.to_string() });
            }
        }
        blocks.extend(tool_calls.clone());
        let message = LlmMessage {
            role: "assistant".to_string(),
            content: LlmContent::Blocks(blocks),
        };
        self.messages.write().await.push(message);
        self.touch().await;

        if let Some(ref path) = self.history_path {
            let records: Vec<ToolCallRecord> = tool_calls
                .iter()
                .filter_map(|tc| match tc {
                    ContentBlock::ToolUse { id, name, input } => Some(ToolCallRecord {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.clone(),
                    }),
                    _ => None,
                })
                .collect();
            let _ = history::append_assistant(path, text, records);
        }
    }

    pub async fn add_tool_result(&self, tool_use_id: &str, content: &str, is_error: bool) {
        let block = ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: content.to_string(),
            is_error: if is_error { Some(true) } else { None },
        };

        let mut messages = self.messages.write().await;

        // Anthropic requires ALL tool_results for a turn in a SINGLE user
        // message. If the last message is already a user message with
        // tool_result blocks, append to it instead of creating a new one.
        let appended = if let Some(last) = messages.last_mut() {
            if last.role == "user" {
                if let LlmContent::Blocks(ref mut blocks) = last.content {
                    if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })) {
                        blocks.push(block.clone());
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            } else {
                false
            }
        } else {
            false
        };

        if !appended {
            messages.push(LlmMessage {
                role: "user".to_string(),
                content: LlmContent::Blocks(vec![block]),
            });
        }
        drop(messages);
        self.touch().await;

        if let Some(ref path) = self.history_path {
            let _ = history::append_tool_result(path, tool_use_id, content, is_error);
        }
    }

    pub async fn get_messages(&self) -> Vec<LlmMessage> {
        self.messages.read().await.clone()
    }

    pub async fn messages_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, Vec<LlmMessage>> {
        self.messages.write().await
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Rough token estimate of the current history, for UI display (e.g.
    /// the terminal chat's context-used indicator).
    pub async fn token_count(&self) -> usize {
        crate::compactor::total_tokens(0, &self.messages.read().await)
    }

    pub async fn model(&self) -> Option<String> {
        self.model.read().await.clone()
    }

    pub async fn set_model(&self, model: &str) {
        *self.model.write().await = Some(model.to_string());
    }

    pub async fn tool_filter(&self) -> (Vec<String>, Vec<String>) {
        self.tool_filter.read().await.clone()
    }

    pub async fn set_tool_filter(&self, allowed: Vec<String>, excluded: Vec<String>) {
        *self.tool_filter.write().await = (allowed, excluded);
    }

    pub async fn abort(&self) {
        let _ = self.abort_tx.send(()).await;
    }

    /// The `CancellationToken` the currently (or next) running turn should
    /// race against. Cloned out to the agent loop at turn-start time.
    pub async fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.read().await.clone()
    }

    /// Signals cancellation of the turn currently running under this
    /// session, per the Session Manager's `cancel(id, force)` (§4.I).
    pub async fn cancel(&self) {
        self.cancel_token.read().await.cancel();
        self.abort().await;
    }

    /// Swaps in a fresh, uncancelled token. Called once a turn finishes so
    /// a prior cancellation can't leak into the next prompt.
    pub async fn reset_cancel_token(&self) {
        *self.cancel_token.write().await = CancellationToken::new();
    }

    pub async fn take_abort_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.abort_rx.write().await.take()
    }

    pub async fn clear(&self) {
        self.messages.write().await.clear();
    }
}
