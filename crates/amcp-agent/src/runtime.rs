//! Agent runtime — the bounded step loop that alternates model calls and
//! tool dispatch (§4.H Agent Loop), gated by hooks, permissions, and
//! context compaction at every suspension point.
//!
//! Grounded on the teacher's original `run_turn`/`run_turn_cancellable`
//! (the streaming-accumulate-dispatch shape, `tokio::select!` cancellation
//! race) for the loop mechanics. What the teacher never had: a
//! `HookPipeline` consulted at `UserPromptSubmit`/`PreToolUse`/
//! `PostToolUse`/`Stop`, a `PermissionEngine` check gating every tool
//! dispatch, a `Compactor` consulted before every model call instead of the
//! teacher's "sleep" escape hatch, and `amcp_core::EventBus` emission of
//! every step so the protocol adapter can mirror it to REST/WS/SSE
//! clients. Those four integrations are what turn the teacher's one-shot
//! CLI loop into the spec's agent loop.

use crate::compactor::Compactor;
use crate::hooks::HookPipeline;
use crate::permission::{PermissionEngine, ResolvedDecision};
use crate::session::{Session, SessionKey, SessionRegistry};
use amcp_core::hooks::{HookEventKind, HookInput, HookOutcome};
use amcp_core::{Event, EventBus, EventKind};
use amcp_llm::{
    AccumulatedToolCall, AnthropicProvider, ContentBlock, LlmProvider, LlmRequest, LlmTool,
    StreamDelta,
};
use amcp_tools::SpawnableRuntime;
use amcp_tools::ToolRegistry;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Every iteration in a step loop is bounded; a runaway turn errors instead
/// of looping forever even if `AgentConfig.max_tool_iterations` is
/// misconfigured to something absurd.
const STEP_LIMIT: usize = 200;

#[derive(Clone, Debug)]
pub enum AgentEvent {
    Text(String),
    Thinking(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolExecuting { id: String, name: String },
    ToolResult { id: String, name: String, result: String, is_error: bool },
    /// A tool call was denied by the permission engine or a blocking hook.
    ToolDenied { id: String, name: String, reason: String },
    Done { stop_reason: String },
    Error(String),
}

pub struct AgentConfig {
    pub default_model: String,
    pub max_tool_iterations: usize,
    pub system_prompt: Option<String>,
    pub workspace_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet-4-20250514".to_string(),
            max_tool_iterations: 25,
            system_prompt: None,
            workspace_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionRegistry>,
    config: AgentConfig,
    hooks: HookPipeline,
    permissions: PermissionEngine,
    compactor: Compactor,
    events: Option<Arc<EventBus>>,
}

impl AgentRuntime {
    pub fn new(api_key: &str, tools: ToolRegistry, config: AgentConfig) -> Self {
        Self::with_provider(Arc::new(AnthropicProvider::new(api_key)), tools, config)
    }

    pub fn with_provider(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools: Arc::new(tools),
            sessions: Arc::new(SessionRegistry::new()),
            config,
            hooks: HookPipeline::new(),
            permissions: PermissionEngine::new(Default::default(), Default::default()),
            compactor: Compactor::new(Default::default()),
            events: None,
        }
    }

    pub fn with_hooks(mut self, hooks: HookPipeline) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionEngine) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = compactor;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }
    pub fn tool_definitions(&self) -> Vec<LlmTool> {
        self.tools.get_definitions()
    }
    pub fn workspace(&self) -> &Path {
        &self.config.workspace_root
    }
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn get_session(&self, session_key: &SessionKey) -> Arc<Session> {
        self.sessions.create_with_ctx(
            session_key,
            self.config.system_prompt.as_deref(),
            &self.config.workspace_root,
        )
    }

    async fn emit(&self, session_id: &str, kind: EventKind, payload: serde_json::Value) {
        if let Some(bus) = &self.events {
            bus.emit(Event::new(kind, "agent_loop", payload).with_session(session_id))
                .await;
        }
    }

    /// Run a turn without cancellation support.
    pub async fn run_turn(
        &self,
        session_key: &SessionKey,
        user_message: &str,
        event_tx: mpsc::Sender<AgentEvent>,
    ) -> Result<(), String> {
        self.run_turn_cancellable(session_key, user_message, event_tx, CancellationToken::new())
            .await
    }

    /// Run a turn with cancellation support (§4.H). Implements the 8-step
    /// loop: `UserPromptSubmit` hook -> compaction check -> model call ->
    /// per-tool-call `PreToolUse` hook -> permission check -> dispatch ->
    /// `PostToolUse` hook -> repeat until no tool calls or the step limit
    /// is hit, then the `Stop` hook.
    pub async fn run_turn_cancellable(
        &self,
        session_key: &SessionKey,
        user_message: &str,
        event_tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<(), String> {
        let session = self.get_session(session_key);
        let cwd = self.config.workspace_root.to_string_lossy().to_string();

        let prompt_hook_input = HookInput {
            session_id: session_key.as_str().to_string(),
            hook_event_name: HookEventKind::UserPromptSubmit.as_str().to_string(),
            cwd: cwd.clone(),
            tool_name: None,
            tool_input: None,
            tool_response: None,
            prompt: Some(user_message.to_string()),
        };
        let outcomes = self.hooks.run(HookEventKind::UserPromptSubmit, &prompt_hook_input).await;
        if let Some(reason) = blocking_reason(&outcomes) {
            let _ = event_tx.send(AgentEvent::Error(format!("blocked by hook: {reason}"))).await;
            self.emit(session_key.as_str(), EventKind::MessageError, serde_json::json!({ "reason": reason })).await;
            return Ok(());
        }

        session.add_user_message(user_message).await;
        self.emit(
            session_key.as_str(),
            EventKind::MessageStart,
            serde_json::json!({ "role": "user" }),
        )
        .await;

        let mut iterations = 0usize;
        let mut final_stop_reason = "end_turn".to_string();

        'turn: loop {
            if cancel.is_cancelled() {
                debug!("Turn cancelled before iteration {}", iterations + 1);
                final_stop_reason = "cancelled".to_string();
                break;
            }

            iterations += 1;
            if iterations > self.config.max_tool_iterations || iterations > STEP_LIMIT {
                let _ = event_tx.send(AgentEvent::Error("Max tool iterations exceeded".to_string())).await;
                final_stop_reason = "max_iterations".to_string();
                break;
            }

            let messages = session.get_messages().await;
            let model = session.model().await.unwrap_or_else(|| self.config.default_model.clone());
            let system_prompt = session.system_prompt().await;
            let system_tokens = system_prompt.as_deref().map(crate::compactor::estimate_tokens).unwrap_or(0);

            if self.compactor.needs_compaction(system_tokens, &messages) {
                let original_tokens = crate::compactor::total_tokens(system_tokens, &messages);
                let mut messages = messages;
                self.compactor.compact(system_tokens, &mut messages, &model).await;
                let compacted_tokens = crate::compactor::total_tokens(system_tokens, &messages);
                *session.messages_mut().await = messages;
                self.emit(
                    session_key.as_str(),
                    EventKind::ContextCompacted,
                    serde_json::json!({
                        "original_tokens": original_tokens,
                        "compacted_tokens": compacted_tokens,
                        "strategy": self.compactor.config().strategy.as_str(),
                        "model": model,
                    }),
                )
                .await;
            }

            let messages = session.get_messages().await;
            let (allowed, excluded) = session.tool_filter().await;
            let tool_defs = if allowed.is_empty() && excluded.is_empty() {
                self.tools.get_definitions()
            } else {
                self.tools.get_definitions_for(&allowed, &excluded)
            };
            let request = LlmRequest {
                model,
                messages,
                tools: Some(tool_defs),
                max_tokens: Some(8192),
                system: system_prompt,
                ..Default::default()
            };

            let stream = match self.provider.complete_stream(request, Some(cancel.clone())).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = event_tx.send(AgentEvent::Error(e.to_string())).await;
                    self.emit(session_key.as_str(), EventKind::MessageError, serde_json::json!({ "error": e.to_string() })).await;
                    return Err(e.to_string());
                }
            };

            let mut text_content = String::new();
            let mut tool_calls: Vec<AccumulatedToolCall> = Vec::new();
            let mut current_tool: Option<AccumulatedToolCall> = None;
            let mut stop_reason = "end_turn".to_string();
            let mut cancelled = false;

            tokio::pin!(stream);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("LLM stream cancelled for session {}", session_key);
                        cancelled = true;
                        break;
                    }
                    delta_opt = stream.next() => {
                        match delta_opt {
                            Some(Ok(delta)) => match delta {
                                StreamDelta::Text(text) => {
                                    text_content.push_str(&text);
                                    self.emit(session_key.as_str(), EventKind::MessageChunk, serde_json::json!({ "text": text })).await;
                                    let _ = event_tx.send(AgentEvent::Text(text)).await;
                                }
                                StreamDelta::Thinking(thinking) => {
                                    let _ = event_tx.send(AgentEvent::Thinking(thinking)).await;
                                }
                                StreamDelta::ToolCallStart { id, name } => {
                                    // The bus's `tool.call_start` fires once,
                                    // at dispatch time below — not here,
                                    // while arguments are still streaming in.
                                    current_tool = Some(AccumulatedToolCall { id: id.clone(), name: name.clone(), arguments: String::new() });
                                    let _ = event_tx.send(AgentEvent::ToolCallStart { id, name }).await;
                                }
                                StreamDelta::ToolCallDelta { id, arguments } => {
                                    if let Some(ref mut tool) = current_tool { tool.arguments.push_str(&arguments); }
                                    let _ = event_tx.send(AgentEvent::ToolCallDelta { id, arguments }).await;
                                }
                                StreamDelta::ToolCallEnd { id: _ } => {
                                    if let Some(tool) = current_tool.take() { tool_calls.push(tool); }
                                }
                                StreamDelta::Done { stop_reason: sr, usage } => {
                                    if let Some(r) = sr { stop_reason = r; }
                                    if let Some(u) = usage { session.record_usage(u.input_tokens, u.output_tokens); }
                                }
                                StreamDelta::Error(e) => {
                                    let _ = event_tx.send(AgentEvent::Error(e)).await;
                                }
                            },
                            Some(Err(e)) => { let _ = event_tx.send(AgentEvent::Error(e.to_string())).await; }
                            None => break,
                        }
                    }
                }
            }

            if cancelled {
                if !text_content.is_empty() {
                    session.add_assistant_text(&text_content).await;
                }
                final_stop_reason = "cancelled".to_string();
                break;
            }

            if tool_calls.is_empty() {
                session.add_assistant_text(&text_content).await;
            } else {
                let blocks: Vec<ContentBlock> = tool_calls
                    .iter()
                    .map(|tc| ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.parse_arguments().unwrap_or_default(),
                    })
                    .collect();
                session
                    .add_assistant_with_tools(
                        if text_content.is_empty() { None } else { Some(&text_content) },
                        blocks,
                    )
                    .await;
            }

            if tool_calls.is_empty() {
                final_stop_reason = stop_reason;
                break;
            }

            for tc in tool_calls {
                if cancel.is_cancelled() {
                    final_stop_reason = "cancelled".to_string();
                    info!(
                        "Turn cancelled: session={}, messages={}",
                        session_key,
                        session.message_count().await,
                    );
                    break 'turn;
                }

                // §8 property 5: exactly one `tool.call_start` per tool
                // invocation, emitted before any of the denial paths below
                // so a denied call still produces the
                // `tool.call_start, tool.call_error` pairing S3 expects.
                self.emit(session_key.as_str(), EventKind::ToolCallStart, serde_json::json!({ "id": tc.id, "name": tc.name })).await;

                let args = tc.parse_arguments().unwrap_or_default();

                let (allowed, excluded) = session.tool_filter().await;
                let spec_allows = excluded.iter().all(|t| t != &tc.name)
                    && (allowed.is_empty() || allowed.iter().any(|t| t == &tc.name));
                if !spec_allows {
                    let reason = "denied_by_policy".to_string();
                    session.add_tool_result(&tc.id, &format!("Denied: {reason}"), true).await;
                    self.emit(session_key.as_str(), EventKind::ToolCallError, serde_json::json!({ "id": tc.id, "name": tc.name, "reason": reason })).await;
                    let _ = event_tx.send(AgentEvent::ToolDenied { id: tc.id.clone(), name: tc.name.clone(), reason }).await;
                    continue;
                }

                let pre_input = HookInput {
                    session_id: session_key.as_str().to_string(),
                    hook_event_name: HookEventKind::PreToolUse.as_str().to_string(),
                    cwd: cwd.clone(),
                    tool_name: Some(tc.name.clone()),
                    tool_input: Some(args.clone()),
                    tool_response: None,
                    prompt: None,
                };
                let pre_outcomes = self.hooks.run(HookEventKind::PreToolUse, &pre_input).await;
                if let Some(hook_reason) = blocking_reason(&pre_outcomes) {
                    let reason = format!("denied_by_hook: {hook_reason}");
                    session.add_tool_result(&tc.id, &format!("Denied: {reason}"), true).await;
                    self.emit(session_key.as_str(), EventKind::ToolCallError, serde_json::json!({ "id": tc.id, "name": tc.name, "reason": reason })).await;
                    let _ = event_tx.send(AgentEvent::ToolDenied { id: tc.id.clone(), name: tc.name.clone(), reason }).await;
                    continue;
                }

                let decision = self.permissions.check(session_key.as_str(), &tc.name).await;
                if decision == ResolvedDecision::Deny {
                    let reason = "denied_by_policy".to_string();
                    session.add_tool_result(&tc.id, &format!("Denied: {reason}"), true).await;
                    self.emit(session_key.as_str(), EventKind::ToolCallError, serde_json::json!({ "id": tc.id, "name": tc.name, "reason": reason })).await;
                    let _ = event_tx.send(AgentEvent::ToolDenied { id: tc.id.clone(), name: tc.name.clone(), reason }).await;
                    continue;
                }

                let _ = event_tx.send(AgentEvent::ToolExecuting { id: tc.id.clone(), name: tc.name.clone() }).await;

                let result = self.tools.execute_cancellable(&tc.name, args.clone(), cancel.clone()).await;
                let is_error = result.is_error();
                let result_str = result.to_content_string();
                let result_str = if result_str.len() > 50_000 {
                    format!("{}...\n[truncated, {} total chars]", &result_str[..50_000], result_str.len())
                } else {
                    result_str
                };

                let post_input = HookInput {
                    session_id: session_key.as_str().to_string(),
                    hook_event_name: HookEventKind::PostToolUse.as_str().to_string(),
                    cwd: cwd.clone(),
                    tool_name: Some(tc.name.clone()),
                    tool_input: Some(args),
                    tool_response: Some(serde_json::json!({ "result": result_str, "is_error": is_error })),
                    prompt: None,
                };
                let post_outcomes = self.hooks.run(HookEventKind::PostToolUse, &post_input).await;
                for outcome in &post_outcomes {
                    if let HookOutcome::NonBlockingError(e) = outcome {
                        warn!("PostToolUse hook error: {}", e);
                    }
                }

                if is_error {
                    self.emit(session_key.as_str(), EventKind::ToolCallError, serde_json::json!({ "id": tc.id, "name": tc.name })).await;
                } else {
                    self.emit(session_key.as_str(), EventKind::ToolCallComplete, serde_json::json!({ "id": tc.id, "name": tc.name })).await;
                }
                let _ = event_tx
                    .send(AgentEvent::ToolResult { id: tc.id.clone(), name: tc.name.clone(), result: result_str.clone(), is_error })
                    .await;
                session.add_tool_result(&tc.id, &result_str, is_error).await;
            }

            debug!("Tool calls executed, continuing loop (iteration {})", iterations);
        }

        let stop_input = HookInput {
            session_id: session_key.as_str().to_string(),
            hook_event_name: HookEventKind::Stop.as_str().to_string(),
            cwd,
            tool_name: None,
            tool_input: None,
            tool_response: None,
            prompt: None,
        };
        let _ = self.hooks.run(HookEventKind::Stop, &stop_input).await;

        // §4.H.5 / §7: cancellation and the step-limit both surface as
        // `message.error` with a matching code instead of `message.complete`.
        match final_stop_reason.as_str() {
            "cancelled" => {
                self.emit(
                    session_key.as_str(),
                    EventKind::MessageError,
                    serde_json::json!({ "code": "CANCELLED" }),
                )
                .await;
            }
            "max_iterations" => {
                self.emit(
                    session_key.as_str(),
                    EventKind::MessageError,
                    serde_json::json!({ "code": "STEP_LIMIT" }),
                )
                .await;
            }
            _ => {
                self.emit(
                    session_key.as_str(),
                    EventKind::MessageComplete,
                    serde_json::json!({ "stop_reason": final_stop_reason }),
                )
                .await;
            }
        }
        let _ = event_tx.send(AgentEvent::Done { stop_reason: final_stop_reason }).await;

        info!(
            "Turn complete: session={}, messages={}",
            session_key,
            session.message_count().await,
        );
        Ok(())
    }
}

/// First blocking reason among a set of hook outcomes, if any.
fn blocking_reason(outcomes: &[HookOutcome]) -> Option<String> {
    outcomes.iter().find_map(|o| match o {
        HookOutcome::Blocked(reason) => Some(reason.clone()),
        _ => None,
    })
}

#[async_trait::async_trait]
impl SpawnableRuntime for AgentRuntime {
    /// Delegation primitive backing the `task` tool (§4.H Delegation): runs
    /// a bounded child turn in an isolated session and returns its final
    /// text plus a rough token estimate. Reuses `run_turn_cancellable`
    /// against a scratch session so the child gets the same hook/
    /// permission/compaction gating as a top-level turn.
    async fn spawn_child(
        &self,
        session_id: &str,
        system_prompt: &str,
        user_message: &str,
        max_iterations: usize,
    ) -> Result<(String, usize), String> {
        let session_key = SessionKey::from(format!("child:{}", session_id));
        let session = self.sessions.get_or_create(&session_key, Some(system_prompt));
        session.set_system_prompt(system_prompt).await;

        let child_config = AgentConfig {
            default_model: self.config.default_model.clone(),
            max_tool_iterations: max_iterations,
            system_prompt: Some(system_prompt.to_string()),
            workspace_root: self.config.workspace_root.clone(),
        };
        let child = AgentRuntime {
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            sessions: self.sessions.clone(),
            config: child_config,
            hooks: HookPipeline::new(),
            permissions: PermissionEngine::new(Default::default(), Default::default()),
            compactor: Compactor::new(Default::default()),
            events: self.events.clone(),
        };

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let cancel = CancellationToken::new();
        let child_session_key = session_key.clone();
        let msg = user_message.to_string();
        let handle = tokio::spawn(async move {
            child.run_turn_cancellable(&child_session_key, &msg, tx, cancel).await
        });

        let mut output = String::new();
        let mut token_estimate = 0usize;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Text(t) => {
                    token_estimate += t.len() / 4;
                    output.push_str(&t);
                }
                AgentEvent::Error(e) => {
                    if e != "Max tool iterations exceeded" {
                        tracing::warn!(child = session_id, "child error: {}", e);
                    }
                }
                _ => {}
            }
        }

        handle.await.map_err(|e| e.to_string())??;
        self.sessions.remove(&session_key);
        Ok((output, token_estimate))
    }
}
