//! Session Manager (§4.I) — owns sessions, bridges the agent loop's events
//! to the global event bus with session id injection, and is the
//! authoritative writer of `Session.status`.
//!
//! Generalized from the teacher's `SessionRegistry` (`DashMap<SessionKey,
//! Arc<Session>>`, `create_with_ctx`/`get_or_create`/`list`/`remove`, kept
//! as-is inside `amcp_agent::session`) with the addition of the message
//! queue (§4.G) and `AgentSpec` resolution the teacher's registry never
//! needed, since the teacher ran one hardcoded agent rather than a
//! registry of named specs.

use amcp_agent::queue::{MessageQueue, SubmitOutcome};
use amcp_agent::{AgentEvent, AgentRuntime, SessionKey, SessionStatus};
use amcp_core::{AgentSpec, ConflictStrategy, Error, Event, EventBus, EventKind, Priority, QueuedMessage, Result, SystemPromptRef};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Read-through snapshot of a session's state for `GET /sessions[/{id}]`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub agent_name: String,
    pub status: SessionStatus,
    pub message_count: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub queued_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of `SessionManager::prompt`, mirroring §4.G's `SubmitOutcome`
/// but carrying the queue position a client needs to render.
#[derive(Debug, Clone)]
pub enum PromptOutcome {
    /// The turn is running now; events stream on `event_tx` and the bus.
    Started,
    Queued { position: usize },
    Rejected,
}

pub struct SessionManager {
    runtime: Arc<AgentRuntime>,
    queue: Arc<MessageQueue>,
    bus: Arc<EventBus>,
    agent_specs: DashMap<String, AgentSpec>,
    session_agent: DashMap<String, String>,
}

impl SessionManager {
    pub fn new(runtime: Arc<AgentRuntime>, bus: Arc<EventBus>) -> Self {
        let agent_specs = DashMap::new();
        let mut default_spec = AgentSpec::default();
        default_spec.model = runtime.config().default_model.clone();
        if let Some(prompt) = &runtime.config().system_prompt {
            default_spec.system_prompt = SystemPromptRef::Literal(prompt.clone());
        }
        agent_specs.insert(default_spec.name.clone(), default_spec);
        Self {
            runtime,
            queue: Arc::new(MessageQueue::new()),
            bus,
            agent_specs,
            session_agent: DashMap::new(),
        }
    }

    pub fn register_agent(&self, spec: AgentSpec) {
        self.agent_specs.insert(spec.name.clone(), spec);
    }

    pub fn agent_specs(&self) -> Vec<AgentSpec> {
        self.agent_specs.iter().map(|e| e.value().clone()).collect()
    }

    pub fn agent_spec(&self, name: &str) -> Option<AgentSpec> {
        self.agent_specs.get(name).map(|e| e.value().clone())
    }

    pub fn tool_registry(&self) -> &Arc<amcp_tools::ToolRegistry> {
        self.runtime.tools()
    }

    /// `create(cwd, agent_name)` (§4.I). `cwd` is currently a single shared
    /// workspace root (set at gateway startup) rather than per-session —
    /// the teacher's registry has no per-session cwd either, and nothing in
    /// §6.1's `POST /sessions` body beyond the field name implies one; kept
    /// as an accepted-but-unused parameter so the REST handler's body shape
    /// matches the spec exactly.
    pub async fn create(&self, _cwd: Option<&str>, agent_name: Option<&str>) -> Result<SessionInfo> {
        let spec_name = agent_name.unwrap_or("default").to_string();
        let spec = self
            .agent_specs
            .get(&spec_name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::validation_error(format!("unknown agent '{}'", spec_name)))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let key = SessionKey::new(&session_id);

        let system_prompt = match &spec.system_prompt {
            SystemPromptRef::Literal(s) if s.is_empty() => None,
            SystemPromptRef::Literal(s) => Some(s.clone()),
            SystemPromptRef::Path(p) => tokio::fs::read_to_string(p).await.ok(),
        };

        let session = self.runtime.sessions().create_with_ctx(
            &key,
            system_prompt.as_deref(),
            self.runtime.workspace(),
        );
        session.set_model(&spec.model).await;
        session
            .set_tool_filter(spec.allowed_tools.clone(), spec.excluded_tools.clone())
            .await;
        self.session_agent.insert(session_id.clone(), spec_name.clone());

        self.bus
            .emit(
                Event::new(
                    EventKind::SessionCreated,
                    "session_manager",
                    serde_json::json!({ "session_id": session_id, "agent": spec_name }),
                )
                .with_session(&session_id),
            )
            .await;

        self.info(&session_id).await.ok_or_else(|| Error::Internal("session vanished after create".into()))
    }

    pub async fn info(&self, id: &str) -> Option<SessionInfo> {
        let key = SessionKey::new(id);
        let session = self.runtime.sessions().get(&key)?;
        let (input_tokens, output_tokens) = session.usage();
        Some(SessionInfo {
            id: id.to_string(),
            agent_name: self
                .session_agent
                .get(id)
                .map(|e| e.value().clone())
                .unwrap_or_else(|| "default".to_string()),
            status: session.status().await,
            message_count: session.message_count().await,
            input_tokens,
            output_tokens,
            queued_count: self.queue.queued_count(id).await,
            created_at: session.created_at(),
            updated_at: session.updated_at().await,
        })
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut out = Vec::new();
        for key in self.runtime.sessions().list() {
            if let Some(info) = self.info(key.as_str()).await {
                out.push(info);
            }
        }
        out
    }

    /// `delete(id)` (§4.I): removes from the registry and emits
    /// `session.deleted`. A turn already holding an `Arc<Session>` keeps
    /// the data alive until its own next suspension point observes
    /// cancellation — removing the map entry doesn't force-drop live state.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = SessionKey::new(id);
        let session = self
            .runtime
            .sessions()
            .get(&key)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.cancel().await;
        self.queue.clear(id).await;
        self.runtime.sessions().remove(&key);
        self.session_agent.remove(id);

        self.bus
            .emit(
                Event::new(EventKind::SessionDeleted, "session_manager", serde_json::json!({ "session_id": id }))
                    .with_session(id),
            )
            .await;
        Ok(())
    }

    /// `cancel(id, force)` (§4.I): signals the session's `CancellationToken`
    /// (generalized from the teacher's single mpsc abort channel so
    /// multiple suspension points — the stream race and the per-tool-call
    /// check — can observe it without consuming a one-shot message). With
    /// `force`, also drops anything still queued behind the running turn.
    pub async fn cancel(&self, id: &str, force: bool) -> Result<()> {
        let key = SessionKey::new(id);
        let session = self
            .runtime
            .sessions()
            .get(&key)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.cancel().await;
        if force {
            self.queue.clear(id).await;
        }
        Ok(())
    }

    /// `prompt(id, content, priority, stream, conflict_strategy)` (§4.I).
    /// Validates non-empty content, then either runs the turn immediately
    /// (session idle) or applies `conflict_strategy` (§8 property 3:
    /// `reject`+busy has *no* side effects — checked before any enqueue).
    ///
    /// `event_tx` receives every `AgentEvent` of a turn run *synchronously*
    /// by this call (i.e. when the outcome is `Started`) — used by the REST
    /// streaming endpoint. Turns that start later, after draining the
    /// queue, still emit onto the bus but have no direct subscriber here;
    /// WS/SSE clients pick them up from the bus instead.
    pub async fn prompt(
        self: &Arc<Self>,
        id: &str,
        content: &str,
        priority: Priority,
        conflict_strategy: ConflictStrategy,
        event_tx: mpsc::Sender<AgentEvent>,
    ) -> Result<PromptOutcome> {
        if content.trim().is_empty() {
            return Err(Error::validation_error("content must not be empty"));
        }
        let key = SessionKey::new(id);
        let session = self
            .runtime
            .sessions()
            .get(&key)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        let queued = QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: id.to_string(),
            prompt: content.to_string(),
            attachments: Vec::new(),
            priority,
            enqueue_seq: self.queue.next_seq(),
            metadata: HashMap::new(),
        };

        match self.queue.submit(queued, conflict_strategy).await {
            SubmitOutcome::Rejected => {
                // §8 property 3: reject+busy has no side effects and emits
                // only `prompt.rejected` — `prompt.received` never fires.
                self.bus
                    .emit(
                        Event::new(EventKind::PromptRejected, "session_manager", serde_json::json!({ "session_id": id }))
                            .with_session(id),
                    )
                    .await;
                Ok(PromptOutcome::Rejected)
            }
            SubmitOutcome::Queued { position } => {
                self.bus
                    .emit(
                        Event::new(EventKind::PromptReceived, "session_manager", serde_json::json!({ "session_id": id }))
                            .with_session(id),
                    )
                    .await;
                self.bus
                    .emit(
                        Event::new(
                            EventKind::PromptQueued,
                            "session_manager",
                            serde_json::json!({ "session_id": id, "position": position }),
                        )
                        .with_session(id),
                    )
                    .await;
                Ok(PromptOutcome::Queued { position })
            }
            SubmitOutcome::RunNow => {
                self.bus
                    .emit(
                        Event::new(EventKind::PromptReceived, "session_manager", serde_json::json!({ "session_id": id }))
                            .with_session(id),
                    )
                    .await;
                session.set_status(SessionStatus::Busy).await;
                self.bus
                    .emit(
                        Event::new(EventKind::PromptStarted, "session_manager", serde_json::json!({ "session_id": id }))
                            .with_session(id),
                    )
                    .await;
                let manager = self.clone();
                let session_id = id.to_string();
                let first_prompt = content.to_string();
                tokio::spawn(async move {
                    manager.run_and_drain(session_id, first_prompt, event_tx).await;
                });
                Ok(PromptOutcome::Started)
            }
        }
    }

    /// Runs one turn, then keeps draining the session's queue until it's
    /// empty, marking the session idle between releases per §4.G's "one
    /// agent loop running at a time" model. Only the first turn's events go
    /// to `event_tx` (the caller that triggered `RunNow`); subsequent
    /// drained turns are fire-and-forget onto the bus only.
    async fn run_and_drain(self: Arc<Self>, session_id: String, first_prompt: String, event_tx: mpsc::Sender<AgentEvent>) {
        let key = SessionKey::new(&session_id);
        let Some(session) = self.runtime.sessions().get(&key) else {
            return;
        };

        let mut prompt = first_prompt;
        let mut tx = event_tx;
        loop {
            let cancel = session.cancel_token().await;
            let result = self
                .runtime
                .run_turn_cancellable(&key, &prompt, tx.clone(), cancel)
                .await;
            if let Err(e) = result {
                warn!(session = %session_id, error = %e, "turn ended in error");
                session.set_status(SessionStatus::Error).await;
            }
            session.reset_cancel_token().await;

            match self.queue.release(&session_id).await {
                Some(next) => {
                    prompt = next.prompt;
                    let (drain_tx, mut drain_rx) = mpsc::channel::<AgentEvent>(256);
                    tokio::spawn(async move { while drain_rx.recv().await.is_some() {} });
                    tx = drain_tx;
                    session.set_status(SessionStatus::Busy).await;
                    self.bus
                        .emit(
                            Event::new(
                                EventKind::PromptStarted,
                                "session_manager",
                                serde_json::json!({ "session_id": session_id }),
                            )
                            .with_session(&session_id),
                        )
                        .await;
                }
                None => {
                    if session.status().await != SessionStatus::Error {
                        session.set_status(SessionStatus::Idle).await;
                    }
                    break;
                }
            }
        }
    }
}
