//! Server surface (§4.K, §6.1/§6.2) — HTTP REST, SSE, and WebSocket
//! endpoints wrapping the session manager (§4.I) and protocol adapter
//! (§4.J).
//!
//! Grounded on the teacher's `start_gateway`/axum `Router` bootstrap (bind
//! address resolution, CORS layer, `tokio::net::TcpListener` + `axum::serve`
//! shape) generalized from the teacher's single hardcoded "web console"
//! route set to the spec's `/api/v1` REST surface. The teacher's bespoke
//! "bee protocol" endpoints (`/surface`, `/plan`, `/test`, `/hints`) and
//! inline HTML chat console have no counterpart in the spec and are dropped.

use crate::approvals::ApprovalRegistry;
use crate::auth::ResolvedAuth;
use crate::manager::{PromptOutcome, SessionManager};
use crate::ws::handle_connection;
use amcp_agent::{AgentConfig, AgentEvent, AgentRuntime, HookPipeline, PermissionEngine, SubagentRegistry};
use amcp_core::permission::{ApprovalAnswer, LayeredRules, SessionMode};
use amcp_core::protocol::to_sse_frame;
use amcp_core::queued_message::{ConflictStrategy, Priority};
use amcp_core::{Error, Event, EventBus, EventKind, GatewayConfig, RootConfig};
use amcp_tools::{create_default_registry_with_handles, create_runtime_handle, create_subagent_handle, ToolRegistry};
use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub struct ExtendedConfig {
    pub gateway: GatewayConfig,
    pub anthropic_api_key: Option<String>,
    pub workspace_root: PathBuf,
    pub system_prompt: Option<String>,
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            anthropic_api_key: None,
            workspace_root: std::env::current_dir().unwrap_or_default(),
            system_prompt: None,
        }
    }
}

/// Shared state handed to every handler and to `ws::handle_connection`.
pub struct AppState {
    pub auth: ResolvedAuth,
    pub manager: Arc<SessionManager>,
    pub bus: Arc<EventBus>,
    pub tools: Arc<ToolRegistry>,
    pub approvals: Arc<ApprovalRegistry>,
    pub started_at: Instant,
    pub port: u16,
    pub ws_connections: AtomicUsize,
    pub sse_connections: AtomicUsize,
}

const PROTOCOL_VERSION: &str = "1";

pub async fn start_gateway(config: ExtendedConfig) -> anyhow::Result<()> {
    let env_token = std::env::var("AMCP_GATEWAY_TOKEN").ok();
    let auth = ResolvedAuth::from_config(&config.gateway.auth, env_token);

    let api_key = config
        .anthropic_api_key
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

    let runtime_handle = create_runtime_handle();
    let subagent_handle = create_subagent_handle();
    let tools = create_default_registry_with_handles(
        &config.workspace_root,
        runtime_handle.clone(),
        subagent_handle.clone(),
    );
    info!("Registered tools: {:?}", tools.list());

    let root_config = RootConfig::discover(&config.workspace_root);

    let agent_config = AgentConfig {
        default_model: std::env::var("AMCP_MODEL")
            .ok()
            .or(root_config.chat.default_model.clone())
            .unwrap_or_else(|| "claude-opus-4-1-20250805".to_string()),
        max_tool_iterations: 25,
        system_prompt: config.system_prompt.or_else(|| std::env::var("AMCP_SYSTEM_PROMPT").ok()),
        workspace_root: config.workspace_root.clone(),
    };

    let bus = Arc::new(EventBus::new());

    let mut hooks = HookPipeline::new();
    for handler in root_config.hooks.hooks {
        hooks.register(handler);
    }
    let mut layers = LayeredRules::default();
    layers.user_config = root_config.chat.permission_rules;
    let approvals = Arc::new(ApprovalRegistry::new());
    let ask_bus = bus.clone();
    let ask_approvals = approvals.clone();
    let ask_callback: amcp_agent::AskCallback = Arc::new(move |session_id, key| {
        let (approval_id, rx) = ask_approvals.register();
        let bus = ask_bus.clone();
        let payload = serde_json::json!({
            "approval_id": approval_id,
            "session_id": session_id.clone(),
            "tool": key,
        });
        tokio::spawn(async move {
            bus.emit(
                Event::new(EventKind::ApprovalRequired, "permission_engine", payload)
                    .with_session(&session_id),
            )
            .await;
        });
        rx
    });
    let permissions = PermissionEngine::new(layers, SessionMode::Normal).with_ask_callback(ask_callback);

    let runtime = if let Ok(api_url) = std::env::var("ANTHROPIC_API_URL") {
        let provider = amcp_llm::AnthropicProvider::new(&api_key)
            .with_base_url(format!("{}/v1/messages", api_url));
        info!("Using custom API URL: {}/v1/messages", api_url);
        AgentRuntime::with_provider(Arc::new(provider), tools, agent_config)
    } else {
        AgentRuntime::new(&api_key, tools, agent_config)
    }
    .with_event_bus(bus.clone())
    .with_hooks(hooks)
    .with_permissions(permissions);
    let runtime = Arc::new(runtime);
    *runtime_handle.write().await = Some(runtime.clone() as Arc<dyn amcp_tools::SpawnableRuntime>);

    let subagent_registry = Arc::new(SubagentRegistry::new());
    *subagent_handle.write().await = Some(subagent_registry as amcp_tools::SubagentRegistryHandle);

    let manager = Arc::new(SessionManager::new(runtime.clone(), bus.clone()));

    let state = Arc::new(AppState {
        auth,
        manager,
        bus,
        tools: runtime.tools().clone(),
        approvals,
        started_at: Instant::now(),
        port: config.gateway.port,
        ws_connections: AtomicUsize::new(0),
        sse_connections: AtomicUsize::new(0),
    });

    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/status", get(status_handler))
        .route("/sessions", post(create_session_handler).get(list_sessions_handler))
        .route(
            "/sessions/{id}",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/sessions/{id}/prompt", post(prompt_handler))
        .route("/sessions/{id}/cancel", post(cancel_handler))
        .route("/sessions/{id}/approvals/{approval_id}", post(resolve_approval_handler))
        .route("/sessions/{id}/events", get(session_events_handler))
        .route("/tools", get(list_tools_handler))
        .route("/tools/{name}/execute", post(execute_tool_handler))
        .route("/agents", get(list_agents_handler))
        .route("/agents/{name}", get(get_agent_handler))
        .route("/events", get(events_handler));

    let app = Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state.clone());

    let bind_addr: SocketAddr =
        format!("{}:{}", config.gateway.bind.to_addr(), config.gateway.port)
            .parse()
            .expect("invalid bind address");

    info!("Amcp Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  REST:      http://{}/api/v1", bind_addr);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Auth mode: {:?}", config.gateway.auth.mode);
    info!("  Workspace: {:?}", config.workspace_root);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Uniform `{error: {code, message}}` body for every non-2xx response
/// (§6.5's closed error-code taxonomy).
fn error_response(err: Error) -> Response {
    let status = err.http_status();
    let body = Json(serde_json::json!({
        "error": { "code": err.error_code(), "message": err.to_string() }
    }));
    (status, body).into_response()
}

fn auth_error() -> Response {
    error_response(Error::auth_failed("missing or invalid bearer token"))
}

/// Bearer-token check for REST handlers. A no-op when `AuthMode::None`.
fn check_auth(state: &AppState, header: Option<&str>) -> bool {
    let token = header.and_then(|h| h.strip_prefix("Bearer "));
    state.auth.verify_token(token).is_ok()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agents: Vec<String> = state.manager.agent_specs().into_iter().map(|s| s.name).collect();
    Json(serde_json::json!({
        "name": "amcp",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "capabilities": ["prompt", "cancel", "tools", "agents", "events", "sse", "websocket"],
        "agents": agents,
        "tools_count": state.tools.list().len(),
    }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.manager.list().await;
    Json(serde_json::json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": {
            "active": sessions.iter().filter(|s| s.status == amcp_agent::SessionStatus::Busy).count(),
            "total": sessions.len(),
        },
        "connections": {
            "websocket": state.ws_connections.load(Ordering::Relaxed),
            "sse": state.sse_connections.load(Ordering::Relaxed),
        },
    }))
}

#[derive(Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    agent_name: Option<String>,
}

async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    body: Option<Json<CreateSessionBody>>,
) -> Response {
    if !check_auth(&state, headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())) {
        return auth_error();
    }
    let body = body.map(|Json(b)| b).unwrap_or(CreateSessionBody { cwd: None, agent_name: None });
    match state.manager.create(body.cwd.as_deref(), body.agent_name.as_deref()).await {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.manager.list().await;
    Json(serde_json::json!({ "sessions": sessions, "total": sessions.len() }))
}

async fn get_session_handler(AxumPath(id): AxumPath<String>, State(state): State<Arc<AppState>>) -> Response {
    match state.manager.info(&id).await {
        Some(info) => Json(info).into_response(),
        None => error_response(Error::SessionNotFound(id)),
    }
}

async fn delete_session_handler(AxumPath(id): AxumPath<String>, State(state): State<Arc<AppState>>) -> Response {
    match state.manager.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct PromptBody {
    content: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    conflict_strategy: Option<ConflictStrategy>,
}

/// Renders one `AgentEvent` (the synchronous per-request channel — see
/// `SessionManager::prompt`'s doc comment) as a `text/plain` streaming
/// chunk (§4.J): bare text, bracketed markers around tool calls.
fn agent_event_to_chunk(ev: &AgentEvent) -> Option<String> {
    match ev {
        AgentEvent::Text(t) => Some(t.clone()),
        AgentEvent::ToolCallStart { name, .. } => Some(format!("\n[tool:{name}]\n")),
        AgentEvent::ToolResult { name, .. } => Some(format!("[/tool:{name}]\n")),
        AgentEvent::ToolDenied { name, reason, .. } => Some(format!("[denied:{name}: {reason}]\n")),
        AgentEvent::Error(e) => Some(format!("\n[error: {e}]\n")),
        _ => None,
    }
}

async fn prompt_handler(
    AxumPath(id): AxumPath<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PromptBody>,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let priority = body.priority.unwrap_or_default();
    let conflict_strategy = body.conflict_strategy.unwrap_or_default();
    let stream = body.stream.unwrap_or(false);

    let outcome = match state.manager.prompt(&id, &body.content, priority, conflict_strategy, tx).await {
        Ok(o) => o,
        Err(e) => return error_response(e),
    };

    match outcome {
        PromptOutcome::Rejected => error_response(Error::session_busy(id)),
        PromptOutcome::Queued { position } => Json(serde_json::json!({
            "session_id": id,
            "status": "queued",
            "position": position,
        }))
        .into_response(),
        PromptOutcome::Started if stream => {
            let body_stream = async_stream::stream! {
                while let Some(ev) = rx.recv().await {
                    if let Some(chunk) = agent_event_to_chunk(&ev) {
                        yield Ok::<_, std::io::Error>(chunk.into_bytes());
                    }
                    if matches!(ev, AgentEvent::Done { .. }) {
                        break;
                    }
                }
            };
            Response::builder()
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(Body::from_stream(body_stream))
                .unwrap()
        }
        PromptOutcome::Started => {
            let mut content = String::new();
            let mut stop_reason = "end_turn".to_string();
            let mut errored = false;
            while let Some(ev) = rx.recv().await {
                match ev {
                    AgentEvent::Text(t) => content.push_str(&t),
                    AgentEvent::Error(e) => {
                        errored = true;
                        content.push_str(&format!("\n[error: {e}]"));
                    }
                    AgentEvent::Done { stop_reason: sr } => {
                        stop_reason = sr;
                        break;
                    }
                    _ => {}
                }
            }
            Json(serde_json::json!({
                "session_id": id,
                "content": content,
                "stop_reason": stop_reason,
                "success": !errored,
            }))
            .into_response()
        }
    }
}

#[derive(Deserialize)]
struct CancelBody {
    #[serde(default)]
    force: bool,
}

async fn cancel_handler(
    AxumPath(id): AxumPath<String>,
    State(state): State<Arc<AppState>>,
    body: Option<Json<CancelBody>>,
) -> Response {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    match state.manager.cancel(&id, force).await {
        Ok(()) => Json(serde_json::json!({ "message": "cancelled", "session_id": id })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

impl From<ApprovalDecision> for ApprovalAnswer {
    fn from(d: ApprovalDecision) -> Self {
        match d {
            ApprovalDecision::AllowOnce => ApprovalAnswer::AllowOnce,
            ApprovalDecision::AllowAlways => ApprovalAnswer::AllowAlways,
            ApprovalDecision::Deny => ApprovalAnswer::Deny,
        }
    }
}

#[derive(Deserialize)]
struct ApprovalBody {
    decision: ApprovalDecision,
}

/// `POST /sessions/{id}/approvals/{approval_id}` (§6.1 ADDED) — resolves a
/// permission engine `ask` suspended on the `approval_id` minted in that
/// session's `approval_required` event payload. `id` is validated against
/// an existing session so a stray approval id can't be replayed against an
/// unrelated/deleted session, but the actual correlation is the
/// `approval_id` itself.
async fn resolve_approval_handler(
    AxumPath((id, approval_id)): AxumPath<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ApprovalBody>,
) -> Response {
    if state.manager.info(&id).await.is_none() {
        return error_response(Error::SessionNotFound(id));
    }
    if state.approvals.resolve(&approval_id, body.decision.into()) {
        Json(serde_json::json!({ "resolved": true, "approval_id": approval_id })).into_response()
    } else {
        error_response(Error::validation_error(format!(
            "no pending approval '{}'",
            approval_id
        )))
    }
}

#[derive(Serialize)]
struct ToolSummary {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

async fn list_tools_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let defs = state.tools.get_definitions();
    let tools: Vec<ToolSummary> = defs
        .into_iter()
        .map(|d| ToolSummary { name: d.name, description: d.description, parameters: d.input_schema })
        .collect();
    Json(serde_json::json!({ "tools": tools, "total": tools.len() }))
}

#[derive(Deserialize)]
struct ExecuteToolBody {
    #[serde(default)]
    arguments: serde_json::Value,
}

async fn execute_tool_handler(
    AxumPath(name): AxumPath<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteToolBody>,
) -> Response {
    let Some(tool) = state.tools.get(&name) else {
        return error_response(Error::MethodNotFound(name));
    };
    let result = tool.execute(body.arguments).await;
    Json(serde_json::json!({
        "success": !result.is_error(),
        "result": result.to_content_string(),
        "error": if result.is_error() { Some(result.to_content_string()) } else { None },
    }))
    .into_response()
}

async fn list_agents_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agents = state.manager.agent_specs();
    Json(serde_json::json!({ "agents": agents, "total": agents.len() }))
}

async fn get_agent_handler(AxumPath(name): AxumPath<String>, State(state): State<Arc<AppState>>) -> Response {
    match state.manager.agent_spec(&name) {
        Some(spec) => Json(spec).into_response(),
        None => error_response(Error::validation_error(format!("unknown agent '{}'", name))),
    }
}

/// `GET /events` (§6.1) — the unfiltered SSE firehose. Every event the bus
/// emits, rendered per §4.J's `event: <dotted>\ndata: <json>\n\n` shape.
async fn events_handler(State(state): State<Arc<AppState>>) -> Response {
    sse_stream(state, None)
}

/// `GET /sessions/{id}/events` — the session-filtered counterpart.
async fn session_events_handler(AxumPath(id): AxumPath<String>, State(state): State<Arc<AppState>>) -> Response {
    sse_stream(state, Some(id))
}

fn sse_stream(state: Arc<AppState>, filter: Option<String>) -> Response {
    state.sse_connections.fetch_add(1, Ordering::Relaxed);
    let mut rx = state.bus.subscribe_all();
    let counter = state.clone();
    let body_stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if let Some(ref sid) = filter {
                        if ev.session_id.as_deref() != Some(sid.as_str()) {
                            continue;
                        }
                    }
                    yield Ok::<_, std::io::Error>(to_sse_frame(&ev).into_bytes());
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        counter.sse_connections.fetch_sub(1, Ordering::Relaxed);
    };
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

#[derive(Deserialize)]
struct WsQuery {
    session_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.session_id))
}
