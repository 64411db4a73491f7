//! Protocol adapter — translates one canonical `ServerEvent` into the three
//! wire forms the server surface exposes: an HTTP streaming chunk, a
//! WebSocket frame, and an SSE frame.
//!
//! Grounded on the teacher's `rpc.rs::output_event_to_message` (the
//! `OutputEvent -> EventMessage` mapping feeding its single WS wire format)
//! and `server.rs`'s inline chat client, generalized here into three
//! independent serializers sharing one input type rather than one WS-only
//! mapping. The teacher's JSON-RPC request/response/event trio doesn't
//! survive the rewrite: the dotted event taxonomy (`EventKind::as_dotted`)
//! is now the single source of truth for what an event "is", and each
//! transport just renders it differently.

use crate::events::{Event, EventKind};
use serde::{Deserialize, Serialize};

/// The wire-frame discriminant carried by every WebSocket message (§6.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Request,
    Response,
    Event,
    Error,
}

/// Client->server `payload.action` (§6.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    Prompt,
    Cancel,
}

/// Server->client `payload.kind` (§6.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    ToolCall,
    ToolResult,
    Complete,
}

/// A single `{type, id?, timestamp, payload}` WebSocket frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl WsFrame {
    pub fn new(frame_type: FrameType, id: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            frame_type,
            id,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            FrameType::Error,
            id,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }
}

/// Client->server request frame payload: `{action, session_id, content?, ...}`.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientRequest {
    pub action: ClientAction,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub priority: Option<crate::queued_message::Priority>,
    #[serde(default)]
    pub conflict_strategy: Option<crate::queued_message::ConflictStrategy>,
    #[serde(default)]
    pub force: bool,
}

/// Incoming WebSocket message: an auth shorthand (`{"token": "..."}`, sent
/// once before any `prompt`/`cancel` frame), a full enveloped `WsFrame`, or
/// the bare `{action, ...}` shorthand clients commonly send with no
/// envelope at all. The three shapes are structurally disjoint (`token` vs.
/// `type`+`payload` vs. a required `action`), so `serde`'s untagged
/// matching never has to guess between them.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum IncomingFrame {
    Auth {
        token: Option<String>,
    },
    Enveloped {
        #[serde(rename = "type")]
        frame_type: FrameType,
        #[serde(default)]
        id: Option<String>,
        payload: ClientRequest,
    },
    Bare(ClientRequest),
}

impl IncomingFrame {
    pub fn request(self) -> Option<(Option<String>, ClientRequest)> {
        match self {
            IncomingFrame::Auth { .. } => None,
            IncomingFrame::Enveloped { id, payload, .. } => Some((id, payload)),
            IncomingFrame::Bare(payload) => Some((None, payload)),
        }
    }
}

/// Maps an internal `EventKind` to the wire `payload.kind` it renders as.
/// Event kinds with no direct payload-kind counterpart (session lifecycle,
/// queue bookkeeping) fall back to `None`, meaning "frame the whole event
/// under `Event`, but there is no text/tool_call/tool_result/complete shape
/// to narrow it to" — the frame still carries the dotted kind in its
/// payload so clients can discriminate themselves.
fn payload_kind(kind: EventKind) -> Option<PayloadKind> {
    match kind {
        EventKind::MessageChunk => Some(PayloadKind::Text),
        EventKind::ToolCallStart => Some(PayloadKind::ToolCall),
        EventKind::ToolCallComplete | EventKind::ToolCallError => Some(PayloadKind::ToolResult),
        EventKind::MessageComplete => Some(PayloadKind::Complete),
        _ => None,
    }
}

/// Renders an `Event` as a WebSocket frame (§4.J/§6.2).
pub fn to_ws_frame(event: &Event) -> WsFrame {
    let mut payload = serde_json::json!({
        "event": event.kind.as_dotted(),
        "session_id": event.session_id,
        "seq": event.seq,
        "data": event.payload,
    });
    if let Some(kind) = payload_kind(event.kind) {
        payload["kind"] = serde_json::to_value(kind).unwrap_or(serde_json::Value::Null);
    }
    WsFrame::new(FrameType::Event, None, payload)
}

/// Renders an `Event` as an `text/event-stream` frame (§6.1's SSE
/// endpoints): `event: <dotted-kind>\ndata: <json>\n\n`.
pub fn to_sse_frame(event: &Event) -> String {
    let data = serde_json::json!({
        "session_id": event.session_id,
        "seq": event.seq,
        "data": event.payload,
    });
    format!(
        "event: {}\ndata: {}\n\n",
        event.kind.as_dotted(),
        serde_json::to_string(&data).unwrap_or_else(|_| "{}".to_string())
    )
}

/// Renders an `Event` as a chunk of the `text/plain` HTTP streaming body
/// (§4.J): bare text for `message.chunk`, bracketed markers around tool
/// calls, everything else dropped (the streaming body has no side channel).
pub fn to_http_chunk(event: &Event) -> Option<String> {
    match event.kind {
        EventKind::MessageChunk => event
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        EventKind::ToolCallStart => {
            let name = event.payload.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
            Some(format!("[tool:{name}]\n"))
        }
        EventKind::ToolCallComplete | EventKind::ToolCallError => {
            let name = event.payload.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
            Some(format!("[/tool:{name}]\n"))
        }
        _ => None,
    }
}

/// An ACP (`session_update`) external-agent event, pre-decoded into its
/// variant tag and raw payload, ready to map onto our `EventKind` taxonomy
/// (§6.4).
#[derive(Clone, Debug, Deserialize)]
pub struct AcpSessionUpdate {
    #[serde(rename = "sessionUpdate")]
    pub update_kind: String,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

/// Maps an ACP `session_update` into our internal `EventKind` per §6.4's
/// fixed table. Unknown update kinds are not an error: they surface as
/// `MessageChunk` carrying the raw payload so nothing is silently dropped.
pub fn from_acp_kind(update_kind: &str) -> EventKind {
    match update_kind {
        "agent_message" => EventKind::MessageChunk,
        "agent_response" => EventKind::MessageComplete,
        "agent_thought" => EventKind::AgentThinking,
        "tool_call_start" => EventKind::ToolCallStart,
        "tool_call_update" => EventKind::ToolCallComplete,
        "current_mode_update" => EventKind::SessionStatusChanged,
        "plan" => EventKind::AgentThinking,
        _ => EventKind::MessageChunk,
    }
}
