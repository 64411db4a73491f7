//! Message queue — per-session prompt queue with a busy flag (§4.G).
//!
//! Grounded on the teacher's `ConsciousnessLoop` priority-buffer drain
//! (`recv_with_priority`'s "drain what's ready, sort by priority, pop the
//! max" shape) for the heap-ordering mechanics, but the teacher's queue was
//! built around a single ordered consumer where a `Human` message always
//! preempts a running tool/LLM call. This module replaces that semantics
//! with the spec's: a session has one agent loop running at a time: a new
//! prompt arriving while busy is queued (or rejected, per
//! `ConflictStrategy`) rather than preempting in-flight work. Cancellation
//! is a distinct, explicit operation on the session itself
//! (`Session::cancel_token`/`SessionManager::cancel`), never an implicit
//! side effect of a new prompt enqueuing.

use amcp_core::{ConflictStrategy, Priority, QueuedMessage};
use dashmap::DashMap;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Heap wrapper ordering `QueuedMessage` by `order_key()` (higher priority,
/// then earlier arrival, pops first).
struct HeapEntry(QueuedMessage);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.order_key() == other.0.order_key()
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.order_key().cmp(&other.0.order_key())
    }
}

/// Per-session queue state: a priority heap of pending prompts plus whether
/// the session's agent loop currently holds the "running" slot.
#[derive(Default)]
struct SessionQueue {
    pending: BinaryHeap<HeapEntry>,
    busy: bool,
}

/// Outcome of `MessageQueue::submit`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// No turn was running; the caller should start the agent loop now.
    RunNow,
    /// A turn was already running; the message was appended to the queue.
    Queued { position: usize },
    /// A turn was already running and the session's conflict strategy is
    /// `Reject`; the caller must respond `409 SESSION_BUSY`.
    Rejected,
}

/// Per-session prompt queue plus busy flag (§4.G). One `MessageQueue` is
/// shared across all sessions; state is sharded per session key in a
/// `DashMap`, mirroring the teacher's `SessionRegistry` sharding.
pub struct MessageQueue {
    queues: DashMap<String, Arc<Mutex<SessionQueue>>>,
    enqueue_seq: AtomicU64,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            enqueue_seq: AtomicU64::new(1),
        }
    }

    fn queue_for(&self, session_id: &str) -> Arc<Mutex<SessionQueue>> {
        self.queues
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionQueue::default())))
            .clone()
    }

    /// Submit a prompt for `session_id`. If the session is idle, marks it
    /// busy and returns `RunNow` — the caller runs the agent loop
    /// immediately. If busy, applies `conflict_strategy`: `Queue` appends
    /// the message (returning its position), `Reject` returns `Rejected`
    /// without any side effect.
    pub async fn submit(
        &self,
        message: QueuedMessage,
        conflict_strategy: ConflictStrategy,
    ) -> SubmitOutcome {
        let q = self.queue_for(&message.session_id);
        let mut guard = q.lock().await;

        if !guard.busy {
            guard.busy = true;
            return SubmitOutcome::RunNow;
        }

        match conflict_strategy {
            ConflictStrategy::Reject => SubmitOutcome::Rejected,
            ConflictStrategy::Queue => {
                let position = guard.pending.len() + 1;
                guard.pending.push(HeapEntry(message));
                SubmitOutcome::Queued { position }
            }
        }
    }

    /// Allocate the next monotonic enqueue sequence number for FIFO
    /// tie-breaking within a priority class.
    pub fn next_seq(&self) -> u64 {
        self.enqueue_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Called by the agent loop when a turn finishes. Pops the next queued
    /// message (highest priority, earliest arrival) if any; if the queue is
    /// empty, marks the session idle and returns `None`.
    pub async fn release(&self, session_id: &str) -> Option<QueuedMessage> {
        let q = self.queue_for(session_id);
        let mut guard = q.lock().await;
        match guard.pending.pop() {
            Some(HeapEntry(next)) => Some(next),
            None => {
                guard.busy = false;
                None
            }
        }
    }

    /// Drop every queued (not yet running) message for a session, e.g. on
    /// session deletion. Does not affect a currently-running turn.
    pub async fn clear(&self, session_id: &str) -> usize {
        let q = self.queue_for(session_id);
        let mut guard = q.lock().await;
        let dropped = guard.pending.len();
        guard.pending.clear();
        dropped
    }

    /// Whether a session currently holds the running slot.
    pub async fn is_busy(&self, session_id: &str) -> bool {
        let q = self.queue_for(session_id);
        q.lock().await.busy
    }

    /// Number of prompts waiting behind the running turn.
    pub async fn queued_count(&self, session_id: &str) -> usize {
        let q = self.queue_for(session_id);
        q.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn msg(id: &str, session: &str, priority: Priority, seq: u64) -> QueuedMessage {
        QueuedMessage {
            id: id.to_string(),
            session_id: session.to_string(),
            prompt: "hi".to_string(),
            attachments: vec![],
            priority,
            enqueue_seq: seq,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn first_submit_runs_immediately() {
        let q = MessageQueue::new();
        let outcome = q.submit(msg("a", "s1", Priority::Normal, 1), ConflictStrategy::Queue).await;
        assert_eq!(outcome, SubmitOutcome::RunNow);
        assert!(q.is_busy("s1").await);
    }

    #[tokio::test]
    async fn second_submit_while_busy_queues() {
        let q = MessageQueue::new();
        q.submit(msg("a", "s1", Priority::Normal, 1), ConflictStrategy::Queue).await;
        let outcome = q.submit(msg("b", "s1", Priority::Normal, 2), ConflictStrategy::Queue).await;
        assert_eq!(outcome, SubmitOutcome::Queued { position: 1 });
        assert_eq!(q.queued_count("s1").await, 1);
    }

    #[tokio::test]
    async fn reject_strategy_has_no_side_effect() {
        let q = MessageQueue::new();
        q.submit(msg("a", "s1", Priority::Normal, 1), ConflictStrategy::Queue).await;
        let outcome = q.submit(msg("b", "s1", Priority::Normal, 2), ConflictStrategy::Reject).await;
        assert_eq!(outcome, SubmitOutcome::Rejected);
        assert_eq!(q.queued_count("s1").await, 0);
    }

    #[tokio::test]
    async fn release_pops_highest_priority_first() {
        let q = MessageQueue::new();
        q.submit(msg("a", "s1", Priority::Normal, 1), ConflictStrategy::Queue).await;
        q.submit(msg("low", "s1", Priority::Low, 2), ConflictStrategy::Queue).await;
        q.submit(msg("urgent", "s1", Priority::Urgent, 3), ConflictStrategy::Queue).await;

        let next = q.release("s1").await.unwrap();
        assert_eq!(next.id, "urgent");
        assert!(q.is_busy("s1").await);
    }

    #[tokio::test]
    async fn release_with_empty_queue_marks_idle() {
        let q = MessageQueue::new();
        q.submit(msg("a", "s1", Priority::Normal, 1), ConflictStrategy::Queue).await;
        assert!(q.release("s1").await.is_none());
        assert!(!q.is_busy("s1").await);
    }

    #[tokio::test]
    async fn clear_drops_pending_without_touching_busy_flag() {
        let q = MessageQueue::new();
        q.submit(msg("a", "s1", Priority::Normal, 1), ConflictStrategy::Queue).await;
        q.submit(msg("b", "s1", Priority::Normal, 2), ConflictStrategy::Queue).await;
        let dropped = q.clear("s1").await;
        assert_eq!(dropped, 1);
        assert!(q.is_busy("s1").await);
    }
}
