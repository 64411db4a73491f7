//! Queued prompt — a message waiting for its session's agent loop to free up.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Queue priority. Higher values are serviced first; ties break FIFO on
/// enqueue order (a monotonic sequence counter, not wall-clock time — see
/// `amcp_agent::message_queue`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// What happens when a prompt arrives for a session that's already busy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Default: append to the session's queue.
    Queue,
    /// Respond `409 SESSION_BUSY` immediately with no side effects.
    Reject,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::Queue
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Monotonic enqueue sequence number, used for FIFO tie-breaking.
    pub enqueue_seq: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueuedMessage {
    /// Heap ordering key: higher priority first, then lower sequence
    /// (earlier arrival) first. Pair with `std::cmp::Reverse` on a
    /// `BinaryHeap` to get a min-heap-like earliest-highest-priority pop.
    pub fn order_key(&self) -> (Priority, std::cmp::Reverse<u64>) {
        (self.priority, std::cmp::Reverse(self.enqueue_seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_orders_first() {
        let urgent = QueuedMessage {
            id: "a".into(),
            session_id: "s".into(),
            prompt: "x".into(),
            attachments: vec![],
            priority: Priority::Urgent,
            enqueue_seq: 5,
            metadata: HashMap::new(),
        };
        let normal = QueuedMessage {
            id: "b".into(),
            session_id: "s".into(),
            prompt: "y".into(),
            attachments: vec![],
            priority: Priority::Normal,
            enqueue_seq: 1,
            metadata: HashMap::new(),
        };
        assert!(urgent.order_key() > normal.order_key());
    }

    #[test]
    fn same_priority_breaks_on_fifo_sequence() {
        let earlier = QueuedMessage {
            id: "a".into(),
            session_id: "s".into(),
            prompt: "x".into(),
            attachments: vec![],
            priority: Priority::Normal,
            enqueue_seq: 1,
            metadata: HashMap::new(),
        };
        let later = QueuedMessage {
            id: "b".into(),
            session_id: "s".into(),
            prompt: "y".into(),
            attachments: vec![],
            priority: Priority::Normal,
            enqueue_seq: 2,
            metadata: HashMap::new(),
        };
        assert!(earlier.order_key() > later.order_key());
    }
}
