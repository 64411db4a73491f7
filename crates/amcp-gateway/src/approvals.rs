//! Pending-approval registry (§4.C, §6.1 ADDED) — the bridge between a
//! `PermissionEngine`'s `ask` suspension and the wire endpoint a client
//! resolves it from.
//!
//! The permission engine's `ask_callback` (wired in `server::start_gateway`)
//! registers a oneshot sender here under a freshly minted approval id and
//! emits an `approval_required` event carrying that id; `POST
//! /sessions/{id}/approvals/{approval_id}` looks the sender up, removes it,
//! and resolves the waiting `PermissionEngine::check` call.

use amcp_core::permission::ApprovalAnswer;
use dashmap::DashMap;
use tokio::sync::oneshot;

#[derive(Default)]
pub struct ApprovalRegistry {
    pending: DashMap<String, oneshot::Sender<ApprovalAnswer>>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh approval id and register its resolver, returning the id
    /// to attach to the `approval_required` event payload.
    pub fn register(&self) -> (String, oneshot::Receiver<ApprovalAnswer>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        (id, rx)
    }

    /// Resolve a pending approval. Returns `false` if the id is unknown or
    /// was already resolved (e.g. the ask deadline already elapsed).
    pub fn resolve(&self, approval_id: &str, answer: ApprovalAnswer) -> bool {
        match self.pending.remove(approval_id) {
            Some((_, tx)) => tx.send(answer).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_answer_to_waiter() {
        let registry = ApprovalRegistry::new();
        let (id, rx) = registry.register();
        assert!(registry.resolve(&id, ApprovalAnswer::AllowOnce));
        assert_eq!(rx.await.unwrap(), ApprovalAnswer::AllowOnce);
    }

    #[test]
    fn resolve_unknown_id_returns_false() {
        let registry = ApprovalRegistry::new();
        assert!(!registry.resolve("nonexistent", ApprovalAnswer::Deny));
    }

    #[tokio::test]
    async fn resolve_is_one_shot() {
        let registry = ApprovalRegistry::new();
        let (id, _rx) = registry.register();
        assert!(registry.resolve(&id, ApprovalAnswer::Deny));
        assert!(!registry.resolve(&id, ApprovalAnswer::AllowOnce));
    }
}
