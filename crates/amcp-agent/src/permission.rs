//! Permission engine — async wrapper around `amcp_core::permission`'s pure
//! decision logic, adding the ask-oneshot/delegate/session-mode machinery
//! that a live agent loop needs.
//!
//! The pure glob-matching and layer-merge logic is grounded on the
//! teacher's `operator::policy::Policy` (see `amcp_core::permission` for
//! the detailed grounding note); this module adds what that teacher module
//! never needed because it only ran as a one-shot CLI check: an async
//! `ask` path that suspends the caller on a oneshot channel with a
//! deadline, and delegates to an external command when a rule's decision
//! is `Delegate` (spawned the same way `BashTool` spawns its child
//! process).

use amcp_core::permission::{
    apply_mode, decide_with_delegate, ApprovalAnswer, Decision, LayeredRules, PermissionRule,
    SessionMode,
};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{oneshot, RwLock};

/// How to resolve an `Ask` decision when no interactive client is
/// attached, or when the ask deadline elapses: always deny. A hung
/// permission prompt must never silently become an allow.
const ASK_TIMEOUT_DEFAULT: Duration = Duration::from_secs(120);

/// Callback the gateway registers to surface an `Ask` decision to a human.
/// Takes `(session_id, key)` so the gateway can correlate the
/// `approval_required` event and its eventual
/// `POST /sessions/{id}/approvals/{approval_id}` resolution with the right
/// session.
pub type AskCallback =
    std::sync::Arc<dyn Fn(String, String) -> oneshot::Receiver<ApprovalAnswer> + Send + Sync>;

pub struct PermissionEngine {
    /// Behind a lock because `allow_always` mutates the session layer at
    /// runtime (§4.C: "`allow_always` installs a per-session rule") while
    /// `check` reads it concurrently from every in-flight tool call.
    layers: RwLock<LayeredRules>,
    mode: SessionMode,
    ask_timeout: Duration,
    ask_callback: Option<AskCallback>,
}

#[derive(Debug, PartialEq)]
pub enum ResolvedDecision {
    Allow,
    Deny,
}

impl PermissionEngine {
    pub fn new(layers: LayeredRules, mode: SessionMode) -> Self {
        Self {
            layers: RwLock::new(layers),
            mode,
            ask_timeout: ASK_TIMEOUT_DEFAULT,
            ask_callback: None,
        }
    }

    pub fn with_ask_callback(mut self, callback: AskCallback) -> Self {
        self.ask_callback = Some(callback);
        self
    }

    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    pub fn set_mode(&mut self, mode: SessionMode) {
        self.mode = mode;
    }

    /// Resolve a permission check for `key` (a tool name, or a composite
    /// `"{action}:{path}"` filesystem key) made on behalf of `session_id`.
    /// `Deny` short-circuits without consulting any callback; `Allow`
    /// resolves immediately; `Ask` either delegates to an external command
    /// or suspends on the registered ask callback with a deadline that
    /// resolves to `Deny`.
    pub async fn check(&self, session_id: &str, key: &str) -> ResolvedDecision {
        let (decision, delegate_cmd) = {
            let layers = self.layers.read().await;
            decide_with_delegate(&layers, key)
        };
        let decision = apply_mode(decision, self.mode);

        match decision {
            Decision::Allow => ResolvedDecision::Allow,
            Decision::Deny => ResolvedDecision::Deny,
            Decision::Delegate => {
                let Some(cmd) = delegate_cmd else {
                    return ResolvedDecision::Deny;
                };
                self.run_delegate(&cmd, key).await
            }
            Decision::Ask => self.run_ask(session_id, key).await,
        }
    }

    /// Install a session-scoped "always allow" rule generalized from the
    /// request (§4.C: `allow_always`). Kept as an exact-key match rather
    /// than a broadened glob since the engine only ever sees tool names or
    /// `"{action}:{path}"` composite keys here, not full shell argv.
    pub async fn allow_always(&self, key: &str) {
        self.layers
            .write()
            .await
            .session_always_allow
            .push(PermissionRule::new(key, Decision::Allow));
    }

    async fn run_ask(&self, session_id: &str, key: &str) -> ResolvedDecision {
        let Some(callback) = &self.ask_callback else {
            return ResolvedDecision::Deny;
        };
        let rx = callback(session_id.to_string(), key.to_string());
        match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(Ok(ApprovalAnswer::AllowOnce)) => ResolvedDecision::Allow,
            Ok(Ok(ApprovalAnswer::AllowAlways)) => {
                self.allow_always(key).await;
                ResolvedDecision::Allow
            }
            // Deadline elapsed, channel dropped, or an explicit deny:
            // all three fail closed.
            _ => ResolvedDecision::Deny,
        }
    }

    async fn run_delegate(&self, command: &str, key: &str) -> ResolvedDecision {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("AMCP_PERMISSION_KEY", key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => ResolvedDecision::Allow,
            _ => ResolvedDecision::Deny,
        }
    }
}
