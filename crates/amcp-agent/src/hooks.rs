//! Hook pipeline — runs external processes at lifecycle events, per the
//! JSON-on-stdin / exit-code contract in `amcp_core::hooks`.
//!
//! Grounded on `BashTool::execute_cancellable` (`tokio::process::Command`
//! plus a `tokio::select!` race against a cancellation/timeout future) for
//! the process-spawn-with-timeout shape, generalized from "run one shell
//! command" to "run a handler, capture stdout/stderr/exit code, and
//! classify the result".

use amcp_core::hooks::{
    HookEventKind, HookHandler, HookInput, HookKind, HookOutcome, HookResponse,
};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A registered set of hook handlers, run in registration order per event.
#[derive(Default)]
pub struct HookPipeline {
    handlers: Vec<HookHandler>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: HookHandler) {
        self.handlers.push(handler);
    }

    fn matching(&self, event: HookEventKind, tool_name: Option<&str>) -> impl Iterator<Item = &HookHandler> {
        self.handlers.iter().filter(move |h| {
            if !h.enabled || h.event != event {
                return false;
            }
            if h.name_pattern.is_empty() || h.name_pattern == "*" {
                return true;
            }
            match tool_name {
                Some(name) => amcp_core::glob_match(&h.name_pattern, name),
                None => true,
            }
        })
    }

    /// Run every enabled handler registered for `event` (optionally scoped
    /// by `tool_name`) in order, short-circuiting on the first `Blocked`
    /// outcome. Returns all outcomes seen, in run order.
    pub async fn run(&self, event: HookEventKind, input: &HookInput) -> Vec<HookOutcome> {
        let mut outcomes = Vec::new();
        for handler in self.matching(event, input.tool_name.as_deref()) {
            let outcome = run_handler(handler, input).await;
            let blocked = outcome.is_blocked();
            outcomes.push(outcome);
            if blocked {
                break;
            }
        }
        outcomes
    }
}

async fn run_handler(handler: &HookHandler, input: &HookInput) -> HookOutcome {
    let timeout = Duration::from_secs(handler.timeout_secs.max(1));
    let payload = match serde_json::to_vec(input) {
        Ok(p) => p,
        Err(e) => return HookOutcome::NonBlockingError(format!("failed to serialize hook input: {e}")),
    };

    let run = async {
        let mut command = match handler.kind {
            HookKind::Command | HookKind::Script => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&handler.command);
                cmd
            }
            HookKind::Function => {
                // In-process function hooks are dispatched by name through a
                // registry the caller owns; the pipeline only knows how to
                // run external processes, so treat an unresolved function
                // reference as a no-op rather than failing the turn.
                return Ok(HookOutcome::NoChange);
            }
        };

        command
            .env("AMCP_PROJECT_DIR", &input.cwd)
            .env("AMCP_SESSION_ID", &input.session_id)
            .env("AMCP_HOOK_EVENT", &input.hook_event_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(tool_name) = &input.tool_name {
            command.env("AMCP_TOOL_NAME", tool_name);
        }

        let mut child = command.spawn().map_err(|e| e.to_string())?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload).await;
        }
        let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
        Ok::<_, String>(classify(output.status.code(), &output.stdout, &output.stderr))
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => HookOutcome::NonBlockingError(e),
        // Elapsed timeout degrades to open: the hook is treated as if it
        // never ran rather than blocking the turn indefinitely.
        Err(_) => HookOutcome::NonBlockingError(format!(
            "hook '{}' timed out after {}s",
            handler.name, handler.timeout_secs
        )),
    }
}

fn classify(exit_code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> HookOutcome {
    match exit_code {
        Some(0) => {
            let text = String::from_utf8_lossy(stdout);
            if text.trim().is_empty() {
                HookOutcome::NoChange
            } else {
                match serde_json::from_str::<HookResponse>(text.trim()) {
                    Ok(response) => HookOutcome::Modified(response),
                    Err(e) => HookOutcome::NonBlockingError(format!("hook produced invalid JSON: {e}")),
                }
            }
        }
        Some(2) => HookOutcome::Blocked(String::from_utf8_lossy(stderr).trim().to_string()),
        Some(code) => HookOutcome::NonBlockingError(format!("hook exited with status {code}")),
        None => HookOutcome::NonBlockingError("hook terminated by signal".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_core::hooks::HookEventKind as Kind;

    fn input() -> HookInput {
        HookInput {
            session_id: "s1".into(),
            hook_event_name: "PreToolUse".into(),
            cwd: "/tmp".into(),
            tool_name: Some("bash".into()),
            tool_input: None,
            tool_response: None,
            prompt: None,
        }
    }

    #[tokio::test]
    async fn exit_zero_empty_stdout_is_no_change() {
        let mut pipeline = HookPipeline::new();
        pipeline.register(HookHandler {
            name: "noop".into(),
            event: Kind::PreToolUse,
            name_pattern: "*".into(),
            kind: HookKind::Command,
            command: "true".into(),
            timeout_secs: 5,
            enabled: true,
        });
        let outcomes = pipeline.run(Kind::PreToolUse, &input()).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], HookOutcome::NoChange));
    }

    #[tokio::test]
    async fn exit_two_blocks_and_short_circuits() {
        let mut pipeline = HookPipeline::new();
        pipeline.register(HookHandler {
            name: "blocker".into(),
            event: Kind::PreToolUse,
            name_pattern: "*".into(),
            kind: HookKind::Command,
            command: "echo 'nope' 1>&2; exit 2".into(),
            timeout_secs: 5,
            enabled: true,
        });
        pipeline.register(HookHandler {
            name: "never-runs".into(),
            event: Kind::PreToolUse,
            name_pattern: "*".into(),
            kind: HookKind::Command,
            command: "true".into(),
            timeout_secs: 5,
            enabled: true,
        });
        let outcomes = pipeline.run(Kind::PreToolUse, &input()).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], HookOutcome::Blocked(ref reason) if reason == "nope"));
    }

    #[tokio::test]
    async fn exit_zero_with_json_is_modified() {
        let mut pipeline = HookPipeline::new();
        pipeline.register(HookHandler {
            name: "modifier".into(),
            event: Kind::PreToolUse,
            name_pattern: "*".into(),
            kind: HookKind::Command,
            command: r#"echo '{"continue": true, "feedback": "ok"}'"#.into(),
            timeout_secs: 5,
            enabled: true,
        });
        let outcomes = pipeline.run(Kind::PreToolUse, &input()).await;
        match &outcomes[0] {
            HookOutcome::Modified(response) => assert_eq!(response.feedback.as_deref(), Some("ok")),
            other => panic!("expected Modified, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn name_pattern_filters_by_tool() {
        let mut pipeline = HookPipeline::new();
        pipeline.register(HookHandler {
            name: "bash-only".into(),
            event: Kind::PreToolUse,
            name_pattern: "bash".into(),
            kind: HookKind::Command,
            command: "exit 2".into(),
            timeout_secs: 5,
            enabled: true,
        });
        let mut other = input();
        other.tool_name = Some("read_file".into());
        let outcomes = pipeline.run(Kind::PreToolUse, &other).await;
        assert!(outcomes.is_empty());
    }
}
