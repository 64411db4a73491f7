//! Context compaction — four strategies for keeping a session's message
//! history under its model's context budget.
//!
//! Grounded on `context.rs`'s `ContextManager` (token estimate constant
//! `CHARS_PER_TOKEN = 4.0`, the `+10`-per-message overhead, and the
//! "remove from the middle until under a target" compaction shape) for the
//! `Truncate`/`SlidingWindow` strategies, generalized into named,
//! independently selectable strategies instead of one hardcoded policy.
//! `Summary` and `Hybrid` have no teacher counterpart — the teacher only
//! ever drops messages — and are grounded on the general LLM-rewrite
//! digest pattern the rest of the corpus uses for long-running agent
//! memory (e.g. `stencila-stencila/rust/agents/src/truncation.rs`'s
//! token-budget-driven truncation of tool output).

use amcp_llm::{ContentBlock, LlmContent, LlmMessage, LlmProvider, LlmRequest};
use regex::Regex;
use std::sync::Arc;

const CHARS_PER_TOKEN: f32 = 4.0;
const MESSAGE_OVERHEAD_TOKENS: usize = 10;
const TOOL_CALL_OVERHEAD_TOKENS: usize = 15;

pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
}

pub fn message_tokens(message: &LlmMessage) -> usize {
    let content_tokens = match &message.content {
        LlmContent::Text(s) => estimate_tokens(s),
        LlmContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => estimate_tokens(text),
                ContentBlock::ToolUse { name, input, .. } => {
                    estimate_tokens(name) + estimate_tokens(&input.to_string()) + TOOL_CALL_OVERHEAD_TOKENS
                }
                ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
            })
            .sum(),
    };
    content_tokens + MESSAGE_OVERHEAD_TOKENS
}

pub fn total_tokens(system_tokens: usize, messages: &[LlmMessage]) -> usize {
    system_tokens + messages.iter().map(message_tokens).sum::<usize>()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionStrategy {
    Summary,
    Truncate,
    SlidingWindow,
    Hybrid,
}

impl CompactionStrategy {
    /// The strategy name as carried in a `context.compacted` event payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Truncate => "truncate",
            Self::SlidingWindow => "sliding_window",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompactionConfig {
    pub strategy: CompactionStrategy,
    pub max_tokens: usize,
    /// Fraction of `max_tokens` that must be in use before compaction
    /// triggers at all (§4.E default 0.7).
    pub threshold_ratio: f32,
    /// Target utilization after compaction (e.g. 0.3 of `max_tokens`).
    pub target_pct: f32,
    /// Number of most-recent exchanges (tool-call/tool-result pairs
    /// included) to always preserve verbatim.
    pub preserve_last: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategy::Hybrid,
            max_tokens: 128_000,
            threshold_ratio: 0.7,
            target_pct: 0.3,
            preserve_last: 6,
        }
    }
}

pub struct Compactor {
    config: CompactionConfig,
    provider: Option<Arc<dyn LlmProvider>>,
}

impl Compactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Whether the current message set is over the configured threshold
    /// and needs compaction (§4.E: `used_tokens > threshold_ratio * W`).
    pub fn needs_compaction(&self, system_tokens: usize, messages: &[LlmMessage]) -> bool {
        let threshold = (self.config.max_tokens as f32 * self.config.threshold_ratio) as usize;
        total_tokens(system_tokens, messages) > threshold
    }

    /// Compact `messages` in place. `system_tokens` is the estimated token
    /// cost of the session's system prompt, held constant across
    /// compaction. `model` selects which model performs an LLM-backed
    /// `Summary` rewrite.
    pub async fn compact(&self, system_tokens: usize, messages: &mut Vec<LlmMessage>, model: &str) {
        if messages.is_empty() {
            return;
        }
        let target = (self.config.max_tokens as f32 * self.config.target_pct) as usize;

        match self.config.strategy {
            CompactionStrategy::Truncate => truncate(messages, system_tokens, target, self.config.preserve_last),
            CompactionStrategy::SlidingWindow => sliding_window(messages, system_tokens, target),
            CompactionStrategy::Summary => {
                if self.try_summarize(messages, model).await.is_err() {
                    hybrid(messages, system_tokens, target, self.config.preserve_last);
                }
            }
            CompactionStrategy::Hybrid => hybrid(messages, system_tokens, target, self.config.preserve_last),
        }
    }

    async fn try_summarize(&self, messages: &mut Vec<LlmMessage>, model: &str) -> Result<(), String> {
        let Some(provider) = &self.provider else {
            return Err("no provider configured for Summary strategy".to_string());
        };
        if messages.len() <= self.config.preserve_last {
            return Ok(());
        }

        let split = messages.len() - self.config.preserve_last;
        let split = find_safe_split(messages, split);
        let (to_summarize, _) = messages.split_at(split);
        if to_summarize.is_empty() {
            return Ok(());
        }

        let transcript = render_transcript(to_summarize);
        let request = LlmRequest {
            model: model.to_string(),
            messages: vec![LlmMessage {
                role: "user".to_string(),
                content: LlmContent::Text(format!(
                    "Summarize the following conversation transcript. Respond with exactly \
                     these four XML tags, each populated with the relevant detail:\n\
                     <current_task>...</current_task>\n\
                     <completed>...</completed>\n\
                     <code_state>...</code_state>\n\
                     <important>...</important>\n\n{transcript}"
                )),
            }],
            max_tokens: Some(1024),
            ..Default::default()
        };

        let summary_text = provider
            .complete(request)
            .await
            .map_err(|e| e.to_string())?;

        if !summary_text.contains("<current_task>") {
            return Err("summary response missing expected tags".to_string());
        }

        let preserved = messages.split_off(split);
        messages.clear();
        messages.push(LlmMessage {
            role: "system".to_string(),
            content: LlmContent::Text(summary_text),
        });
        messages.extend(preserved);
        Ok(())
    }
}

/// Drop messages from the middle, keeping a leading system message (if
/// any) and the last `preserve_last` exchanges verbatim, until under
/// `target` tokens.
fn truncate(messages: &mut Vec<LlmMessage>, system_tokens: usize, target: usize, preserve_last: usize) {
    let has_leading_system = messages.first().map(|m| m.role == "system").unwrap_or(false);
    let head_len = if has_leading_system { 1 } else { 0 };

    while total_tokens(system_tokens, messages) > target {
        let tail_start = find_safe_split(messages, messages.len().saturating_sub(preserve_last));
        if head_len >= tail_start {
            break;
        }
        messages.remove(head_len);
    }
}

/// Drop the oldest messages (respecting tool-call/tool-result pairing)
/// until under `target` tokens.
fn sliding_window(messages: &mut Vec<LlmMessage>, system_tokens: usize, target: usize) {
    while messages.len() > 1 && total_tokens(system_tokens, messages) > target {
        let drop_count = find_pairing_safe_drop_count(messages);
        if drop_count == 0 {
            break;
        }
        messages.drain(0..drop_count);
    }
}

/// Sliding window plus a non-LLM regex digest of what was dropped,
/// inserted as a synthetic system message so the model retains a trace of
/// dropped content without an LLM round-trip. Never itself fails.
fn hybrid(messages: &mut Vec<LlmMessage>, system_tokens: usize, target: usize, preserve_last: usize) {
    let mut dropped_summaries: Vec<String> = Vec::new();
    let keep_tail = preserve_last.max(1);

    while messages.len() > keep_tail && total_tokens(system_tokens, messages) > target {
        let drop_count = find_pairing_safe_drop_count(messages).min(messages.len() - keep_tail);
        if drop_count == 0 {
            break;
        }
        let dropped: Vec<LlmMessage> = messages.drain(0..drop_count).collect();
        dropped_summaries.push(digest(&dropped));
    }

    if !dropped_summaries.is_empty() {
        let digest_text = format!(
            "[context compacted — prior turns summarized]\n{}",
            dropped_summaries.join("\n")
        );
        messages.insert(
            0,
            LlmMessage {
                role: "system".to_string(),
                content: LlmContent::Text(digest_text),
            },
        );
    }
}

/// Find the first index at or after `from` that does not split a
/// tool-call/tool-result pair: i.e. if `messages[from]` is a tool-result
/// continuation of an assistant tool-call at `from - 1`, advance to
/// `from + 1` so the pair stays together on the same side of the split.
fn find_safe_split(messages: &[LlmMessage], from: usize) -> usize {
    let mut idx = from.min(messages.len());
    while idx > 0 && idx < messages.len() && message_is_tool_result(&messages[idx]) {
        idx += 1;
    }
    idx.min(messages.len())
}

/// How many leading messages can be dropped as a unit without breaking a
/// tool-call/tool-result pairing: a leading assistant message containing
/// tool_use blocks must be dropped together with the following user
/// message carrying the matching tool_result blocks.
fn find_pairing_safe_drop_count(messages: &[LlmMessage]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    if message_has_tool_use(&messages[0]) && messages.len() > 1 && message_is_tool_result(&messages[1]) {
        return 2;
    }
    1
}

fn message_has_tool_use(message: &LlmMessage) -> bool {
    matches!(&message.content, LlmContent::Blocks(blocks)
        if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })))
}

fn message_is_tool_result(message: &LlmMessage) -> bool {
    matches!(&message.content, LlmContent::Blocks(blocks)
        if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })))
}

fn render_transcript(messages: &[LlmMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}] {}", m.role, content_to_text(&m.content)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn content_to_text(content: &LlmContent) -> String {
    match content {
        LlmContent::Text(s) => s.clone(),
        LlmContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.clone(),
                ContentBlock::ToolUse { name, input, .. } => format!("<tool_call {name}>{input}</tool_call>"),
                ContentBlock::ToolResult { content, .. } => format!("<tool_result>{content}</tool_result>"),
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Non-LLM digest of a dropped message group: first sentence of any text,
/// plus the names of any tool calls, via a cheap regex rather than a model
/// call. This is what makes `Hybrid` unable to fail the way `Summary` can.
fn digest(dropped: &[LlmMessage]) -> String {
    let sentence_re = Regex::new(r"^[^.!?\n]*[.!?]").unwrap();
    let mut parts = Vec::new();
    for message in dropped {
        match &message.content {
            LlmContent::Text(text) => {
                if let Some(m) = sentence_re.find(text.trim()) {
                    parts.push(format!("{}: {}", message.role, m.as_str()));
                }
            }
            LlmContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if let Some(m) = sentence_re.find(text.trim()) {
                                parts.push(format!("{}: {}", message.role, m.as_str()));
                            }
                        }
                        ContentBlock::ToolUse { name, .. } => parts.push(format!("called tool `{name}`")),
                        ContentBlock::ToolResult { .. } => {}
                    }
                }
            }
        }
    }
    if parts.is_empty() {
        "- (no summarizable content)".to_string()
    } else {
        parts.into_iter().map(|p| format!("- {p}")).collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_msg(role: &str, text: &str) -> LlmMessage {
        LlmMessage {
            role: role.to_string(),
            content: LlmContent::Text(text.to_string()),
        }
    }

    #[test]
    fn estimate_tokens_matches_char_heuristic() {
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(estimate_tokens("hello world"), 3);
    }

    #[tokio::test]
    async fn sliding_window_drops_oldest_first() {
        let mut messages: Vec<LlmMessage> = (0..20)
            .map(|i| text_msg("user", &"x".repeat(400 + i)))
            .collect();
        let compactor = Compactor::new(CompactionConfig {
            strategy: CompactionStrategy::SlidingWindow,
            max_tokens: 2000,
            threshold_ratio: 0.7,
            target_pct: 0.5,
            preserve_last: 2,
        });
        let last_before = messages.last().unwrap().clone();
        compactor.compact(0, &mut messages, "test-model").await;
        assert!(messages.len() < 20);
        assert_eq!(messages.last().unwrap().content, last_before.content);
    }

    #[tokio::test]
    async fn hybrid_never_fails_and_inserts_digest() {
        let mut messages: Vec<LlmMessage> = (0..10)
            .map(|i| text_msg("user", &format!("This is message {i}. It has some content.")))
            .collect();
        let compactor = Compactor::new(CompactionConfig {
            strategy: CompactionStrategy::Hybrid,
            max_tokens: 50,
            threshold_ratio: 0.7,
            target_pct: 0.5,
            preserve_last: 2,
        });
        compactor.compact(0, &mut messages, "test-model").await;
        assert!(messages.first().unwrap().role == "system");
    }

    #[tokio::test]
    async fn summary_without_provider_falls_back_to_hybrid() {
        let mut messages: Vec<LlmMessage> = (0..10)
            .map(|i| text_msg("user", &format!("Message number {i} with some detail.")))
            .collect();
        let compactor = Compactor::new(CompactionConfig {
            strategy: CompactionStrategy::Summary,
            max_tokens: 50,
            threshold_ratio: 0.7,
            target_pct: 0.5,
            preserve_last: 2,
        });
        // No provider configured: must fall back to Hybrid, not panic or no-op.
        compactor.compact(0, &mut messages, "test-model").await;
        assert!(messages.len() < 10);
    }

    #[test]
    fn pairing_safe_drop_keeps_tool_call_and_result_together() {
        let messages = vec![
            LlmMessage {
                role: "assistant".to_string(),
                content: LlmContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "bash".to_string(),
                    input: serde_json::json!({}),
                }]),
            },
            LlmMessage {
                role: "user".to_string(),
                content: LlmContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "t1".to_string(),
                    content: "ok".to_string(),
                    is_error: None,
                }]),
            },
        ];
        assert_eq!(find_pairing_safe_drop_count(&messages), 2);
    }
}
