//! Permission engine — pure decision logic over layered glob rules.
//!
//! Grounded on the teacher's `operator::policy` module (`Policy`/`PolicyTier`/
//! `Decision`/`glob_match`/`check_tier`), which implements a very similar
//! shape: deny/ask/allow tiers matched by permissive glob. Two things differ
//! on purpose, both required: rules here are merged into ONE ordered list
//! across five layers and the LAST matching rule wins (the teacher's
//! `check_tier` instead checks deny-list-then-ask-list-then-allow-list, which
//! is first-match-within-tier, not true last-match-wins); and `glob_match`
//! here is the teacher's non-permissive variant (`*` does not cross `/`,
//! `**` does) since path-shaped patterns need that distinction for tool
//! argument matching.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Ask,
    Deny,
    /// Forward the ask to an external delegate command instead of the
    /// interactive client (§3 PermissionRule.decision).
    Delegate,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Ask => write!(f, "ask"),
            Self::Deny => write!(f, "deny"),
            Self::Delegate => write!(f, "delegate"),
        }
    }
}

/// A client's answer to an `approval_required` event (§4.C): the three
/// choices `POST /sessions/{id}/approvals/{approval_id}` accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAnswer {
    AllowOnce,
    /// Installs a per-session "always allow" rule generalized from the
    /// request before resolving this one call as allowed.
    AllowAlways,
    Deny,
}

/// One rule: a glob `pattern` matched against a `tool_name` (or a
/// `tool_name:argument` composite key for filesystem/bash-shaped tools,
/// mirroring the teacher's `check_filesystem`'s `"{action}:{path}"` key),
/// a `decision`, and an optional delegate command when `decision` is
/// `Delegate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub decision: Decision,
    #[serde(default)]
    pub delegate_command: Option<String>,
}

impl PermissionRule {
    pub fn new(pattern: impl Into<String>, decision: Decision) -> Self {
        Self {
            pattern: pattern.into(),
            decision,
            delegate_command: None,
        }
    }
}

/// The five merge layers, concatenated fresh on every `decide()` call in
/// this fixed precedence order (later layers override earlier ones within
/// the last-match-wins pass). The session layer is rebuilt per call rather
/// than pre-merged because "always allow" entries mutate at runtime.
#[derive(Clone, Debug, Default)]
pub struct LayeredRules {
    pub process_defaults: Vec<PermissionRule>,
    pub user_config: Vec<PermissionRule>,
    pub project_config: Vec<PermissionRule>,
    pub agent_spec: Vec<PermissionRule>,
    pub session_always_allow: Vec<PermissionRule>,
}

impl LayeredRules {
    /// Concatenate all five layers in precedence order (lowest to
    /// highest priority). The caller passes the *current* session rules
    /// each time since they can change between calls.
    pub fn concat(&self) -> Vec<&PermissionRule> {
        self.process_defaults
            .iter()
            .chain(self.user_config.iter())
            .chain(self.project_config.iter())
            .chain(self.agent_spec.iter())
            .chain(self.session_always_allow.iter())
            .collect()
    }
}

/// Session-wide override of individual rule decisions, applied as a pure
/// post-hoc transform on the merged base decision (§4.C.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Normal,
    /// Downgrade `Ask` to `Allow`; `Deny` is untouched.
    Yolo,
    /// Upgrade `Allow` to `Ask`; `Deny` is untouched.
    Strict,
}

/// Evaluate all rules in `layers` against `key` and return the decision of
/// the LAST matching rule in the concatenated sequence, or `Decision::Ask`
/// if nothing matches (fail toward a human, never toward silent allow).
pub fn decide(layers: &LayeredRules, key: &str) -> Decision {
    let mut result = Decision::Ask;
    for rule in layers.concat() {
        if glob_match(&rule.pattern, key) {
            result = rule.decision;
        }
    }
    result
}

/// Same as `decide`, but also returns the delegate command when the
/// winning rule is `Decision::Delegate`.
pub fn decide_with_delegate(layers: &LayeredRules, key: &str) -> (Decision, Option<String>) {
    let mut result = Decision::Ask;
    let mut delegate = None;
    for rule in layers.concat() {
        if glob_match(&rule.pattern, key) {
            result = rule.decision;
            delegate = rule.delegate_command.clone();
        }
    }
    (result, delegate)
}

/// Apply the session's mode as a final transform on a merged decision.
/// `Deny` is never overridden by mode; every other decision (`Allow`,
/// `Ask`, `Delegate`) collapses to `Allow` under `Yolo` or `Ask` under
/// `Strict` (§4.C: "any base decision other than deny becomes allow/ask").
pub fn apply_mode(decision: Decision, mode: SessionMode) -> Decision {
    match (decision, mode) {
        (Decision::Deny, _) => Decision::Deny,
        (_, SessionMode::Yolo) => Decision::Allow,
        (_, SessionMode::Strict) => Decision::Ask,
        (other, SessionMode::Normal) => other,
    }
}

/// Glob match where `**` matches any run of characters (including `/`)
/// and a single `*` does not cross a `/` boundary; `?` matches one
/// non-`/` character. Mirrors the teacher's non-permissive `glob_match`.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let regex_str = compile_glob(pattern);
    Regex::new(&regex_str)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn compile_glob(pattern: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    out.push_str(".*");
                    i += 2;
                } else {
                    out.push_str("[^/]*");
                    i += 1;
                }
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            _ if "\\.+()|[]{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out.push('$');
    out
}

/// Build the composite `"{action}:{path}"` key used for filesystem checks,
/// matching the teacher's `check_filesystem` convention.
pub fn filesystem_key(action: &str, path: &str) -> String {
    format!("{}:{}", action, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(pairs: &[(&str, Decision)]) -> LayeredRules {
        let mut layers = LayeredRules::default();
        layers.process_defaults = pairs
            .iter()
            .map(|(p, d)| PermissionRule::new(*p, *d))
            .collect();
        layers
    }

    #[test]
    fn last_matching_rule_wins_within_one_layer() {
        let layers = rules(&[("bash", Decision::Allow), ("bash", Decision::Deny)]);
        assert_eq!(decide(&layers, "bash"), Decision::Deny);
    }

    #[test]
    fn higher_layer_overrides_lower_layer() {
        let mut layers = LayeredRules::default();
        layers.process_defaults = vec![PermissionRule::new("bash", Decision::Deny)];
        layers.session_always_allow = vec![PermissionRule::new("bash", Decision::Allow)];
        assert_eq!(decide(&layers, "bash"), Decision::Allow);
    }

    #[test]
    fn no_match_defaults_to_ask() {
        let layers = LayeredRules::default();
        assert_eq!(decide(&layers, "anything"), Decision::Ask);
    }

    #[test]
    fn double_star_crosses_slash_single_star_does_not() {
        assert!(glob_match("read:/workspace/**", "read:/workspace/a/b/c.rs"));
        assert!(glob_match("read:/workspace/*", "read:/workspace/a"));
        assert!(!glob_match("read:/workspace/*", "read:/workspace/a/b"));
    }

    #[test]
    fn yolo_downgrades_ask_to_allow_but_not_deny() {
        assert_eq!(apply_mode(Decision::Ask, SessionMode::Yolo), Decision::Allow);
        assert_eq!(apply_mode(Decision::Deny, SessionMode::Yolo), Decision::Deny);
    }

    #[test]
    fn strict_upgrades_allow_to_ask_but_not_deny() {
        assert_eq!(apply_mode(Decision::Allow, SessionMode::Strict), Decision::Ask);
        assert_eq!(apply_mode(Decision::Deny, SessionMode::Strict), Decision::Deny);
    }

    #[test]
    fn delegate_collapses_like_any_other_non_deny_decision() {
        assert_eq!(apply_mode(Decision::Delegate, SessionMode::Yolo), Decision::Allow);
        assert_eq!(apply_mode(Decision::Delegate, SessionMode::Strict), Decision::Ask);
        assert_eq!(apply_mode(Decision::Delegate, SessionMode::Normal), Decision::Delegate);
    }

    #[test]
    fn filesystem_key_matches_teacher_convention() {
        assert_eq!(filesystem_key("read", "/etc/shadow"), "read:/etc/shadow");
    }
}
