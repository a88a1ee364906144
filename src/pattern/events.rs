use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rule::{PatternRule, Severity};
use crate::event::SessionId;

/// One rule match in one session's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEvent {
    pub session_id: SessionId,
    pub rule: String,
    pub severity: Severity,
    /// The matched text, truncated to a bounded length.
    pub excerpt: String,
    pub timestamp: DateTime<Utc>,
}

/// A follow-up a client may offer the user in response to a pattern event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSuggestion {
    pub session_id: SessionId,
    pub rule: String,
    pub action: String,
    pub label: String,
    pub excerpt: String,
    pub timestamp: DateTime<Utc>,
}

/// Derive the suggestion for `event` from the rule that produced it.
///
/// Returns `None` when the rule carries no action template or when `event`
/// was not produced by `rule`.
pub fn suggest(event: &PatternEvent, rule: &PatternRule) -> Option<ActionSuggestion> {
    if event.rule != rule.name() {
        return None;
    }
    let template = rule.action()?;
    Some(ActionSuggestion {
        session_id: event.session_id,
        rule: event.rule.clone(),
        action: template.action.clone(),
        label: template.render(event),
        excerpt: event.excerpt.clone(),
        timestamp: event.timestamp,
    })
}
