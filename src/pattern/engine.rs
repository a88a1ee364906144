use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::ansi::EscapeStripper;
use super::events::{suggest, ActionSuggestion, PatternEvent};
use super::rule::{PatternRule, RuleSpec};
use super::PatternError;
use crate::event::SessionId;

/// Longest excerpt carried in a pattern event, in bytes.
const MAX_EXCERPT: usize = 200;

/// A pattern event together with the suggestion its rule derives from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub event: PatternEvent,
    pub suggestion: Option<ActionSuggestion>,
}

/// Streaming matcher over a fixed rule set.
///
/// The engine itself is immutable and shared by every session; all
/// per-session progress lives in a [`MatcherState`] owned by the caller.
#[derive(Debug, Clone)]
pub struct PatternEngine {
    rules: Vec<PatternRule>,
    window: usize,
    recent_limit: usize,
}

/// Per-session matcher progress.
#[derive(Debug, Clone)]
pub struct MatcherState {
    /// Trailing bytes of an unfinished UTF-8 sequence.
    pending: Vec<u8>,
    stripper: EscapeStripper,
    /// Last `window` bytes of stripped text, kept so matches can straddle
    /// chunk boundaries.
    tail: String,
    /// Per rule, offset into `tail` up to which matches were already reported.
    reported_until: Vec<usize>,
    /// Per rule, start of a match that reached the end of the text and may
    /// still grow. Reported once more output ends it, or on [`PatternEngine::flush`].
    deferred: Vec<Option<usize>>,
    recent: VecDeque<PatternEvent>,
    recent_limit: usize,
}

impl MatcherState {
    /// Most recent detections, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &PatternEvent> {
        self.recent.iter()
    }

    /// Current trailing-context window.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);
        let complete = complete_utf8_prefix(&bytes);
        self.pending = bytes[complete..].to_vec();
        let text = String::from_utf8_lossy(&bytes[..complete]);
        self.stripper.strip(&text)
    }

    fn remember(&mut self, event: PatternEvent) {
        if self.recent_limit == 0 {
            return;
        }
        if self.recent.len() == self.recent_limit {
            self.recent.pop_front();
        }
        self.recent.push_back(event);
    }
}

impl PatternEngine {
    pub const DEFAULT_WINDOW: usize = 512;
    pub const DEFAULT_RECENT_LIMIT: usize = 32;

    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self {
            rules,
            window: Self::DEFAULT_WINDOW,
            recent_limit: Self::DEFAULT_RECENT_LIMIT,
        }
    }

    /// Compile a rule set, rejecting duplicate names.
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self, PatternError> {
        let mut rules: Vec<PatternRule> = Vec::with_capacity(specs.len());
        for spec in specs {
            if rules.iter().any(|r| r.name() == spec.name) {
                return Err(PatternError::DuplicateName(spec.name.clone()));
            }
            rules.push(PatternRule::compile(spec)?);
        }
        Ok(Self::new(rules))
    }

    /// Size of the trailing-context window in bytes.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// How many detections each session remembers for context queries.
    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&PatternRule> {
        self.rules.iter().find(|r| r.name() == name)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn new_state(&self) -> MatcherState {
        MatcherState {
            pending: Vec::new(),
            stripper: EscapeStripper::new(),
            tail: String::new(),
            reported_until: vec![0; self.rules.len()],
            deferred: vec![None; self.rules.len()],
            recent: VecDeque::with_capacity(self.recent_limit.min(64)),
            recent_limit: self.recent_limit,
        }
    }

    /// Feed one output chunk and return the detections it completes, in the
    /// order they appear in the text.
    pub fn feed(
        &self,
        state: &mut MatcherState,
        session_id: SessionId,
        chunk: &[u8],
    ) -> Vec<Detection> {
        let text = state.decode(chunk);
        if text.is_empty() {
            return Vec::new();
        }

        let boundary = state.tail.len();
        let mut combined = std::mem::take(&mut state.tail);
        combined.push_str(&text);

        let timestamp = Utc::now();
        let mut found: Vec<(usize, Detection)> = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            let deferred = state.deferred[idx].take();
            for m in rule.matcher().find_iter(&combined) {
                // Overlaps a match we already reported (it grew into this chunk).
                if m.start() < state.reported_until[idx] || m.as_str().is_empty() {
                    continue;
                }
                // Entirely inside text we already scanned, unless it was held back.
                if m.end() <= boundary && deferred.map_or(true, |start| m.start() < start) {
                    continue;
                }
                // Touches the end of the output so far: more text may extend it.
                if m.end() == combined.len() && !rule.anchored_at_end() {
                    state.deferred[idx] = Some(m.start());
                    continue;
                }
                state.reported_until[idx] = m.end();
                found.push((m.start(), self.detect(rule, session_id, m.as_str(), timestamp)));
            }
        }

        let keep_from = ceil_char_boundary(&combined, combined.len().saturating_sub(self.window));
        state.tail = combined.split_off(keep_from);
        for reported in state.reported_until.iter_mut() {
            *reported = reported.saturating_sub(keep_from);
        }
        for start in state.deferred.iter_mut().flatten() {
            *start = start.saturating_sub(keep_from);
        }

        Self::settle(state, found)
    }

    /// Report the matches still held back at the end of the output. Called
    /// once a session's output is complete; nothing more will extend them.
    pub fn flush(&self, state: &mut MatcherState, session_id: SessionId) -> Vec<Detection> {
        let timestamp = Utc::now();
        let mut found: Vec<(usize, Detection)> = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            let Some(from) = state.deferred[idx].take() else {
                continue;
            };
            let from = from.max(state.reported_until[idx]);
            let held = rule
                .matcher()
                .find_iter(&state.tail)
                .find(|m| m.start() >= from && !m.as_str().is_empty());
            if let Some(m) = held {
                state.reported_until[idx] = m.end();
                found.push((m.start(), self.detect(rule, session_id, m.as_str(), timestamp)));
            }
        }
        Self::settle(state, found)
    }

    fn detect(
        &self,
        rule: &PatternRule,
        session_id: SessionId,
        matched: &str,
        timestamp: DateTime<Utc>,
    ) -> Detection {
        let event = PatternEvent {
            session_id,
            rule: rule.name().to_string(),
            severity: rule.severity(),
            excerpt: excerpt(matched),
            timestamp,
        };
        let suggestion = suggest(&event, rule);
        Detection { event, suggestion }
    }

    /// Order detections as they appear in the text and remember them.
    fn settle(state: &mut MatcherState, mut found: Vec<(usize, Detection)>) -> Vec<Detection> {
        found.sort_by_key(|(start, _)| *start);
        found
            .into_iter()
            .map(|(_, detection)| {
                state.remember(detection.event.clone());
                detection
            })
            .collect()
    }
}

fn excerpt(matched: &str) -> String {
    let trimmed = matched.trim();
    if trimmed.len() <= MAX_EXCERPT {
        return trimmed.to_string();
    }
    let end = floor_char_boundary(trimmed, MAX_EXCERPT);
    trimmed[..end].to_string()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Length of the prefix of `bytes` that does not end in a cut-off UTF-8
/// sequence.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}
