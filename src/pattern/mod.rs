//! Streaming pattern detection over session output.
//!
//! Rules are compiled once into a [`PatternEngine`]; each session carries its
//! own [`MatcherState`] so matches that straddle chunk boundaries are still
//! found while memory stays bounded by the trailing-context window.

pub mod ansi;
pub mod engine;
pub mod events;
pub mod rule;

use thiserror::Error;

pub use engine::{Detection, MatcherState, PatternEngine};
pub use events::{suggest, ActionSuggestion, PatternEvent};
pub use rule::{builtin_rules, ActionTemplate, PatternRule, RuleSpec, Severity};

#[derive(Error, Debug)]
pub enum PatternError {
    #[error("invalid regex for rule {rule}: {source}")]
    InvalidRegex {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("pattern rule name must not be empty")]
    EmptyName,

    #[error("duplicate pattern rule name: {0}")]
    DuplicateName(String),
}
