//! Event types shared by the session manager, the output multiplexer and
//! every consumer downstream of it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pattern::{ActionSuggestion, PatternEvent};

/// Opaque identity of a managed session.
///
/// Backed by a random v4 UUID, so an ID is never handed out twice for the
/// lifetime of the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The child process exited on its own.
    ProcessExit,
    /// A client asked for the session to be terminated.
    Terminated,
    /// The host is shutting down.
    Shutdown,
}

/// What a published event carries.
#[derive(Debug, Clone)]
pub enum Payload {
    Started { command: String, pid: Option<u32> },
    Output(Bytes),
    Input(Bytes),
    Pattern(PatternEvent),
    Suggestion(ActionSuggestion),
    Ended {
        reason: EndReason,
        exit_code: Option<u32>,
    },
}

impl Payload {
    /// Short name used in logs and on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Started { .. } => "session_started",
            Payload::Output(_) => "output",
            Payload::Input(_) => "input",
            Payload::Pattern(_) => "pattern_detected",
            Payload::Suggestion(_) => "suggested_action",
            Payload::Ended { .. } => "session_ended",
        }
    }

    /// True for the final event of a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Payload::Ended { .. })
    }
}

/// A sequenced event as it leaves the multiplexer.
///
/// `seq` is assigned at publish time from a single global counter, so
/// consumers that see every session (the monitor aggregator) observe a
/// strictly increasing sequence.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub seq: u64,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

/// Records retained by the monitor aggregator are the multiplexer's events
/// verbatim.
pub type HistoryEntry = StreamEvent;
