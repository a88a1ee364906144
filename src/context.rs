use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::SessionId;
use crate::pattern::PatternEvent;
use crate::session::{SessionError, SessionManager};

/// Point-in-time view of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub session_id: SessionId,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub recent_output: String,
    /// Oldest first.
    pub last_patterns: Vec<PatternEvent>,
    pub recent_inputs: Vec<String>,
    pub live: LiveState,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveState {
    pub alive: bool,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
    pub bytes_out: u64,
    pub idle_ms: u64,
    pub activity_generation: u64,
}

/// Answers context requests against the session table.
#[derive(Clone)]
pub struct ContextService {
    sessions: SessionManager,
}

impl ContextService {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    /// Snapshot a session's buffered output, recent detections and live
    /// state. Absent and ended sessions are both `UnknownSession`.
    pub fn request_context(&self, id: SessionId) -> Result<ContextSnapshot, SessionError> {
        self.sessions
            .get(id)
            .and_then(|session| session.snapshot())
            .ok_or(SessionError::UnknownSession(id))
    }
}
