use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EndReason, Payload, SessionId, StreamEvent};
use crate::pattern::{ActionSuggestion, PatternEvent};

use super::error::BridgeError;

/// Everything a terminal client may call.
pub const TERMINAL_METHODS: &[&str] = &[
    "start_session",
    "send_input",
    "request_context",
    "resize_session",
    "close_session",
    "attach_session",
];

/// Everything a monitor client may call.
pub const MONITOR_METHODS: &[&str] = &["request_history"];

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Incoming request.
#[derive(Debug, Deserialize)]
pub struct WsRequest {
    /// Optional request id, echoed back in the response.
    pub id: Option<serde_json::Value>,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl WsRequest {
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, BridgeError> {
        let params = self
            .params
            .clone()
            .unwrap_or(serde_json::Value::Object(Default::default()));
        serde_json::from_value(params)
            .map_err(|e| BridgeError::InvalidRequest(format!("invalid params: {e}")))
    }
}

/// Outgoing response.
#[derive(Debug, Serialize)]
pub struct WsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl WsResponse {
    pub fn success(id: Option<serde_json::Value>, method: &str, result: serde_json::Value) -> Self {
        Self {
            id,
            method: Some(method.to_owned()),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, method: &str, err: &BridgeError) -> Self {
        Self {
            id,
            method: Some(method.to_owned()),
            result: None,
            error: Some(WsError::from(err)),
        }
    }

    /// A failure with no request to tie it to (unparseable frame).
    pub fn protocol_error(err: &BridgeError) -> Self {
        Self {
            id: None,
            method: None,
            result: None,
            error: Some(WsError::from(err)),
        }
    }

    pub fn from_result(
        req: &WsRequest,
        result: Result<serde_json::Value, BridgeError>,
    ) -> Self {
        match result {
            Ok(value) => Self::success(req.id.clone(), &req.method, value),
            Err(e) => Self::error(req.id.clone(), &req.method, &e),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WsError {
    pub code: String,
    pub message: String,
}

impl From<&BridgeError> for WsError {
    fn from(e: &BridgeError) -> Self {
        Self {
            code: e.code().to_owned(),
            message: e.message(),
        }
    }
}

/// First message on every connection.
#[derive(Debug, Serialize)]
pub struct Hello {
    pub event: &'static str,
    pub role: &'static str,
    pub methods: &'static [&'static str],
}

impl Hello {
    pub fn terminal() -> Self {
        Self {
            event: "hello",
            role: "terminal",
            methods: TERMINAL_METHODS,
        }
    }

    pub fn monitor() -> Self {
        Self {
            event: "hello",
            role: "monitor",
            methods: MONITOR_METHODS,
        }
    }
}

// ---------------------------------------------------------------------------
// Method params
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct SendInputParams {
    pub session_id: SessionId,
    pub data: String,
    #[serde(default)]
    pub encoding: Encoding,
}

#[derive(Debug, Deserialize)]
pub struct ResizeParams {
    pub session_id: SessionId,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub since: Option<u64>,
}

/// How raw bytes are carried in a JSON string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

impl Encoding {
    pub fn decode(self, data: &str) -> Result<Bytes, BridgeError> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(data.as_bytes())),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map(Bytes::from)
                .map_err(|e| BridgeError::InvalidRequest(format!("invalid base64: {e}"))),
        }
    }
}

/// Bytes on the wire: plain text when they are valid UTF-8, base64 otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireData {
    pub data: String,
    pub encoding: Encoding,
}

impl WireData {
    pub fn encode(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self {
                data: text.to_owned(),
                encoding: Encoding::Utf8,
            },
            Err(_) => Self {
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
                encoding: Encoding::Base64,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A multiplexer event as clients see it. Terminal clients receive it as is;
/// monitor clients receive it wrapped in `aggregated_data` and as history
/// entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub seq: u64,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: WireBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WireBody {
    SessionStarted {
        command: String,
        pid: Option<u32>,
    },
    Output(WireData),
    Input(WireData),
    PatternDetected {
        pattern: PatternEvent,
    },
    SuggestedAction {
        suggestion: ActionSuggestion,
    },
    SessionEnded {
        reason: EndReason,
        exit_code: Option<u32>,
    },
}

impl From<&StreamEvent> for WireEvent {
    fn from(event: &StreamEvent) -> Self {
        let body = match &event.payload {
            Payload::Started { command, pid } => WireBody::SessionStarted {
                command: command.clone(),
                pid: *pid,
            },
            Payload::Output(data) => WireBody::Output(WireData::encode(data)),
            Payload::Input(data) => WireBody::Input(WireData::encode(data)),
            Payload::Pattern(p) => WireBody::PatternDetected { pattern: p.clone() },
            Payload::Suggestion(s) => WireBody::SuggestedAction {
                suggestion: s.clone(),
            },
            Payload::Ended { reason, exit_code } => WireBody::SessionEnded {
                reason: *reason,
                exit_code: *exit_code,
            },
        };
        Self {
            seq: event.seq,
            session_id: event.session_id,
            timestamp: event.timestamp,
            body,
        }
    }
}

/// Live monitor push.
#[derive(Debug, Serialize)]
pub struct AggregatedData {
    pub event: &'static str,
    pub entry: WireEvent,
}

impl AggregatedData {
    pub fn new(entry: &StreamEvent) -> Self {
        Self {
            event: "aggregated_data",
            entry: entry.into(),
        }
    }
}

/// A subscription was dropped before its stream ended normally.
#[derive(Debug, Serialize)]
pub struct SubscriptionLost {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub reason: &'static str,
}

impl SubscriptionLost {
    pub fn new(session_id: Option<SessionId>) -> Self {
        Self {
            event: "subscription_lost",
            session_id,
            reason: "delivery_fault",
        }
    }
}
