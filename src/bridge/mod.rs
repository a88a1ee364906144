//! WebSocket bridge: `/ws/terminal` for interactive clients and `/ws/monitor`
//! for observers, plus `/health`.

pub mod auth;
pub mod error;
mod monitor;
pub mod protocol;
mod terminal;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Request, State,
    },
    routing::get,
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::context::ContextService;
use crate::monitor::MonitorAggregator;
use crate::session::SessionManager;
use crate::shutdown::ShutdownCoordinator;

/// Per-connection behavior knobs shared by every handler.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Capacity of each client's subscriber queue.
    pub queue_capacity: usize,
    /// Terminate a terminal client's sessions when it disconnects.
    pub terminate_on_disconnect: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: crate::broker::DEFAULT_QUEUE_CAPACITY,
            terminate_on_disconnect: true,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub context: ContextService,
    pub monitor: MonitorAggregator,
    pub shutdown: ShutdownCoordinator,
    pub settings: Arc<BridgeSettings>,
}

impl AppState {
    pub fn new(
        sessions: SessionManager,
        monitor: MonitorAggregator,
        shutdown: ShutdownCoordinator,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            context: ContextService::new(sessions.clone()),
            sessions,
            monitor,
            shutdown,
            settings: Arc::new(settings),
        }
    }
}

/// Authentication and origin settings for the router.
pub struct RouterConfig {
    pub token: Option<String>,
    pub bind: SocketAddr,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            token: None,
            bind: SocketAddr::from(([127, 0, 0, 1], 7681)),
        }
    }
}

pub(crate) type WsSink = SplitSink<WebSocket, Message>;

pub(crate) async fn send_json<T: Serialize>(
    ws_tx: &mut WsSink,
    value: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}

pub(crate) async fn close_frame(ws_tx: &mut WsSink) {
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: "server shutting down".into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.sessions.len(),
    })
}

/// Like tower-http's default span, but the query token never reaches logs.
fn request_span(req: &Request) -> tracing::Span {
    tracing::debug_span!(
        "request",
        method = %req.method(),
        uri = %auth::redacted_uri(req.uri()),
        version = ?req.version(),
    )
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let protected = Router::new()
        .route("/ws/terminal", get(terminal::ws_terminal))
        .route("/ws/monitor", get(monitor::ws_monitor))
        .with_state(state.clone());

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => {
            // Without a token, a browser page on another origin must not be
            // able to open a socket to a loopback bridge.
            let port = config.bind.port();
            let allowed_origins = vec![
                format!("http://127.0.0.1:{port}"),
                format!("http://localhost:{port}"),
                format!("http://[::1]:{port}"),
            ];
            protected.layer(axum::middleware::from_fn(move |req, next| {
                let origins = allowed_origins.clone();
                auth::check_ws_origin(origins, req, next)
            }))
        }
    };

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::pattern::PatternEngine;
    use crate::session::SessionLimits;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 16);
        let sessions = SessionManager::new(
            broker,
            Arc::new(PatternEngine::new(Vec::new())),
            SessionLimits::default(),
        );
        AppState::new(
            sessions,
            monitor,
            ShutdownCoordinator::new(),
            BridgeSettings::default(),
        )
    }

    #[tokio::test]
    async fn health_is_open_even_with_a_token() {
        let config = RouterConfig {
            token: Some("secret".into()),
            ..Default::default()
        };
        let app = router(test_state(), config);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sessions"], 0);
    }

    #[tokio::test]
    async fn sockets_require_the_token() {
        let config = RouterConfig {
            token: Some("secret".into()),
            ..Default::default()
        };
        let app = router(test_state(), config);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws/monitor")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn request_logs_do_not_carry_the_token() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let config = RouterConfig {
            token: Some("s3cret".into()),
            ..Default::default()
        };
        let app = router(test_state(), config);
        app.oneshot(
            Request::builder()
                .uri("/ws/monitor?since=1&token=s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("/ws/monitor?since=1&token=[redacted]"), "{logs}");
        assert!(!logs.contains("s3cret"), "{logs}");
    }

    #[tokio::test]
    async fn foreign_origin_is_rejected_without_a_token() {
        let app = router(test_state(), RouterConfig::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws/terminal")
                    .header("upgrade", "websocket")
                    .header("origin", "http://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
