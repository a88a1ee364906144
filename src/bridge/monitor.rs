//! `/ws/monitor`: live `aggregated_data` pushes plus history replay.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::StreamExt;
use serde_json::json;

use super::error::BridgeError;
use super::protocol::{
    AggregatedData, Hello, HistoryParams, SubscriptionLost, WireEvent, WsRequest, WsResponse,
};
use super::{close_frame, send_json, AppState};

pub(super) async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_monitor(socket, state))
}

async fn handle_monitor(socket: WebSocket, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe before greeting, so a client that asks for history right
    // after the hello can stitch the two together by sequence number.
    let (subscription, mut live_rx) = state.monitor.subscribe_live(state.settings.queue_capacity);

    if send_json(&mut ws_tx, &Hello::monitor()).await.is_ok() {
        tracing::debug!("monitor client connected");
        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let response = dispatch(&state, &text).await;
                            if send_json(&mut ws_tx, &response).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(_)) => break,
                    }
                }

                entry = live_rx.recv() => {
                    match entry {
                        Some(entry) => {
                            if send_json(&mut ws_tx, &AggregatedData::new(&entry)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Dropped for falling behind. Tell the client and
                            // close; it resyncs from history on reconnect.
                            tracing::warn!("monitor client lost its live subscription");
                            let _ = send_json(&mut ws_tx, &SubscriptionLost::new(None)).await;
                            close_frame(&mut ws_tx).await;
                            break;
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("monitor client closing for shutdown");
                        close_frame(&mut ws_tx).await;
                        break;
                    }
                }
            }
        }
    }

    state.monitor.unsubscribe_live(&subscription);
    tracing::debug!("monitor client disconnected");
}

async fn dispatch(state: &AppState, text: &str) -> WsResponse {
    let req: WsRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            return WsResponse::protocol_error(&BridgeError::InvalidRequest(format!(
                "invalid JSON request: {e}"
            )))
        }
    };
    let result = match req.method.as_str() {
        "request_history" => request_history(state, &req).await,
        other => Err(BridgeError::UnknownMethod(other.to_string())),
    };
    WsResponse::from_result(&req, result)
}

async fn request_history(
    state: &AppState,
    req: &WsRequest,
) -> Result<serde_json::Value, BridgeError> {
    let params: HistoryParams = req.params()?;
    let entries: Vec<WireEvent> = state
        .monitor
        .request_history(params.since)
        .await
        .iter()
        .map(WireEvent::from)
        .collect();
    Ok(json!({ "entries": entries }))
}
