//! `/ws/terminal`: start sessions, drive them, receive their events.
//!
//! A connection can only address sessions it started or attached; every
//! other ID is `unknown_session`, whether or not it exists. Sessions left
//! behind by a dropped connection are detached and can be attached again.

use std::collections::HashMap;
use std::pin::Pin;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamMap;

use crate::broker::{SubscriberQueue, Subscription};
use crate::event::{SessionId, StreamEvent};
use crate::session::SessionConfig;

use super::error::BridgeError;
use super::protocol::{
    Hello, ResizeParams, SendInputParams, SessionParams, SubscriptionLost, WireEvent, WsRequest,
    WsResponse,
};
use super::{close_frame, send_json, AppState, WsSink};

enum Delivery {
    Event(StreamEvent),
    /// The subscriber queue closed.
    Closed,
}

type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

pub(super) async fn ws_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_terminal(socket, state))
}

async fn handle_terminal(socket: WebSocket, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut conn = TerminalConnection::new(state);

    if send_json(&mut ws_tx, &Hello::terminal()).await.is_err() {
        return;
    }
    tracing::debug!("terminal client connected");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = conn.dispatch(&text).await;
                        if send_json(&mut ws_tx, &response).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let err = BridgeError::InvalidRequest("binary frames are not accepted".into());
                        if send_json(&mut ws_tx, &WsResponse::protocol_error(&err)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }

            Some((session_id, delivery)) = conn.streams.next(), if !conn.streams.is_empty() => {
                if conn.forward(&mut ws_tx, session_id, delivery).await.is_err() {
                    break;
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("terminal client closing for shutdown");
                    close_frame(&mut ws_tx).await;
                    break;
                }
            }
        }
    }

    conn.disconnect();
}

struct TerminalConnection {
    state: AppState,
    /// Sessions this connection started or attached and has not yet seen end.
    owned: HashMap<SessionId, Subscription>,
    streams: StreamMap<SessionId, DeliveryStream>,
}

impl TerminalConnection {
    fn new(state: AppState) -> Self {
        Self {
            state,
            owned: HashMap::new(),
            streams: StreamMap::new(),
        }
    }

    async fn dispatch(&mut self, text: &str) -> WsResponse {
        let req: WsRequest = match serde_json::from_str(text) {
            Ok(req) => req,
            Err(e) => {
                return WsResponse::protocol_error(&BridgeError::InvalidRequest(format!(
                    "invalid JSON request: {e}"
                )))
            }
        };
        let result = match req.method.as_str() {
            "start_session" => self.start_session(&req).await,
            "send_input" => self.send_input(&req).await,
            "request_context" => self.request_context(&req),
            "resize_session" => self.resize_session(&req),
            "close_session" => self.close_session(&req),
            "attach_session" => self.attach_session(&req),
            other => Err(BridgeError::UnknownMethod(other.to_string())),
        };
        WsResponse::from_result(&req, result)
    }

    fn owned(&self, id: SessionId) -> Result<SessionId, BridgeError> {
        if self.owned.contains_key(&id) {
            Ok(id)
        } else {
            Err(BridgeError::UnknownSession(id.to_string()))
        }
    }

    async fn start_session(&mut self, req: &WsRequest) -> Result<serde_json::Value, BridgeError> {
        let config: SessionConfig = req.params()?;
        let (queue, rx) = SubscriberQueue::bounded(self.state.settings.queue_capacity);
        let (id, subscription) = self
            .state
            .sessions
            .start_session_subscribed(config, queue)
            .await?;
        self.hold(id, subscription, rx);
        Ok(json!({ "session_id": id }))
    }

    fn attach_session(&mut self, req: &WsRequest) -> Result<serde_json::Value, BridgeError> {
        let params: SessionParams = req.params()?;
        let id = params.session_id;
        if self.owned.contains_key(&id) {
            return Ok(json!({ "session_id": id }));
        }
        let (queue, rx) = SubscriberQueue::bounded(self.state.settings.queue_capacity);
        let subscription = self.state.sessions.attach_session(id, queue)?;
        self.hold(id, subscription, rx);
        Ok(json!({ "session_id": id }))
    }

    fn hold(&mut self, id: SessionId, subscription: Subscription, rx: mpsc::Receiver<StreamEvent>) {
        let stream: DeliveryStream = Box::pin(
            ReceiverStream::new(rx)
                .map(Delivery::Event)
                .chain(stream::once(async { Delivery::Closed })),
        );
        self.streams.insert(id, stream);
        self.owned.insert(id, subscription);
    }

    async fn send_input(&mut self, req: &WsRequest) -> Result<serde_json::Value, BridgeError> {
        let params: SendInputParams = req.params()?;
        let id = self.owned(params.session_id)?;
        let data = params.encoding.decode(&params.data)?;
        self.state.sessions.send_input(id, data).await;
        Ok(json!({}))
    }

    fn request_context(&self, req: &WsRequest) -> Result<serde_json::Value, BridgeError> {
        let params: SessionParams = req.params()?;
        let id = self.owned(params.session_id)?;
        let snapshot = self.state.context.request_context(id)?;
        serde_json::to_value(snapshot).map_err(|e| BridgeError::Internal(e.to_string()))
    }

    fn resize_session(&self, req: &WsRequest) -> Result<serde_json::Value, BridgeError> {
        let params: ResizeParams = req.params()?;
        let id = self.owned(params.session_id)?;
        self.state
            .sessions
            .resize_session(id, params.rows, params.cols)?;
        Ok(json!({}))
    }

    fn close_session(&self, req: &WsRequest) -> Result<serde_json::Value, BridgeError> {
        let params: SessionParams = req.params()?;
        let id = self.owned(params.session_id)?;
        let closed = self.state.sessions.terminate_session(id);
        Ok(json!({ "closed": closed }))
    }

    async fn forward(
        &mut self,
        ws_tx: &mut WsSink,
        session_id: SessionId,
        delivery: Delivery,
    ) -> Result<(), axum::Error> {
        match delivery {
            Delivery::Event(event) => {
                if event.payload.is_terminal() {
                    self.owned.remove(&session_id);
                }
                send_json(ws_tx, &WireEvent::from(&event)).await
            }
            Delivery::Closed => {
                // A queue that closes before session_ended was dropped for
                // falling behind; the session itself may still be running.
                if self.owned.contains_key(&session_id) {
                    tracing::warn!(session = %session_id, "terminal client lost its subscription");
                    send_json(ws_tx, &SubscriptionLost::new(Some(session_id))).await
                } else {
                    Ok(())
                }
            }
        }
    }

    fn disconnect(self) {
        let terminate = self.state.settings.terminate_on_disconnect;
        for (id, subscription) in self.owned {
            self.state.sessions.broker().unsubscribe(&subscription);
            if terminate {
                self.state.sessions.terminate_session(id);
            } else {
                self.state.sessions.detach_session(id);
            }
        }
        tracing::debug!("terminal client disconnected");
    }
}
