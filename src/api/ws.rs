//! WebSocket upgrade handlers (§4.2, §4.10): a single bidirectional JSON stream per connection,
//! using a `tokio::select!` read/write loop driven off the Hub's per-client queue instead of a
//! shared broadcast channel.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::events::{ClientFilter, Event, ResumeOutcome};
use crate::license::rate_limit::RateLimiter;
use crate::types::OperationId;

use super::state::AppState;

const CLOSE_LICENSE_INVALID: u16 = 4001;
const CLOSE_RATE_LIMITED: u16 = 4002;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        request_id: Option<String>,
        op_id: Option<OperationId>,
        stage_id: Option<String>,
    },
    Unsubscribe {
        request_id: Option<String>,
    },
    Resume {
        request_id: Option<String>,
        op_id: OperationId,
        from_seq: u64,
    },
    Ping {
        request_id: Option<String>,
    },
    Pong,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    Event(&'a Event),
    Pong { request_id: Option<String> },
    Gap { request_id: Option<String>, earliest_available: u64 },
    Ack { request_id: Option<String> },
    Error { request_id: Option<String>, message: String },
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, None))
}

pub async fn upgrade_for_operation(
    ws: WebSocketUpgrade,
    Path(op_id): Path<OperationId>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Some(op_id)))
}

/// One bucket per connection, matching §4.2's "10/s per client, burst 20" inbound limit.
fn inbound_limiter() -> RateLimiter {
    RateLimiter::per_hour(10 * 3600 + 20)
}

async fn handle_socket(mut socket: WebSocket, state: AppState, op_id: Option<OperationId>) {
    if state.license.validate(false).await.is_err() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_LICENSE_INVALID,
                reason: "license invalid".into(),
            })))
            .await;
        return;
    }

    let filter = match op_id {
        Some(id) => ClientFilter::for_operation(id),
        None => ClientFilter::default(),
    };
    let client = state.hub.subscribe(filter);
    let limiter = inbound_limiter();
    let limiter_key = std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = client.recv() => {
                let Some(event) = event else { break };
                let payload = serde_json::to_string(&ServerMessage::Event(&event)).unwrap_or_default();
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if limiter.check(limiter_key).is_err() {
                            let _ = sink.send(Message::Close(Some(CloseFrame {
                                code: CLOSE_RATE_LIMITED,
                                reason: "rate limited".into(),
                            }))).await;
                            break;
                        }
                        if let Some(reply) = dispatch(&text, &client) {
                            if sink.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

/// Handles one client->server message, returning the reply to send back, if any.
fn dispatch(text: &str, client: &crate::events::ClientHandle) -> Option<String> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return Some(
                serde_json::to_string(&ServerMessage::Error {
                    request_id: None,
                    message: format!("invalid message: {e}"),
                })
                .unwrap_or_default(),
            );
        }
    };

    let reply = match message {
        ClientMessage::Ping { request_id } => ServerMessage::Pong { request_id },
        ClientMessage::Subscribe { request_id, op_id, stage_id } => {
            client.update_filter(ClientFilter { op_id, stage_id, kinds: None });
            ServerMessage::Ack { request_id }
        }
        ClientMessage::Unsubscribe { request_id } => {
            client.update_filter(ClientFilter::default());
            ServerMessage::Ack { request_id }
        }
        ClientMessage::Resume { request_id, op_id, from_seq } => match client.resume(op_id, from_seq) {
            ResumeOutcome::Replayed(_) => ServerMessage::Ack { request_id },
            ResumeOutcome::Gap { earliest_available } => ServerMessage::Gap { request_id, earliest_available },
        },
        ClientMessage::Pong => {
            client.record_pong();
            return None;
        }
    };
    Some(serde_json::to_string(&reply).unwrap_or_default())
}
