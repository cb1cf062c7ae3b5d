//! WebSocket endpoint: subscription-based fan-out plus method invocation.
//!
//! Clients authenticate with `?token=`, then send subscribe frames naming
//! topic types and devices (either form, `*` for all). The gateway forwards
//! every matching broker message as `{type:"message", topic, deviceId, data}`
//! with the device name re-injected.

use super::{BrokerEvent, GatewayState};
use crate::{ErrorCode, GatewayError, WsClientFrame, WsServerFrame, topics};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use rumqttc::QoS;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Close code for authentication failures
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for store unavailability
const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, query.token))
}

async fn handle_socket(state: Arc<GatewayState>, mut socket: WebSocket, token: Option<String>) {
    // Authentication happens on the open socket so the client sees the
    // distinguishing close code rather than a failed handshake.
    let auth = match token {
        Some(secret) => super::auth::validate_token(&state, &secret).await,
        None => Err(ErrorCode::InvalidToken),
    };
    match auth {
        Ok(identity) => {
            debug!("WebSocket client authenticated as token '{}'", identity.name);
        }
        Err(code) => {
            let (close_code, reason) = match code {
                ErrorCode::DbUnavailable => (CLOSE_INTERNAL_ERROR, "store unavailable"),
                _ => (CLOSE_POLICY_VIOLATION, "invalid token"),
            };
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    }

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    // Single writer task keeps per-connection delivery ordered
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut events = state.events.subscribe();
    let mut subscribed_types: HashSet<String> = HashSet::new();
    let mut subscribed_devices: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        handle_client_frame(
                            &state,
                            &out_tx,
                            &mut subscribed_types,
                            &mut subscribed_devices,
                            text.as_str(),
                        )
                        .await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        forward_event(&state, &out_tx, &subscribed_types, &subscribed_devices, event)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("WebSocket client lagged, {} broker messages dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    writer.abort();
}

async fn handle_client_frame(
    state: &Arc<GatewayState>,
    out_tx: &mpsc::Sender<Message>,
    subscribed_types: &mut HashSet<String>,
    subscribed_devices: &mut HashSet<String>,
    raw: &str,
) {
    let frame: WsClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            send_frame(
                out_tx,
                &WsServerFrame::Error {
                    message: format!("{}: {}", ErrorCode::BadRequest.as_str(), e),
                },
            )
            .await;
            return;
        }
    };

    match frame {
        WsClientFrame::Subscribe { topics, devices } => {
            subscribed_types.extend(topics);
            for device in devices {
                subscribed_devices.insert(resolve_subscription_device(state, device).await);
            }
        }
        WsClientFrame::Unsubscribe { topics, devices } => {
            if topics.is_empty() && devices.is_empty() {
                subscribed_types.clear();
                subscribed_devices.clear();
            } else {
                for topic in &topics {
                    subscribed_types.remove(topic);
                }
                for device in devices {
                    let resolved = resolve_subscription_device(state, device).await;
                    subscribed_devices.remove(&resolved);
                }
            }
        }
        WsClientFrame::Ping => {
            send_frame(out_tx, &WsServerFrame::Pong).await;
        }
        WsClientFrame::CallMethod {
            device_id,
            method_name,
            payload,
            request_id,
        } => {
            // Calls run detached: a slow device must not stall the
            // connection's read loop or other clients.
            let state = Arc::clone(state);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                call_method_frame(state, out_tx, device_id, method_name, payload, request_id).await;
            });
        }
        WsClientFrame::SendMessage { device_id, data } => {
            let state = Arc::clone(state);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                send_message_frame(state, out_tx, device_id, data).await;
            });
        }
    }
}

/// Subscription entries are stored UUID-resolved so name and UUID
/// subscribers match the same broker traffic.
async fn resolve_subscription_device(state: &GatewayState, device: String) -> String {
    if device == "*" {
        return device;
    }
    match state.store.device_get_by_identifier(&device).await {
        Ok(Some(record)) => record.uuid,
        _ => device,
    }
}

async fn call_method_frame(
    state: Arc<GatewayState>,
    out_tx: mpsc::Sender<Message>,
    device_id: String,
    method_name: String,
    payload: Value,
    request_id: Option<String>,
) {
    let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let record = match state.resolve_device(&device_id).await {
        Ok(record) => record,
        Err(_) => {
            send_frame(
                &out_tx,
                &WsServerFrame::Error {
                    message: format!("{}: device {}", ErrorCode::NotFound.as_str(), device_id),
                },
            )
            .await;
            return;
        }
    };

    match state
        .call_method(&record.uuid, &method_name, payload, Some(request_id.clone()))
        .await
    {
        Ok(response) => {
            send_frame(
                &out_tx,
                &WsServerFrame::MethodResponse {
                    request_id: response.request_id,
                    status: response.status,
                    payload: response.payload,
                    message: response.message,
                },
            )
            .await;
        }
        Err(GatewayError::MethodTimeout(_)) => {
            send_frame(
                &out_tx,
                &WsServerFrame::MethodResponse {
                    request_id,
                    status: 504,
                    payload: None,
                    message: Some(ErrorCode::MethodTimeout.as_str().to_string()),
                },
            )
            .await;
        }
        Err(e) => {
            send_frame(
                &out_tx,
                &WsServerFrame::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }
}

async fn send_message_frame(
    state: Arc<GatewayState>,
    out_tx: mpsc::Sender<Message>,
    device_id: String,
    data: Value,
) {
    let record = match state.resolve_device(&device_id).await {
        Ok(record) => record,
        Err(_) => {
            send_frame(
                &out_tx,
                &WsServerFrame::Error {
                    message: format!("{}: device {}", ErrorCode::NotFound.as_str(), device_id),
                },
            )
            .await;
            return;
        }
    };

    let payload = data.to_string();
    let ok = state
        .mqtt
        .publish(
            &topics::message_to_device(&record.uuid),
            payload.as_bytes(),
            QoS::AtLeastOnce,
        )
        .await
        .is_ok();

    send_frame(
        &out_tx,
        &WsServerFrame::MessageSent {
            device_id: record.name,
            ok,
        },
    )
    .await;
}

/// A client receives a message iff its type set matches the topic type and
/// its device set matches the resolved device UUID, with `*` as wildcard.
fn subscription_matches(
    subscribed_types: &HashSet<String>,
    subscribed_devices: &HashSet<String>,
    topic_type: &str,
    uuid: &str,
) -> bool {
    let type_match =
        subscribed_types.contains("*") || subscribed_types.contains(topic_type);
    let device_match = subscribed_devices.contains("*") || subscribed_devices.contains(uuid);
    type_match && device_match
}

async fn forward_event(
    state: &GatewayState,
    out_tx: &mpsc::Sender<Message>,
    subscribed_types: &HashSet<String>,
    subscribed_devices: &HashSet<String>,
    event: BrokerEvent,
) {
    if !subscription_matches(subscribed_types, subscribed_devices, &event.topic_type, &event.uuid) {
        return;
    }

    let name = state
        .store
        .device_resolve_name_by_uuid(&event.uuid)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| event.uuid.clone());

    send_frame(
        out_tx,
        &WsServerFrame::Message {
            topic: event.topic,
            device_id: name,
            data: event.data,
        },
    )
    .await;
}

async fn send_frame(out_tx: &mpsc::Sender<Message>, frame: &WsServerFrame) {
    let encoded = match serde_json::to_string(frame) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!("WebSocket frame serialization failed: {}", e);
            return;
        }
    };
    let _ = out_tx.send(Message::Text(encoded.into())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[&str]) -> HashSet<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_subscription_matching() {
        // Exact type and device
        assert!(subscription_matches(
            &set(&["telemetry"]),
            &set(&["u-1"]),
            "telemetry",
            "u-1"
        ));
        // Wildcards on either axis
        assert!(subscription_matches(&set(&["*"]), &set(&["u-1"]), "status", "u-1"));
        assert!(subscription_matches(
            &set(&["telemetry"]),
            &set(&["*"]),
            "telemetry",
            "u-2"
        ));
        assert!(subscription_matches(&set(&["*"]), &set(&["*"]), "events", "u-9"));
        // Both axes must match
        assert!(!subscription_matches(
            &set(&["telemetry"]),
            &set(&["u-1"]),
            "status",
            "u-1"
        ));
        assert!(!subscription_matches(
            &set(&["telemetry"]),
            &set(&["u-1"]),
            "telemetry",
            "u-2"
        ));
        // Empty sets match nothing
        assert!(!subscription_matches(&set(&[]), &set(&["*"]), "telemetry", "u-1"));
        assert!(!subscription_matches(&set(&["*"]), &set(&[]), "telemetry", "u-1"));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CLOSE_POLICY_VIOLATION, 1008);
        assert_eq!(CLOSE_INTERNAL_ERROR, 1011);
    }
}
