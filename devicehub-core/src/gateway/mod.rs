//! Application gateway: authenticated HTTP + WebSocket access to the fleet.
//!
//! Applications address devices by UUID or name; the gateway resolves to
//! UUID before touching the broker and re-injects names in everything it
//! returns. A single broker ingest loop feeds the WebSocket fan-out, the
//! method-call dispatcher, the status map and the event log.

pub mod auth;
pub mod methods;
pub mod rest;
pub mod ws;

pub use methods::PendingMethodCalls;

use crate::ipc::IpcClient;
use crate::mqtt_client::MqttClientTrait;
use crate::store::IdentityStore;
use crate::{
    topics, DeviceRecord, DeviceStatus, GatewayError, GatewayResult, MethodRequest,
    MethodResponse, MqttError, MqttMessage, MqttResult, StatusMessage,
};

use axum::routing::{get, post};
use axum::Router;
use parking_lot::RwLock;
use rumqttc::QoS;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// A broker message classified for fan-out
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub uuid: String,
    pub topic: String,
    /// Subscription topic-type (`telemetry`, `status`, `events`, `twin`, ...)
    pub topic_type: String,
    pub data: Value,
}

pub struct GatewayState {
    pub store: IdentityStore,
    pub mqtt: Arc<dyn MqttClientTrait>,
    pub twin_ipc: IpcClient,
    pub pending: PendingMethodCalls,
    pub events: broadcast::Sender<BrokerEvent>,
    pub statuses: RwLock<HashMap<String, DeviceStatus>>,
    pub method_timeout: Duration,
    pub service_name: String,
}

impl GatewayState {
    pub fn new(
        store: IdentityStore,
        mqtt: Arc<dyn MqttClientTrait>,
        twin_ipc: IpcClient,
        method_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            mqtt,
            twin_ipc,
            pending: PendingMethodCalls::new(),
            events,
            statuses: RwLock::new(HashMap::new()),
            method_timeout,
            service_name: "application-gateway".to_string(),
        })
    }

    /// Attach the gateway's single broker subscription set and start the
    /// ingest loop.
    pub async fn start_ingest(self: &Arc<Self>) -> MqttResult<()> {
        for filter in topics::gateway_ingest_filters() {
            self.mqtt.subscribe(&filter, QoS::AtLeastOnce).await?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<MqttMessage>();
        self.mqtt.set_message_callback(Arc::new(move |message| {
            tx.send(message)
                .map_err(|e| MqttError::MessageParsing(format!("Ingest queue closed: {}", e)))
        }));

        let state = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                state.handle_broker_message(message).await;
            }
        });

        info!("Gateway broker ingest started");
        Ok(())
    }

    pub async fn handle_broker_message(&self, message: MqttMessage) {
        let Some((uuid, kind)) = topics::parse_device_topic(&message.topic) else {
            debug!("Ignoring message on topic {}", message.topic);
            return;
        };
        let uuid = uuid.to_string();

        // Telemetry is free-form: non-JSON payloads travel as strings
        let data: Value = serde_json::from_slice(&message.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&message.payload).into_owned()));

        use crate::topics::DeviceTopicKind;
        match &kind {
            DeviceTopicKind::MethodResponse { .. } => {
                match serde_json::from_value::<MethodResponse>(data.clone()) {
                    Ok(response) => {
                        self.pending.resolve(response);
                    }
                    Err(e) => warn!("Malformed method response from {}: {}", uuid, e),
                }
            }
            DeviceTopicKind::Status => {
                match serde_json::from_value::<StatusMessage>(data.clone()) {
                    Ok(status) => {
                        self.statuses.write().insert(uuid.clone(), status.status);
                    }
                    Err(e) => warn!("Malformed status from {}: {}", uuid, e),
                }
                if let Err(e) = self.store.device_update_last_seen(&uuid).await {
                    debug!("Last-seen update for {} skipped: {}", uuid, e);
                }
            }
            DeviceTopicKind::Telemetry | DeviceTopicKind::Event(_) => {
                if let Err(e) = self
                    .store
                    .event_insert(&uuid, &message.topic, data.clone())
                    .await
                {
                    error!("Event persistence failed for {}: {}", uuid, e);
                }
                if let Err(e) = self.store.device_update_last_seen(&uuid).await {
                    debug!("Last-seen update for {} skipped: {}", uuid, e);
                }
            }
            DeviceTopicKind::TwinReported => {}
            _ => return,
        }

        let event = BrokerEvent {
            uuid,
            topic: message.topic,
            topic_type: kind.subscription_type().to_string(),
            data,
        };
        // No receivers just means no WebSocket clients right now
        let _ = self.events.send(event);
    }

    /// Resolve a device-addressed identifier (UUID or name) to its record.
    pub async fn resolve_device(&self, id: &str) -> GatewayResult<DeviceRecord> {
        self.store
            .device_get_by_identifier(id)
            .await
            .map_err(|e| GatewayError::Internal(format!("Device lookup failed: {}", e)))?
            .ok_or_else(|| GatewayError::DeviceNotFound(id.to_string()))
    }

    /// Invoke a direct method on a device and wait for the correlated
    /// response, up to the configured timeout.
    pub async fn call_method(
        &self,
        uuid: &str,
        method: &str,
        payload: Value,
        request_id: Option<String>,
    ) -> GatewayResult<MethodResponse> {
        let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let rx = self.pending.insert(&request_id);

        let request = MethodRequest {
            request_id: request_id.clone(),
            method_name: method.to_string(),
            payload,
        };
        if let Err(e) = self.publish_method_request(uuid, method, &request).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.method_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                Err(GatewayError::Internal("Method dispatcher dropped the call".to_string()))
            }
            Err(_) => {
                self.pending.remove(&request_id);
                Err(GatewayError::MethodTimeout(self.method_timeout.as_secs()))
            }
        }
    }

    /// Publish a method request without waiting. Used by batch calls.
    pub async fn submit_method(
        &self,
        uuid: &str,
        method: &str,
        payload: Value,
    ) -> GatewayResult<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = MethodRequest {
            request_id: request_id.clone(),
            method_name: method.to_string(),
            payload,
        };
        self.publish_method_request(uuid, method, &request).await?;
        Ok(request_id)
    }

    async fn publish_method_request(
        &self,
        uuid: &str,
        method: &str,
        request: &MethodRequest,
    ) -> GatewayResult<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| GatewayError::Internal(format!("Request serialization failed: {}", e)))?;
        self.mqtt
            .publish(&topics::method_request(uuid, method), &payload, QoS::AtLeastOnce)
            .await
            .map_err(|e| GatewayError::Internal(format!("Method publish failed: {}", e)))
    }

    /// Retained status for one device, defaulting to offline.
    pub fn device_status(&self, uuid: &str) -> DeviceStatus {
        self.statuses
            .read()
            .get(uuid)
            .copied()
            .unwrap_or(DeviceStatus::Offline)
    }
}

/// Build the gateway router: REST surface, WebSocket endpoint, auth
/// middleware on everything under `/api`.
pub fn router(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route("/devices", get(rest::list_devices))
        .route("/devices/{id}", get(rest::get_device))
        .route(
            "/devices/{id}/twin",
            get(rest::get_twin).patch(rest::patch_twin),
        )
        .route("/devices/{id}/events", get(rest::device_events))
        .route("/devices/{id}/methods/{method}", post(rest::invoke_method))
        .route("/batch/methods", post(rest::batch_methods))
        .route("/telemetry", get(rest::telemetry))
        .route("/stats/devices", get(rest::device_stats))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(rest::health))
        .route("/ws", get(ws::ws_handler))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_client::MockMqttClient;
    use chrono::Utc;
    use serde_json::json;

    fn state_with(mqtt: Arc<MockMqttClient>, timeout: Duration) -> Arc<GatewayState> {
        let store = IdentityStore::open_in_memory().unwrap();
        GatewayState::new(
            store,
            mqtt,
            IpcClient::new("/tmp/devicehub-test-unused.sock"),
            timeout,
        )
    }

    fn broker_message(topic: &str, payload: &[u8]) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: 1,
            retain: false,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_method_call_round_trip() {
        let mqtt = Arc::new(MockMqttClient::new());
        let state = state_with(mqtt.clone(), Duration::from_secs(5));

        let call_state = Arc::clone(&state);
        let call = tokio::spawn(async move {
            call_state
                .call_method("u-1", "identify", json!({"duration": 5}), None)
                .await
        });

        // Wait for the request to hit the broker, then answer it
        let request = loop {
            let published = mqtt
                .published_on(&topics::method_request("u-1", "identify"))
                .await;
            if let Some(payload) = published.first() {
                break serde_json::from_slice::<MethodRequest>(payload).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(request.method_name, "identify");

        let response = json!({
            "requestId": request.request_id,
            "status": 200,
            "payload": {"ok": true}
        });
        state
            .handle_broker_message(broker_message(
                &topics::method_response("u-1", "identify"),
                &serde_json::to_vec(&response).unwrap(),
            ))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.request_id, request.request_id);
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_method_call_timeout() {
        let mqtt = Arc::new(MockMqttClient::new());
        let state = state_with(mqtt, Duration::from_millis(250));

        let result = state.call_method("u-1", "identify", json!({}), None).await;
        match result {
            Err(GatewayError::MethodTimeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_status_ingest_updates_map() {
        let mqtt = Arc::new(MockMqttClient::new());
        let state = state_with(mqtt, Duration::from_secs(5));
        state.store.device_upsert("u-1", None, None).await.unwrap();

        state
            .handle_broker_message(broker_message(
                &topics::status("u-1"),
                br#"{"status":"online","ts":"2026-01-01T00:00:00Z"}"#,
            ))
            .await;
        assert_eq!(state.device_status("u-1"), DeviceStatus::Online);

        state
            .handle_broker_message(broker_message(
                &topics::status("u-1"),
                br#"{"status":"offline","ts":"2026-01-01T00:01:00Z"}"#,
            ))
            .await;
        assert_eq!(state.device_status("u-1"), DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_telemetry_ingest_persists_event() {
        let mqtt = Arc::new(MockMqttClient::new());
        let state = state_with(mqtt, Duration::from_secs(5));
        state.store.device_upsert("u-1", None, None).await.unwrap();

        state
            .handle_broker_message(broker_message(
                &topics::telemetry("u-1"),
                br#"{"t": 21.5}"#,
            ))
            .await;

        let events = state
            .store
            .event_query(crate::store::EventQuery {
                device_id: Some("u-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["t"], 21.5);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let mqtt = Arc::new(MockMqttClient::new());
        let state = state_with(mqtt, Duration::from_secs(5));
        let mut rx = state.events.subscribe();

        state
            .handle_broker_message(broker_message(&topics::telemetry("u-1"), b"42"))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.uuid, "u-1");
        assert_eq!(event.topic_type, "telemetry");
        assert_eq!(event.data, json!(42));
    }
}
