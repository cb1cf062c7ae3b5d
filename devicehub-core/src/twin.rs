//! Twin reconciliation engine.
//!
//! Maintains the desired/reported document pair per device. Updates arrive
//! over MQTT from devices and over IPC from the application gateway; both
//! paths share the same merge, versioning and delta semantics.

use crate::mqtt_client::MqttClientTrait;
use crate::store::IdentityStore;
use crate::{
    topics, ErrorCode, MqttError, MqttMessage, MqttResult, Rejection, StoreResult, TwinAccepted,
    TwinDelta, TwinPair, TwinUpdateRequest, UpdatedVersions,
};

use rumqttc::QoS;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct TwinService {
    client: Arc<dyn MqttClientTrait>,
    store: IdentityStore,
}

impl TwinService {
    pub fn new(client: Arc<dyn MqttClientTrait>, store: IdentityStore) -> Arc<Self> {
        Arc::new(Self { client, store })
    }

    /// Subscribe to the twin topics and start the handling loop.
    pub async fn start(self: &Arc<Self>) -> MqttResult<()> {
        self.client
            .subscribe(&topics::twin_get_filter(), QoS::AtLeastOnce)
            .await?;
        self.client
            .subscribe(&topics::twin_update_filter(), QoS::AtLeastOnce)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<MqttMessage>();
        self.client.set_message_callback(Arc::new(move |message| {
            tx.send(message)
                .map_err(|e| MqttError::MessageParsing(format!("Handler queue closed: {}", e)))
        }));

        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                service.handle_message(message).await;
            }
        });

        info!("Twin engine started");
        Ok(())
    }

    async fn handle_message(&self, message: MqttMessage) {
        let Some((uuid, operation)) = topics::parse_twin_topic(&message.topic) else {
            debug!("Ignoring message on topic {}", message.topic);
            return;
        };
        let uuid = uuid.to_string();
        match operation {
            "get" => self.handle_get(&uuid).await,
            "update" => self.handle_update(&uuid, &message.payload).await,
            _ => {}
        }
    }

    /// Service a twin get: publish the current pair on the accepted topic.
    pub async fn handle_get(&self, uuid: &str) {
        match self.get_twin(uuid).await {
            Ok(pair) => {
                let accepted = TwinAccepted {
                    device_id: uuid.to_string(),
                    desired: pair.desired,
                    reported: pair.reported,
                    updated: UpdatedVersions::default(),
                };
                self.publish_json(&topics::twin_update_accepted(uuid), &accepted)
                    .await;
            }
            Err(e) => {
                error!("Twin get failed for {}: {}", uuid, e);
                self.reject(uuid, ErrorCode::DbUnavailable, "Twin store unavailable")
                    .await;
            }
        }
    }

    /// Service a twin update arriving over MQTT.
    pub async fn handle_update(&self, uuid: &str, payload: &[u8]) {
        let request: TwinUpdateRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed twin update for {}: {}", uuid, e);
                self.reject(uuid, ErrorCode::BadRequest, format!("Malformed update: {}", e))
                    .await;
                return;
            }
        };

        match self.apply_update(uuid, request).await {
            Ok(_) => {}
            Err(TwinUpdateError::BadRequest(message)) => {
                self.reject(uuid, ErrorCode::BadRequest, message).await;
            }
            Err(TwinUpdateError::Store(e)) => {
                error!("Twin update failed for {}: {}", uuid, e);
                self.reject(uuid, ErrorCode::DbUnavailable, "Twin store unavailable")
                    .await;
            }
        }
    }

    /// Merge the update into the stored pair, publish the acceptance, and
    /// publish a delta when desired and reported disagree.
    ///
    /// This is the shared path for MQTT updates and gateway IPC calls.
    pub async fn apply_update(
        &self,
        uuid: &str,
        request: TwinUpdateRequest,
    ) -> Result<TwinAccepted, TwinUpdateError> {
        let desired_patch = section_patch(request.desired, "desired")?;
        let reported_patch = section_patch(request.reported, "reported")?;

        let mut updated = UpdatedVersions::default();
        if let Some(patch) = desired_patch {
            let document = self.store.twin_set_desired(uuid, patch).await?;
            updated.desired = Some(document.version);
        }
        if let Some(patch) = reported_patch {
            let document = self.store.twin_set_reported(uuid, patch).await?;
            updated.reported = Some(document.version);
        }

        let pair = self.store.twin_get(uuid).await?;
        let accepted = TwinAccepted {
            device_id: uuid.to_string(),
            desired: pair.desired.clone(),
            reported: pair.reported.clone(),
            updated,
        };
        self.publish_json(&topics::twin_update_accepted(uuid), &accepted)
            .await;

        let delta = compute_delta(&pair.desired.doc, &pair.reported.doc);
        if !delta.is_empty() {
            let delta = TwinDelta {
                device_id: uuid.to_string(),
                delta,
                desired_version: pair.desired.version,
                reported_version: pair.reported.version,
            };
            self.publish_json(&topics::twin_update_delta(uuid), &delta)
                .await;
        }

        Ok(accepted)
    }

    /// Current pair, for the IPC surface.
    pub async fn get_twin(&self, uuid: &str) -> StoreResult<TwinPair> {
        self.store.twin_get(uuid).await
    }

    async fn publish_json<T: serde::Serialize>(&self, topic: &str, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Twin payload serialization failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, &payload, QoS::AtLeastOnce).await {
            error!("Twin publish to {} failed: {}", topic, e);
        }
    }

    async fn reject(&self, uuid: &str, code: ErrorCode, message: impl Into<String>) {
        let rejection = Rejection::new(code, message);
        self.publish_json(&topics::twin_update_rejected(uuid), &rejection)
            .await;
    }
}

/// Failure modes of a twin update
#[derive(Debug)]
pub enum TwinUpdateError {
    BadRequest(String),
    Store(crate::StoreError),
}

impl From<crate::StoreError> for TwinUpdateError {
    fn from(err: crate::StoreError) -> Self {
        TwinUpdateError::Store(err)
    }
}

impl std::fmt::Display for TwinUpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TwinUpdateError::BadRequest(message) => write!(f, "bad request: {}", message),
            TwinUpdateError::Store(e) => write!(f, "store: {}", e),
        }
    }
}

/// A section must be an object to be merged; anything else is a structural
/// error. An absent section is simply skipped.
fn section_patch(
    section: Option<Value>,
    label: &str,
) -> Result<Option<Map<String, Value>>, TwinUpdateError> {
    match section {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(TwinUpdateError::BadRequest(format!(
            "'{}' must be an object, got {}",
            label,
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The delta is every desired key whose value structurally differs from the
/// reported one, carrying the desired value.
fn compute_delta(desired: &Map<String, Value>, reported: &Map<String, Value>) -> Map<String, Value> {
    desired
        .iter()
        .filter(|(key, value)| reported.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_client::MockMqttClient;
    use serde_json::json;

    const UUID: &str = "9205255a-7a56-43b1-8b51-3b2a83fca4a1";

    fn fixture() -> (Arc<MockMqttClient>, IdentityStore, Arc<TwinService>) {
        let client = Arc::new(MockMqttClient::new());
        let store = IdentityStore::open_in_memory().unwrap();
        let service = TwinService::new(client.clone(), store.clone());
        (client, store, service)
    }

    fn update(value: serde_json::Value) -> TwinUpdateRequest {
        serde_json::from_value(value).unwrap()
    }

    async fn last_accepted(client: &MockMqttClient) -> TwinAccepted {
        let published = client.published_on(&topics::twin_update_accepted(UUID)).await;
        serde_json::from_slice(published.last().expect("no accepted publish")).unwrap()
    }

    #[test]
    fn test_compute_delta() {
        let desired = json!({"x": 2, "y": 1, "z": {"a": 1}});
        let reported = json!({"x": 1, "y": 1, "z": {"a": 1}});
        let delta = compute_delta(
            desired.as_object().unwrap(),
            reported.as_object().unwrap(),
        );
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["x"], 2);
    }

    #[test]
    fn test_delta_ignores_reported_only_keys() {
        let desired = json!({"x": 1});
        let reported = json!({"x": 1, "extra": true});
        let delta = compute_delta(
            desired.as_object().unwrap(),
            reported.as_object().unwrap(),
        );
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn test_update_then_get_round_trip() {
        let (client, _store, service) = fixture();

        service
            .handle_update(UUID, &serde_json::to_vec(&json!({"reported": {"x": 1}})).unwrap())
            .await;

        let accepted = last_accepted(&client).await;
        assert_eq!(accepted.reported.version, 1);
        assert_eq!(accepted.reported.doc["x"], 1);
        assert_eq!(accepted.updated.reported, Some(1));
        assert_eq!(accepted.updated.desired, None);

        service.handle_get(UUID).await;
        let fetched = last_accepted(&client).await;
        assert_eq!(fetched.reported.version, 1);
        assert_eq!(fetched.reported.doc["x"], 1);
    }

    #[tokio::test]
    async fn test_desired_update_publishes_delta() {
        let (client, _store, service) = fixture();

        // Device reports x=1, then an application sets desired x=2
        service
            .apply_update(UUID, update(json!({"reported": {"x": 1}})))
            .await
            .unwrap();
        service.handle_get(UUID).await;
        service
            .apply_update(UUID, update(json!({"desired": {"x": 2}})))
            .await
            .unwrap();

        let deltas = client.published_on(&topics::twin_update_delta(UUID)).await;
        let delta: TwinDelta = serde_json::from_slice(deltas.last().unwrap()).unwrap();
        assert_eq!(delta.delta["x"], 2);
        assert_eq!(delta.desired_version, 2);
        assert_eq!(delta.reported_version, 1);

        // Device converges: reported x=2 produces no further delta
        client.clear_published().await;
        service
            .apply_update(UUID, update(json!({"reported": {"x": 2}})))
            .await
            .unwrap();
        assert!(client
            .published_on(&topics::twin_update_delta(UUID))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_update_is_accepted_noop() {
        let (client, store, service) = fixture();

        store
            .twin_set_reported(UUID, json!({"x": 1}).as_object().unwrap().clone())
            .await
            .unwrap();
        client.clear_published().await;

        service
            .handle_update(UUID, &serde_json::to_vec(&json!({})).unwrap())
            .await;

        let accepted = last_accepted(&client).await;
        assert_eq!(accepted.updated.desired, None);
        assert_eq!(accepted.updated.reported, None);
        // Versions did not advance
        assert_eq!(accepted.reported.version, 1);
    }

    #[tokio::test]
    async fn test_non_object_section_rejected() {
        let (client, _store, service) = fixture();

        service
            .handle_update(UUID, &serde_json::to_vec(&json!({"desired": 42})).unwrap())
            .await;

        let rejected = client.published_on(&topics::twin_update_rejected(UUID)).await;
        let rejection: Rejection = serde_json::from_slice(&rejected[0]).unwrap();
        assert_eq!(rejection.error, "bad_request");
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected() {
        let (client, _store, service) = fixture();

        service.handle_update(UUID, b"not json").await;

        let rejected = client.published_on(&topics::twin_update_rejected(UUID)).await;
        let rejection: Rejection = serde_json::from_slice(&rejected[0]).unwrap();
        assert_eq!(rejection.error, "bad_request");
    }

    #[tokio::test]
    async fn test_both_sections_in_one_update() {
        let (client, _store, service) = fixture();

        service
            .apply_update(
                UUID,
                update(json!({"desired": {"x": 2}, "reported": {"x": 2}})),
            )
            .await
            .unwrap();

        let accepted = last_accepted(&client).await;
        assert_eq!(accepted.updated.desired, Some(1));
        assert_eq!(accepted.updated.reported, Some(1));
        // Both sides agree, no delta
        assert!(client
            .published_on(&topics::twin_update_delta(UUID))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_start_routes_twin_messages() {
        let (client, _store, service) = fixture();
        service.start().await.unwrap();

        client
            .inject_message(
                &topics::twin_update(UUID),
                &serde_json::to_vec(&json!({"reported": {"x": 1}})).unwrap(),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let accepted = last_accepted(&client).await;
        assert_eq!(accepted.reported.doc["x"], 1);
    }
}
