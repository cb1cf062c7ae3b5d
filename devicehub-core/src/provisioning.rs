//! Provisioning broker: the bootstrap state machine.
//!
//! Devices connect with the shared provisioning identity and publish a CSR
//! on their request topic. The hub checks the allow-list, has the CA issue a
//! CN-bound client certificate, records the device, consumes the allow-list
//! entry and returns the certificate on the accepted topic. Every failure
//! lands on the rejected topic with a stable error code.

use crate::ca::CertificateAuthority;
use crate::mqtt_client::MqttClientTrait;
use crate::store::IdentityStore;
use crate::{
    topics, validate_device_name, ErrorCode, MqttError, MqttMessage, MqttResult,
    ProvisionAccepted, ProvisionRequest, Rejection, StoreError,
};

use rumqttc::QoS;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct ProvisioningService {
    client: Arc<dyn MqttClientTrait>,
    store: IdentityStore,
    ca: Arc<CertificateAuthority>,
    enforce_whitelist: bool,
    cert_days: Option<u32>,
}

impl ProvisioningService {
    pub fn new(
        client: Arc<dyn MqttClientTrait>,
        store: IdentityStore,
        ca: Arc<CertificateAuthority>,
        enforce_whitelist: bool,
        cert_days: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            ca,
            enforce_whitelist,
            cert_days,
        })
    }

    /// Subscribe to the wildcard request topic and start the handling loop.
    pub async fn start(self: &Arc<Self>) -> MqttResult<()> {
        self.client
            .subscribe(&topics::provision_request_filter(), QoS::AtLeastOnce)
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

        info!(
            "Provisioning broker started (whitelist {})",
            if self.enforce_whitelist { "enforced" } else { "open" }
        );
        Ok(())
    }

    async fn handle_message(&self, message: MqttMessage) {
        let Some(uuid) = topics::parse_provision_request_topic(&message.topic) else {
            debug!("Ignoring message on topic {}", message.topic);
            return;
        };
        let uuid = uuid.to_string();
        self.handle_request(&uuid, &message.payload).await;
    }

    /// Run the provisioning algorithm for one request.
    pub async fn handle_request(&self, topic_uuid: &str, payload: &[u8]) {
        let request: ProvisionRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed provisioning request for {}: {}", topic_uuid, e);
                self.reject(topic_uuid, ErrorCode::BadRequest, format!("Malformed request: {}", e))
                    .await;
                return;
            }
        };

        // A uuid in the payload must agree with the topic slot the device
        // published on; the broker ACL already bound that slot to its CN.
        if let Some(payload_uuid) = &request.uuid {
            if payload_uuid != topic_uuid {
                self.reject(
                    topic_uuid,
                    ErrorCode::UuidMismatch,
                    "Payload uuid does not match request topic",
                )
                .await;
                return;
            }
        }

        if let Some(name) = &request.name {
            if !validate_device_name(name) {
                self.reject(
                    topic_uuid,
                    ErrorCode::BadRequest,
                    format!("Invalid device name '{}'", name),
                )
                .await;
                return;
            }
        }

        if self.enforce_whitelist {
            match self.store.allowlist_check(topic_uuid).await {
                Ok(None) => {
                    self.reject(
                        topic_uuid,
                        ErrorCode::UuidNotWhitelisted,
                        "UUID is not whitelisted",
                    )
                    .await;
                    return;
                }
                Ok(Some(entry)) if entry.used_at.is_some() => {
                    self.reject(
                        topic_uuid,
                        ErrorCode::UuidAlreadyUsed,
                        "UUID has already been provisioned",
                    )
                    .await;
                    return;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    error!("Allow-list check failed for {}: {}", topic_uuid, e);
                    self.reject(topic_uuid, ErrorCode::DbUnavailable, "Allow-list unavailable")
                        .await;
                    return;
                }
            }
        }

        let Some(csr_pem) = request.csr_pem.as_deref().filter(|csr| !csr.is_empty()) else {
            self.reject(topic_uuid, ErrorCode::MissingCsrPem, "csrPem is required")
                .await;
            return;
        };

        let issued = match self
            .ca
            .issue_client_cert(topic_uuid, csr_pem, self.cert_days)
            .await
        {
            Ok(issued) => issued,
            Err(e) => {
                warn!("Certificate issuance failed for {}: {}", topic_uuid, e);
                self.reject(topic_uuid, e.wire_code(), e.to_string()).await;
                return;
            }
        };

        // Persistence must succeed before the certificate leaves the hub.
        // An orphaned cert after a failure here is acceptable; the device
        // retries with a fresh CSR.
        let meta = embed_uuid(request.meta, topic_uuid);
        if let Err(e) = self
            .store
            .device_upsert(topic_uuid, request.name.as_deref(), Some(meta))
            .await
        {
            error!("Device registration failed for {}: {}", topic_uuid, e);
            self.reject(topic_uuid, ErrorCode::InternalError, "Device registration failed")
                .await;
            return;
        }

        match self.store.allowlist_mark_used(topic_uuid).await {
            Ok(()) => {}
            // With an open allow-list there may be nothing to consume
            Err(StoreError::NotFound(_)) if !self.enforce_whitelist => {}
            Err(e) => {
                error!("Allow-list consumption failed for {}: {}", topic_uuid, e);
                self.reject(topic_uuid, ErrorCode::InternalError, "Allow-list update failed")
                    .await;
                return;
            }
        }

        let accepted = ProvisionAccepted {
            device_id: topic_uuid.to_string(),
            cert_pem: issued.cert_pem,
            ca_chain_pem: issued.chain_pem,
        };
        let payload = match serde_json::to_vec(&accepted) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Acceptance serialization failed for {}: {}", topic_uuid, e);
                return;
            }
        };

        if let Err(e) = self
            .client
            .publish(&topics::provision_accepted(topic_uuid), &payload, QoS::AtLeastOnce)
            .await
        {
            error!("Acceptance publish failed for {}: {}", topic_uuid, e);
            return;
        }

        info!("Provisioned device {}", topic_uuid);
    }

    async fn reject(&self, uuid: &str, code: ErrorCode, message: impl Into<String>) {
        let rejection = Rejection::new(code, message);
        let payload = match serde_json::to_vec(&rejection) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Rejection serialization failed: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .client
            .publish(&topics::provision_rejected(uuid), &payload, QoS::AtLeastOnce)
            .await
        {
            error!("Rejection publish failed for {}: {}", uuid, e);
        }
    }
}

/// Store the request meta verbatim, with the device UUID embedded.
fn embed_uuid(meta: Option<Value>, uuid: &str) -> Value {
    let mut map = match meta {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    map.insert("uuid".to_string(), Value::String(uuid.to_string()));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaSettings;
    use crate::mqtt_client::MockMqttClient;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use serde_json::json;
    use tempfile::TempDir;

    const UUID: &str = "9205255a-7a56-43b1-8b51-3b2a83fca4a1";

    struct Fixture {
        client: Arc<MockMqttClient>,
        store: IdentityStore,
        service: Arc<ProvisioningService>,
        _dir: TempDir,
    }

    async fn fixture(enforce_whitelist: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(CertificateAuthority::new(CaSettings {
            crt_path: dir.path().join("certs/root/ca.crt"),
            key_path: dir.path().join("certs/root/ca.key"),
            cert_days: 825,
        }));
        ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();

        let client = Arc::new(MockMqttClient::new());
        let store = IdentityStore::open_in_memory().unwrap();
        let service = ProvisioningService::new(
            client.clone(),
            store.clone(),
            ca,
            enforce_whitelist,
            None,
        );
        Fixture {
            client,
            store,
            service,
            _dir: dir,
        }
    }

    fn make_csr(cn: &str) -> String {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.serialize_request(&key_pair).unwrap().pem().unwrap()
    }

    async fn rejection_on(client: &MockMqttClient, uuid: &str) -> Rejection {
        let published = client.published_on(&topics::provision_rejected(uuid)).await;
        assert_eq!(published.len(), 1, "expected exactly one rejection");
        serde_json::from_slice(&published[0]).unwrap()
    }

    #[tokio::test]
    async fn test_happy_provisioning() {
        let fx = fixture(true).await;
        fx.store.allowlist_add(UUID, None).await.unwrap();

        let request = json!({"uuid": UUID, "csrPem": make_csr(UUID), "meta": {"model": "mk2"}});
        fx.service
            .handle_request(UUID, &serde_json::to_vec(&request).unwrap())
            .await;

        // Accepted payload carries the certificate and chain
        let accepted = fx.client.published_on(&topics::provision_accepted(UUID)).await;
        assert_eq!(accepted.len(), 1);
        let accepted: ProvisionAccepted = serde_json::from_slice(&accepted[0]).unwrap();
        assert_eq!(accepted.device_id, UUID);
        let info = crate::ca::inspect_certificate(&accepted.cert_pem).unwrap();
        assert!(info.subject.contains(UUID));

        // Device record exists with the default name and embedded uuid
        let device = fx.store.device_get(UUID).await.unwrap().unwrap();
        assert_eq!(device.name, "EDGB-9205");
        assert_eq!(device.meta["model"], "mk2");
        assert_eq!(device.meta["uuid"], UUID);

        // The allow-list entry is consumed
        let entry = fx.store.allowlist_check(UUID).await.unwrap().unwrap();
        assert!(entry.used_at.is_some());
    }

    #[tokio::test]
    async fn test_cn_mismatch_rejected() {
        let fx = fixture(true).await;
        fx.store.allowlist_add(UUID, None).await.unwrap();

        let request = json!({"csrPem": make_csr("attacker")});
        fx.service
            .handle_request(UUID, &serde_json::to_vec(&request).unwrap())
            .await;

        let rejection = rejection_on(&fx.client, UUID).await;
        assert_eq!(rejection.error, "csr_cn_mismatch");

        // No cert issued, no registration, allow-list untouched
        assert!(fx
            .client
            .published_on(&topics::provision_accepted(UUID))
            .await
            .is_empty());
        assert!(fx.store.device_get(UUID).await.unwrap().is_none());
        let entry = fx.store.allowlist_check(UUID).await.unwrap().unwrap();
        assert!(entry.used_at.is_none());
    }

    #[tokio::test]
    async fn test_double_use_rejected() {
        let fx = fixture(true).await;
        fx.store.allowlist_add(UUID, None).await.unwrap();

        let request = serde_json::to_vec(&json!({"csrPem": make_csr(UUID)})).unwrap();
        fx.service.handle_request(UUID, &request).await;
        fx.client.clear_published().await;

        fx.service.handle_request(UUID, &request).await;

        let rejection = rejection_on(&fx.client, UUID).await;
        assert_eq!(rejection.error, "uuid_already_used");
    }

    #[tokio::test]
    async fn test_unknown_uuid_rejected() {
        let fx = fixture(true).await;

        let request = serde_json::to_vec(&json!({"csrPem": make_csr(UUID)})).unwrap();
        fx.service.handle_request(UUID, &request).await;

        let rejection = rejection_on(&fx.client, UUID).await;
        assert_eq!(rejection.error, "uuid_not_whitelisted");
    }

    #[tokio::test]
    async fn test_uuid_mismatch_rejected() {
        let fx = fixture(true).await;
        fx.store.allowlist_add(UUID, None).await.unwrap();

        let request = serde_json::to_vec(&json!({"uuid": "someone-else", "csrPem": make_csr(UUID)}))
            .unwrap();
        fx.service.handle_request(UUID, &request).await;

        let rejection = rejection_on(&fx.client, UUID).await;
        assert_eq!(rejection.error, "uuid_mismatch");
    }

    #[tokio::test]
    async fn test_missing_csr_rejected() {
        let fx = fixture(true).await;
        fx.store.allowlist_add(UUID, None).await.unwrap();

        fx.service
            .handle_request(UUID, &serde_json::to_vec(&json!({})).unwrap())
            .await;

        let rejection = rejection_on(&fx.client, UUID).await;
        assert_eq!(rejection.error, "missing_csrPem");
    }

    #[tokio::test]
    async fn test_open_whitelist_allows_any_uuid() {
        let fx = fixture(false).await;

        let request = serde_json::to_vec(&json!({"csrPem": make_csr(UUID), "name": "pump-A"}))
            .unwrap();
        fx.service.handle_request(UUID, &request).await;

        let accepted = fx.client.published_on(&topics::provision_accepted(UUID)).await;
        assert_eq!(accepted.len(), 1);
        let device = fx.store.device_get(UUID).await.unwrap().unwrap();
        assert_eq!(device.name, "pump-A");
    }

    #[tokio::test]
    async fn test_supplied_name_validated() {
        let fx = fixture(false).await;

        let request = serde_json::to_vec(&json!({"csrPem": make_csr(UUID), "name": "-bad"}))
            .unwrap();
        fx.service.handle_request(UUID, &request).await;

        let rejection = rejection_on(&fx.client, UUID).await;
        assert_eq!(rejection.error, "bad_request");
    }

    #[tokio::test]
    async fn test_start_routes_wildcard_messages() {
        let fx = fixture(false).await;
        fx.service.start().await.unwrap();

        let subs = fx.client.subscription_topics().await;
        assert!(subs.contains(&topics::provision_request_filter()));

        let request = serde_json::to_vec(&json!({"csrPem": make_csr(UUID)})).unwrap();
        fx.client
            .inject_message(&topics::provision_request(UUID), &request)
            .await
            .unwrap();

        // The handling loop runs on a spawned task
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let accepted = fx.client.published_on(&topics::provision_accepted(UUID)).await;
        assert_eq!(accepted.len(), 1);
    }
}
