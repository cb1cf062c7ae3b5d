use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// UUID allow-list entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub uuid: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Device record in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub uuid: String,
    pub name: String,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One half of a twin pair (desired or reported)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwinDocument {
    pub version: u64,
    pub doc: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl TwinDocument {
    pub fn empty() -> Self {
        Self {
            version: 0,
            doc: Map::new(),
            updated_at: Utc::now(),
        }
    }
}

/// The paired desired/reported documents for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwinPair {
    pub desired: TwinDocument,
    pub reported: TwinDocument,
}

impl TwinPair {
    pub fn empty() -> Self {
        Self {
            desired: TwinDocument::empty(),
            reported: TwinDocument::empty(),
        }
    }
}

/// API token record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: i64,
    pub name: String,
    pub token: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Authenticated token identity handed to request handlers
#[derive(Debug, Clone)]
pub struct TokenIdentity {
    pub id: i64,
    pub name: String,
    pub scopes: Vec<String>,
}

/// Persisted device event row (telemetry, events topics)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub id: i64,
    pub device_id: String,
    pub topic: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

/// Device online/offline state from the retained status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Retained status/LWT payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: DeviceStatus,
    pub ts: DateTime<Utc>,
}

/// MQTT connection state of a hub client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// A raw message received from the broker
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub timestamp: DateTime<Utc>,
}

// --- Provisioning wire payloads -------------------------------------------

/// Device-to-hub provisioning request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub uuid: Option<String>,
    pub csr_pem: Option<String>,
    pub name: Option<String>,
    pub meta: Option<Value>,
    pub token: Option<String>,
}

/// Hub-to-device provisioning acceptance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionAccepted {
    pub device_id: String,
    pub cert_pem: String,
    pub ca_chain_pem: String,
}

/// Rejection payload shared by every `.../rejected` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub error: String,
    pub message: String,
}

impl Rejection {
    pub fn new(code: crate::ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code.as_str().to_string(),
            message: message.into(),
        }
    }
}

// --- Twin wire payloads ----------------------------------------------------

/// Device or application twin update request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinUpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,
}

/// New versions assigned by an accepted update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatedVersions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported: Option<u64>,
}

/// Twin accepted payload: the full pair plus the versions the update produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinAccepted {
    pub device_id: String,
    pub desired: TwinDocument,
    pub reported: TwinDocument,
    pub updated: UpdatedVersions,
}

/// Twin delta publish: keys where desired differs from reported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinDelta {
    pub device_id: String,
    pub delta: Map<String, Value>,
    pub desired_version: u64,
    pub reported_version: u64,
}

// --- Direct method wire payloads ------------------------------------------

/// Hub-to-device method invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodRequest {
    pub request_id: String,
    pub method_name: String,
    pub payload: Value,
}

/// Device-to-hub method response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// --- WebSocket frames ------------------------------------------------------

/// Frames a WebSocket client may send.
///
/// Unknown `type` values fail to decode and are answered with a
/// `bad_request` error frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsClientFrame {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
        #[serde(default)]
        devices: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        topics: Vec<String>,
        #[serde(default)]
        devices: Vec<String>,
    },
    Ping,
    #[serde(rename_all = "camelCase")]
    CallMethod {
        device_id: String,
        method_name: String,
        #[serde(default)]
        payload: Value,
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        device_id: String,
        #[serde(default)]
        data: Value,
    },
}

/// Frames the gateway sends to WebSocket clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsServerFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        topic: String,
        device_id: String,
        data: Value,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    MethodResponse {
        request_id: String,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessageSent {
        device_id: String,
        ok: bool,
    },
    Error {
        message: String,
    },
}

// --- Device naming ---------------------------------------------------------

/// Derive the default device name from a UUID: `EDGB-` plus the first four
/// hex characters.
pub fn device_name_from_uuid(uuid: &str) -> String {
    let prefix: String = uuid
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(4)
        .collect();
    format!("EDGB-{}", prefix)
}

/// Validate a human device name: 4-32 chars, alphanumeric plus `-` and `_`,
/// first character alphanumeric.
pub fn validate_device_name(name: &str) -> bool {
    use std::sync::OnceLock;
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_]{3,31}$").unwrap());
    re.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_from_uuid() {
        assert_eq!(
            device_name_from_uuid("9205255a-7a56-43b1-8b51-3b2a83fca4a1"),
            "EDGB-9205"
        );
        assert_eq!(device_name_from_uuid("ab-cd-ef-01"), "EDGB-abcd");
    }

    #[test]
    fn test_name_validation_boundaries() {
        assert!(validate_device_name("EDGB-9205"));
        assert!(validate_device_name("pump-A"));
        assert!(validate_device_name("abcd"));
        assert!(validate_device_name("a123456789012345678901234567890_"));
        // Too short, too long, bad leading char, bad chars
        assert!(!validate_device_name("abc"));
        assert!(!validate_device_name("a1234567890123456789012345678901x"));
        assert!(!validate_device_name("-abc"));
        assert!(!validate_device_name("_abc"));
        assert!(!validate_device_name("ab cd"));
        assert!(!validate_device_name("ab.cd"));
        assert!(!validate_device_name(""));
    }

    #[test]
    fn test_provision_request_decoding() {
        let raw = r#"{"uuid":"u-1","csrPem":"-----BEGIN...","meta":{"model":"mk2"},"extra":1}"#;
        let req: ProvisionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.uuid.as_deref(), Some("u-1"));
        assert!(req.csr_pem.is_some());
        assert!(req.name.is_none());
    }

    #[test]
    fn test_ws_frame_decoding() {
        let raw = r#"{"type":"subscribe","topics":["telemetry","*"],"devices":["EDGB-9205"]}"#;
        match serde_json::from_str::<WsClientFrame>(raw).unwrap() {
            WsClientFrame::Subscribe { topics, devices } => {
                assert_eq!(topics, vec!["telemetry", "*"]);
                assert_eq!(devices, vec!["EDGB-9205"]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let raw = r#"{"type":"callMethod","deviceId":"EDGB-9205","methodName":"identify","payload":{"duration":5}}"#;
        match serde_json::from_str::<WsClientFrame>(raw).unwrap() {
            WsClientFrame::CallMethod {
                device_id,
                method_name,
                payload,
                request_id,
            } => {
                assert_eq!(device_id, "EDGB-9205");
                assert_eq!(method_name, "identify");
                assert_eq!(payload["duration"], 5);
                assert!(request_id.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Unknown variant is a decode error, surfaced as bad_request upstream
        assert!(serde_json::from_str::<WsClientFrame>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_rejection_serialization() {
        let rejection = Rejection::new(crate::ErrorCode::UuidAlreadyUsed, "already consumed");
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["error"], "uuid_already_used");
        assert_eq!(json["message"], "already consumed");
    }
}
