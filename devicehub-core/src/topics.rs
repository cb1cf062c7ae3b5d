//! MQTT topic grammar for the hub.
//!
//! Every topic the hub publishes or subscribes to is built and parsed here so
//! the `$devicehub` namespace stays in one place.

/// Namespace prefix for hub-owned device topics
pub const DEVICE_PREFIX: &str = "$devicehub/devices";

/// Namespace prefix for name-addressed application data
pub const DEVICEDATA_PREFIX: &str = "$devicehub/devicedata";

/// Source filter for the name translator
pub const TRANSLATOR_SOURCE_FILTER: &str = "devices/+/messages/events/#";

pub fn provision_request_filter() -> String {
    format!("{}/+/provision/request", DEVICE_PREFIX)
}

pub fn provision_accepted(uuid: &str) -> String {
    format!("{}/{}/provision/accepted", DEVICE_PREFIX, uuid)
}

pub fn provision_rejected(uuid: &str) -> String {
    format!("{}/{}/provision/rejected", DEVICE_PREFIX, uuid)
}

pub fn provision_request(uuid: &str) -> String {
    format!("{}/{}/provision/request", DEVICE_PREFIX, uuid)
}

pub fn twin_get_filter() -> String {
    format!("{}/+/twin/get", DEVICE_PREFIX)
}

pub fn twin_update_filter() -> String {
    format!("{}/+/twin/update", DEVICE_PREFIX)
}

pub fn twin_get(uuid: &str) -> String {
    format!("{}/{}/twin/get", DEVICE_PREFIX, uuid)
}

pub fn twin_update(uuid: &str) -> String {
    format!("{}/{}/twin/update", DEVICE_PREFIX, uuid)
}

pub fn twin_update_accepted(uuid: &str) -> String {
    format!("{}/{}/twin/update/accepted", DEVICE_PREFIX, uuid)
}

pub fn twin_update_delta(uuid: &str) -> String {
    format!("{}/{}/twin/update/delta", DEVICE_PREFIX, uuid)
}

pub fn twin_update_rejected(uuid: &str) -> String {
    format!("{}/{}/twin/update/rejected", DEVICE_PREFIX, uuid)
}

pub fn status(uuid: &str) -> String {
    format!("{}/{}/status", DEVICE_PREFIX, uuid)
}

pub fn telemetry(uuid: &str) -> String {
    format!("{}/{}/telemetry", DEVICE_PREFIX, uuid)
}

pub fn method_request(uuid: &str, method: &str) -> String {
    format!("{}/{}/methods/{}/request", DEVICE_PREFIX, uuid, method)
}

pub fn method_response(uuid: &str, method: &str) -> String {
    format!("{}/{}/methods/{}/response", DEVICE_PREFIX, uuid, method)
}

pub fn message_to_device(uuid: &str) -> String {
    format!("{}/{}/messages/send", DEVICE_PREFIX, uuid)
}

/// Subscription set the application gateway attaches once per broker session
pub fn gateway_ingest_filters() -> Vec<String> {
    vec![
        format!("{}/+/telemetry", DEVICE_PREFIX),
        format!("{}/+/status", DEVICE_PREFIX),
        format!("{}/+/twin/reported", DEVICE_PREFIX),
        format!("{}/+/events/+", DEVICE_PREFIX),
        format!("{}/+/methods/+/response", DEVICE_PREFIX),
    ]
}

pub fn devicedata(name: &str, rest: &str) -> String {
    if rest.is_empty() {
        format!("{}/{}", DEVICEDATA_PREFIX, name)
    } else {
        format!("{}/{}/{}", DEVICEDATA_PREFIX, name, rest)
    }
}

/// Classified device topic kinds the gateway fans out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTopicKind {
    Telemetry,
    Status,
    TwinReported,
    Event(String),
    MethodResponse { method: String },
    TwinResult { operation: String },
    Provision { operation: String },
    Other(String),
}

impl DeviceTopicKind {
    /// The subscription topic-type WebSocket clients use to match this kind
    pub fn subscription_type(&self) -> &str {
        match self {
            DeviceTopicKind::Telemetry => "telemetry",
            DeviceTopicKind::Status => "status",
            DeviceTopicKind::TwinReported => "twin",
            DeviceTopicKind::Event(_) => "events",
            DeviceTopicKind::MethodResponse { .. } => "methods",
            DeviceTopicKind::TwinResult { .. } => "twin",
            DeviceTopicKind::Provision { .. } => "provision",
            DeviceTopicKind::Other(_) => "other",
        }
    }
}

/// Split a `$devicehub/devices/{uuid}/...` topic into the UUID and its kind.
pub fn parse_device_topic(topic: &str) -> Option<(&str, DeviceTopicKind)> {
    let rest = topic.strip_prefix(DEVICE_PREFIX)?.strip_prefix('/')?;
    let (uuid, tail) = rest.split_once('/')?;
    if uuid.is_empty() {
        return None;
    }
    let kind = match tail {
        "telemetry" => DeviceTopicKind::Telemetry,
        "status" => DeviceTopicKind::Status,
        "twin/reported" => DeviceTopicKind::TwinReported,
        "twin/get" => DeviceTopicKind::TwinResult {
            operation: "get".to_string(),
        },
        "twin/update" => DeviceTopicKind::TwinResult {
            operation: "update".to_string(),
        },
        other => {
            if let Some(event) = other.strip_prefix("events/") {
                DeviceTopicKind::Event(event.to_string())
            } else if let Some(method_tail) = other.strip_prefix("methods/") {
                let method = method_tail.strip_suffix("/response")?;
                if method.contains('/') {
                    return None;
                }
                DeviceTopicKind::MethodResponse {
                    method: method.to_string(),
                }
            } else if let Some(op) = other.strip_prefix("provision/") {
                DeviceTopicKind::Provision {
                    operation: op.to_string(),
                }
            } else {
                DeviceTopicKind::Other(other.to_string())
            }
        }
    };
    Some((uuid, kind))
}

/// Extract the UUID slot from a provisioning request topic.
pub fn parse_provision_request_topic(topic: &str) -> Option<&str> {
    match parse_device_topic(topic)? {
        (uuid, DeviceTopicKind::Provision { operation }) if operation == "request" => Some(uuid),
        _ => None,
    }
}

/// Extract `(uuid, operation)` from a twin get/update topic.
pub fn parse_twin_topic(topic: &str) -> Option<(&str, &'static str)> {
    match parse_device_topic(topic)? {
        (uuid, DeviceTopicKind::TwinResult { operation }) => match operation.as_str() {
            "get" => Some((uuid, "get")),
            "update" => Some((uuid, "update")),
            _ => None,
        },
        _ => None,
    }
}

/// Split a translator source topic `devices/{uuid}/messages/events/{rest}`
/// into the UUID and the remainder (possibly empty).
pub fn parse_translator_source(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("devices/")?;
    let (uuid, tail) = rest.split_once('/')?;
    let remainder = tail.strip_prefix("messages/events")?;
    if uuid.is_empty() {
        return None;
    }
    Some((uuid, remainder.strip_prefix('/').unwrap_or("")))
}
