//! Concrete IPC interface registrations.
//!
//! One registry of interfaces with explicit signatures: `Devices`,
//! `Certificate` and `Whitelist` are served by the provisioning service,
//! `Twin` by the twin engine, `Application` by the gateway.

use crate::ca::CertificateAuthority;
use crate::mqtt_client::MqttClientTrait;
use crate::store::IdentityStore;
use crate::twin::{TwinService, TwinUpdateError};
use crate::{ConnectionStatus, StoreError, TwinUpdateRequest};

use super::IpcServer;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn store_code(err: StoreError) -> String {
    match err {
        StoreError::NotFound(_) => "not_found".to_string(),
        StoreError::Duplicate(_) => "duplicate".to_string(),
        StoreError::InvalidValue(_) => "bad_request".to_string(),
        _ => "db_unavailable".to_string(),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|_| "internal_error".to_string())
}

fn arg_str(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("bad_request: missing '{}'", key))
}

fn arg_object(args: &Value, key: &str) -> Result<Map<String, Value>, String> {
    match args.get(key) {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(format!("bad_request: '{}' must be an object", key)),
        None => Err(format!("bad_request: missing '{}'", key)),
    }
}

/// `Devices`: registry operations
pub fn register_devices(server: &mut IpcServer, store: IdentityStore) {
    let s = store.clone();
    server.register("Devices", "List", move |_args| {
        let store = s.clone();
        async move {
            let devices = store.device_list(None, None).await.map_err(store_code)?;
            encode(&devices)
        }
    });

    let s = store.clone();
    server.register("Devices", "Get", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let device = store
                .device_get(&uuid)
                .await
                .map_err(store_code)?
                .ok_or_else(|| "not_found".to_string())?;
            encode(&device)
        }
    });

    let s = store.clone();
    server.register("Devices", "Set", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let name = args.get("name").and_then(Value::as_str).map(str::to_string);
            let meta = args.get("meta").filter(|v| v.is_object()).cloned();
            let device = store
                .device_upsert(&uuid, name.as_deref(), meta)
                .await
                .map_err(store_code)?;
            encode(&device)
        }
    });

    let s = store.clone();
    server.register("Devices", "Remove", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            store.device_delete(&uuid).await.map_err(store_code)?;
            Ok(json!({}))
        }
    });

    let s = store.clone();
    server.register("Devices", "ResolveDeviceNameByUUID", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let name = store
                .device_resolve_name_by_uuid(&uuid)
                .await
                .map_err(store_code)?
                .ok_or_else(|| "not_found".to_string())?;
            Ok(json!({ "name": name }))
        }
    });

    let s = store;
    server.register("Devices", "UpdateLastSeen", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            store
                .device_update_last_seen(&uuid)
                .await
                .map_err(store_code)?;
            Ok(json!({}))
        }
    });
}

/// `Certificate`: CSR-based issuance
pub fn register_certificate(server: &mut IpcServer, ca: Arc<CertificateAuthority>) {
    server.register("Certificate", "IssueFromCSR", move |args| {
        let ca = Arc::clone(&ca);
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let csr_pem = arg_str(&args, "csrPem")?;
            let days = args
                .get("days")
                .and_then(Value::as_u64)
                .map(|days| days as u32);
            let issued = ca
                .issue_client_cert(&uuid, &csr_pem, days)
                .await
                .map_err(|e| e.wire_code().as_str().to_string())?;
            Ok(json!({
                "certPem": issued.cert_pem,
                "chainPem": issued.chain_pem,
            }))
        }
    });
}

/// `Whitelist`: allow-list management
pub fn register_whitelist(server: &mut IpcServer, store: IdentityStore) {
    let s = store.clone();
    server.register("Whitelist", "CheckUUID", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            match store.allowlist_check(&uuid).await.map_err(store_code)? {
                Some(entry) => Ok(json!({
                    "present": true,
                    "used": entry.used_at.is_some(),
                    "note": entry.note,
                    "createdAt": entry.created_at,
                })),
                None => Ok(json!({ "present": false, "used": false })),
            }
        }
    });

    let s = store.clone();
    server.register("Whitelist", "List", move |_args| {
        let store = s.clone();
        async move {
            let entries = store.allowlist_list().await.map_err(store_code)?;
            encode(&entries)
        }
    });

    let s = store.clone();
    server.register("Whitelist", "Add", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let note = args.get("note").and_then(Value::as_str);
            let entry = store
                .allowlist_add(&uuid, note)
                .await
                .map_err(store_code)?;
            encode(&entry)
        }
    });

    let s = store.clone();
    server.register("Whitelist", "Remove", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            store.allowlist_remove(&uuid).await.map_err(store_code)?;
            Ok(json!({}))
        }
    });

    let s = store.clone();
    server.register("Whitelist", "Get", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let entry = store
                .allowlist_check(&uuid)
                .await
                .map_err(store_code)?
                .ok_or_else(|| "not_found".to_string())?;
            encode(&entry)
        }
    });

    let s = store;
    server.register("Whitelist", "MarkUsed", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            store.allowlist_mark_used(&uuid).await.map_err(store_code)?;
            Ok(json!({}))
        }
    });
}

/// `Twin`: the twin engine surface the gateway consumes
pub fn register_twin(server: &mut IpcServer, twin: Arc<TwinService>, store: IdentityStore) {
    let t = Arc::clone(&twin);
    server.register("Twin", "GetTwin", move |args| {
        let twin = Arc::clone(&t);
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let pair = twin.get_twin(&uuid).await.map_err(store_code)?;
            encode(&pair)
        }
    });

    let t = Arc::clone(&twin);
    server.register("Twin", "SetDesired", move |args| {
        let twin = Arc::clone(&t);
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let patch = arg_object(&args, "patch")?;
            let accepted = twin
                .apply_update(
                    &uuid,
                    TwinUpdateRequest {
                        desired: Some(Value::Object(patch)),
                        reported: None,
                    },
                )
                .await
                .map_err(twin_code)?;
            encode(&accepted)
        }
    });

    let t = Arc::clone(&twin);
    server.register("Twin", "SetReported", move |args| {
        let twin = Arc::clone(&t);
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let patch = arg_object(&args, "patch")?;
            let accepted = twin
                .apply_update(
                    &uuid,
                    TwinUpdateRequest {
                        desired: None,
                        reported: Some(Value::Object(patch)),
                    },
                )
                .await
                .map_err(twin_code)?;
            encode(&accepted)
        }
    });

    let s = store.clone();
    server.register("Twin", "ListDevices", move |_args| {
        let store = s.clone();
        async move {
            let devices = store.device_list(None, None).await.map_err(store_code)?;
            encode(&devices)
        }
    });

    let s = store;
    server.register("Twin", "UpdateDeviceStatus", move |args| {
        let store = s.clone();
        async move {
            let uuid = arg_str(&args, "uuid")?;
            let status = arg_str(&args, "status")?;
            let device = store
                .device_get(&uuid)
                .await
                .map_err(store_code)?
                .ok_or_else(|| "not_found".to_string())?;
            let mut meta = match device.meta {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            meta.insert("status".to_string(), Value::String(status));
            store
                .device_upsert(&uuid, None, Some(Value::Object(meta)))
                .await
                .map_err(store_code)?;
            Ok(json!({}))
        }
    });
}

fn twin_code(err: TwinUpdateError) -> String {
    match err {
        TwinUpdateError::BadRequest(_) => "bad_request".to_string(),
        TwinUpdateError::Store(e) => store_code(e),
    }
}

/// `Application`: gateway-side status
pub fn register_application(server: &mut IpcServer, client: Arc<dyn MqttClientTrait>) {
    server.register("Application", "GetConnectionStatus", move |_args| {
        let status = client.get_connection_status();
        async move {
            let label = match status {
                ConnectionStatus::Connected => "connected",
                ConnectionStatus::Connecting => "connecting",
                ConnectionStatus::Reconnecting => "reconnecting",
                ConnectionStatus::Error => "error",
                ConnectionStatus::Disconnected => "disconnected",
            };
            Ok(json!({
                "connected": status == ConnectionStatus::Connected,
                "status": label,
            }))
        }
    });
}
