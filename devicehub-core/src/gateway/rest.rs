//! REST handlers of the application gateway.

use super::GatewayState;
use crate::store::EventQuery;
use crate::{DeviceRecord, DeviceStatus, ErrorCode, GatewayError, IpcError, TwinUpdateRequest};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Error envelope returned by every admin-facing endpoint
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: Some(details.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({ "error": self.code.as_str() });
        if let Some(details) = self.details {
            body["details"] = Value::String(details);
        }
        (status, Json(body)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::DeviceNotFound(id) => {
                ApiError::with_details(ErrorCode::NotFound, format!("device {}", id))
            }
            GatewayError::MethodTimeout(_) => ApiError::new(ErrorCode::MethodTimeout),
            GatewayError::BadRequest(details) => {
                ApiError::with_details(ErrorCode::BadRequest, details)
            }
            GatewayError::InvalidToken => ApiError::new(ErrorCode::InvalidToken),
            GatewayError::TokenExpired => ApiError::new(ErrorCode::TokenExpired),
            GatewayError::TokenInactive => ApiError::new(ErrorCode::TokenInactive),
            GatewayError::Internal(details) => {
                ApiError::with_details(ErrorCode::InternalError, details)
            }
        }
    }
}

impl From<crate::StoreError> for ApiError {
    fn from(err: crate::StoreError) -> Self {
        match err {
            crate::StoreError::NotFound(details) => {
                ApiError::with_details(ErrorCode::NotFound, details)
            }
            crate::StoreError::Duplicate(details) => {
                ApiError::with_details(ErrorCode::Duplicate, details)
            }
            crate::StoreError::InvalidValue(details) => {
                ApiError::with_details(ErrorCode::BadRequest, details)
            }
            other => ApiError::with_details(ErrorCode::DbUnavailable, other.to_string()),
        }
    }
}

impl From<IpcError> for ApiError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Remote(code) => {
                let mapped = match code.split(':').next().unwrap_or("") {
                    "not_found" => ErrorCode::NotFound,
                    "duplicate" => ErrorCode::Duplicate,
                    "bad_request" => ErrorCode::BadRequest,
                    "db_unavailable" => ErrorCode::DbUnavailable,
                    _ => ErrorCode::InternalError,
                };
                ApiError::with_details(mapped, code)
            }
            other => ApiError::with_details(ErrorCode::InternalError, other.to_string()),
        }
    }
}

/// Device representation returned to applications: name-first, with the
/// retained status folded in.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub uuid: String,
    pub name: String,
    pub status: DeviceStatus,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn device_view(state: &GatewayState, record: DeviceRecord) -> DeviceView {
    let status = state.device_status(&record.uuid);
    DeviceView {
        uuid: record.uuid,
        name: record.name,
        status,
        meta: record.meta,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

// --- Handlers --------------------------------------------------------------

pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": state.service_name,
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListQuery {
    pub status: Option<DeviceStatus>,
    pub model: Option<String>,
    /// Lower bound on the device's last-seen timestamp
    pub seen_since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn list_devices(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<DeviceListQuery>,
) -> Result<Json<Vec<DeviceView>>, ApiError> {
    let records = state.store.device_list(None, None).await?;

    let views = records
        .into_iter()
        .map(|record| device_view(&state, record))
        .filter(|view| match query.status {
            Some(status) => view.status == status,
            None => true,
        })
        .filter(|view| match &query.model {
            Some(model) => view.meta.get("model").and_then(Value::as_str) == Some(model.as_str()),
            None => true,
        })
        .filter(|view| match query.seen_since {
            Some(bound) => view
                .meta
                .get("lastSeen")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc) >= bound)
                .unwrap_or(false),
            None => true,
        })
        .skip(query.offset.unwrap_or(0) as usize)
        .take(query.limit.unwrap_or(u32::MAX) as usize)
        .collect();

    Ok(Json(views))
}

pub async fn get_device(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, ApiError> {
    let record = state.resolve_device(&id).await?;
    Ok(Json(device_view(&state, record)))
}

pub async fn get_twin(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.resolve_device(&id).await?;
    let pair = state
        .twin_ipc
        .call("Twin", "GetTwin", json!({ "uuid": record.uuid }))
        .await?;
    Ok(Json(json!({
        "deviceId": record.name,
        "uuid": record.uuid,
        "desired": pair.get("desired"),
        "reported": pair.get("reported"),
    })))
}

pub async fn patch_twin(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(body): Json<TwinUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    let record = state.resolve_device(&id).await?;

    let mut updated = json!({});
    if let Some(desired) = body.desired {
        if !desired.is_object() {
            return Err(ApiError::with_details(
                ErrorCode::BadRequest,
                "'desired' must be an object",
            ));
        }
        let accepted = state
            .twin_ipc
            .call(
                "Twin",
                "SetDesired",
                json!({ "uuid": record.uuid, "patch": desired }),
            )
            .await?;
        updated["desired"] = accepted["updated"]["desired"].clone();
    }
    if let Some(reported) = body.reported {
        if !reported.is_object() {
            return Err(ApiError::with_details(
                ErrorCode::BadRequest,
                "'reported' must be an object",
            ));
        }
        let accepted = state
            .twin_ipc
            .call(
                "Twin",
                "SetReported",
                json!({ "uuid": record.uuid, "patch": reported }),
            )
            .await?;
        updated["reported"] = accepted["updated"]["reported"].clone();
    }

    let pair = state
        .twin_ipc
        .call("Twin", "GetTwin", json!({ "uuid": record.uuid }))
        .await?;
    Ok(Json(json!({
        "deviceId": record.name,
        "uuid": record.uuid,
        "desired": pair.get("desired"),
        "reported": pair.get("reported"),
        "updated": updated,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn device_events(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let record = state.resolve_device(&id).await?;
    let events = state
        .store
        .event_query(EventQuery {
            device_id: Some(record.uuid.clone()),
            limit: query.limit,
            offset: query.offset,
            ..Default::default()
        })
        .await?;

    let items = events
        .into_iter()
        .map(|event| {
            json!({
                "id": event.id,
                "deviceId": record.name,
                "topic": event.topic,
                "payload": event.payload,
                "ts": event.ts,
            })
        })
        .collect();
    Ok(Json(items))
}

#[derive(Debug, Default, Deserialize)]
pub struct MethodBody {
    #[serde(default)]
    pub payload: Value,
}

pub async fn invoke_method(
    State(state): State<Arc<GatewayState>>,
    Path((id, method)): Path<(String, String)>,
    Json(body): Json<MethodBody>,
) -> Result<Json<Value>, ApiError> {
    let record = state.resolve_device(&id).await?;
    let response = state
        .call_method(&record.uuid, &method, body.payload, None)
        .await?;

    Ok(Json(json!({
        "status": response.status,
        "payload": response.payload,
        "message": response.message,
        "requestId": response.request_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMethodBody {
    pub device_ids: Vec<String>,
    pub method_name: String,
    #[serde(default)]
    pub payload: Value,
}

pub async fn batch_methods(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<BatchMethodBody>,
) -> Result<Json<Value>, ApiError> {
    let mut results = Vec::with_capacity(body.device_ids.len());

    for id in &body.device_ids {
        let entry = match state.resolve_device(id).await {
            Ok(record) => {
                match state
                    .submit_method(&record.uuid, &body.method_name, body.payload.clone())
                    .await
                {
                    Ok(request_id) => json!({
                        "deviceId": record.name,
                        "ok": true,
                        "requestId": request_id,
                    }),
                    Err(e) => json!({
                        "deviceId": record.name,
                        "ok": false,
                        "error": ErrorCode::InternalError.as_str(),
                        "message": e.to_string(),
                    }),
                }
            }
            Err(_) => json!({
                "deviceId": id,
                "ok": false,
                "error": ErrorCode::NotFound.as_str(),
            }),
        };
        results.push(entry);
    }

    Ok(Json(json!({ "ok": true, "results": results })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryQuery {
    pub device_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn telemetry(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<TelemetryQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let device_id = match &query.device_id {
        Some(id) => Some(state.resolve_device(id).await?.uuid),
        None => None,
    };

    let events = state
        .store
        .event_query(EventQuery {
            device_id,
            start_time: query.start_time,
            end_time: query.end_time,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;

    // Re-inject names so applications never see raw UUIDs
    let mut names: HashMap<String, String> = HashMap::new();
    let mut items = Vec::with_capacity(events.len());
    for event in events {
        let name = match names.get(&event.device_id) {
            Some(name) => name.clone(),
            None => {
                let name = state
                    .store
                    .device_resolve_name_by_uuid(&event.device_id)
                    .await?
                    .unwrap_or_else(|| event.device_id.clone());
                names.insert(event.device_id.clone(), name.clone());
                name
            }
        };
        items.push(json!({
            "id": event.id,
            "deviceId": name,
            "topic": event.topic,
            "payload": event.payload,
            "ts": event.ts,
        }));
    }
    Ok(Json(items))
}

pub async fn device_stats(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<Value>, ApiError> {
    let records = state.store.device_list(None, None).await?;
    let total = records.len();
    let online = records
        .iter()
        .filter(|record| state.device_status(&record.uuid) == DeviceStatus::Online)
        .count();

    Ok(Json(json!({
        "total": total,
        "online": online,
        "offline": total - online,
    })))
}
