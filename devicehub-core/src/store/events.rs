use super::{now_ts, parse_ts, IdentityStore};
use crate::{DeviceEvent, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde_json::Value;

/// Query bounds for the telemetry/event APIs
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub device_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn into_event(
    (id, device_id, topic, payload, ts): (i64, String, String, String, String),
) -> StoreResult<DeviceEvent> {
    Ok(DeviceEvent {
        id,
        device_id,
        topic,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        ts: parse_ts(&ts)?,
    })
}

impl IdentityStore {
    pub async fn event_insert(
        &self,
        device_id: &str,
        topic: &str,
        payload: Value,
    ) -> StoreResult<()> {
        let device_id = device_id.to_string();
        let topic = topic.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO device_events (device_id, topic, payload, ts) VALUES (?1, ?2, ?3, ?4)",
                params![device_id, topic, payload.to_string(), now_ts()],
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    pub async fn event_query(&self, query: EventQuery) -> StoreResult<Vec<DeviceEvent>> {
        self.with_conn(move |conn| {
            use rusqlite::types::Value as SqlValue;

            let mut sql = String::from(
                "SELECT id, device_id, topic, payload, ts FROM device_events WHERE 1=1",
            );
            let mut args: Vec<SqlValue> = Vec::new();

            if let Some(device_id) = query.device_id {
                sql.push_str(" AND device_id = ?");
                args.push(SqlValue::Text(device_id));
            }
            if let Some(start) = query.start_time {
                sql.push_str(" AND ts >= ?");
                args.push(SqlValue::Text(start.to_rfc3339()));
            }
            if let Some(end) = query.end_time {
                sql.push_str(" AND ts <= ?");
                args.push(SqlValue::Text(end.to_rfc3339()));
            }
            sql.push_str(" ORDER BY ts DESC LIMIT ? OFFSET ?");
            args.push(SqlValue::Integer(query.limit.unwrap_or(100) as i64));
            args.push(SqlValue::Integer(query.offset.unwrap_or(0) as i64));

            let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), event_from_row)
                .map_err(StoreError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            rows.into_iter().map(into_event).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::EventQuery;
    use crate::IdentityStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_query() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .event_insert("u-1", "$devicehub/devices/u-1/telemetry", json!({"t": 21.5}))
            .await
            .unwrap();
        store
            .event_insert("u-2", "$devicehub/devices/u-2/telemetry", json!({"t": 19.0}))
            .await
            .unwrap();

        let all = store.event_query(EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let one = store
            .event_query(EventQuery {
                device_id: Some("u-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].payload["t"], 21.5);
    }

    #[tokio::test]
    async fn test_limit_and_offset() {
        let store = IdentityStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .event_insert("u-1", "t", json!({"i": i}))
                .await
                .unwrap();
        }
        let page = store
            .event_query(EventQuery {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }
}
