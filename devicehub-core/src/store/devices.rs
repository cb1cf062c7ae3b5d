use super::{now_ts, parse_ts, IdentityStore};
use crate::{device_name_from_uuid, validate_device_name, DeviceRecord, StoreError, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn into_record(
    (uuid, name, meta, created_at, updated_at): (String, String, String, String, String),
) -> StoreResult<DeviceRecord> {
    Ok(DeviceRecord {
        uuid,
        name,
        meta: serde_json::from_str(&meta)
            .map_err(|e| StoreError::InvalidValue(format!("Bad meta document: {}", e)))?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

const SELECT_COLUMNS: &str = "uuid, name, meta, created_at, updated_at";

impl IdentityStore {
    /// Create or update a device record. A missing name defaults to the
    /// `EDGB-xxxx` form on insert and is left unchanged on update; a missing
    /// meta keeps the stored document.
    pub async fn device_upsert(
        &self,
        uuid: &str,
        name: Option<&str>,
        meta: Option<Value>,
    ) -> StoreResult<DeviceRecord> {
        let uuid = uuid.to_string();
        let name = name.map(|n| n.to_string());
        if let Some(candidate) = &name {
            if !validate_device_name(candidate) {
                return Err(StoreError::InvalidValue(format!(
                    "Invalid device name '{}'",
                    candidate
                )));
            }
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StoreError::from)?;
            let now = now_ts();

            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM devices WHERE uuid = ?1", SELECT_COLUMNS),
                    params![uuid],
                    record_from_row,
                )
                .optional()
                .map_err(StoreError::from)?;

            let record = match existing {
                Some(row) => {
                    let current = into_record(row)?;
                    let new_name = name.unwrap_or(current.name);
                    let new_meta = meta
                        .map(|m| serde_json::to_string(&m).unwrap_or_else(|_| "{}".to_string()))
                        .unwrap_or_else(|| current.meta.to_string());
                    tx.execute(
                        "UPDATE devices SET name = ?1, meta = ?2, updated_at = ?3 WHERE uuid = ?4",
                        params![new_name, new_meta, now, uuid],
                    )
                    .map_err(|e| map_name_conflict(e, &new_name))?;
                    tx.query_row(
                        &format!("SELECT {} FROM devices WHERE uuid = ?1", SELECT_COLUMNS),
                        params![uuid],
                        record_from_row,
                    )
                    .map_err(StoreError::from)
                    .and_then(into_record)?
                }
                None => {
                    let new_name = name.unwrap_or_else(|| device_name_from_uuid(&uuid));
                    let new_meta = meta
                        .map(|m| serde_json::to_string(&m).unwrap_or_else(|_| "{}".to_string()))
                        .unwrap_or_else(|| "{}".to_string());
                    tx.execute(
                        "INSERT INTO devices (uuid, name, meta, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![uuid, new_name, new_meta, now],
                    )
                    .map_err(|e| map_name_conflict(e, &new_name))?;
                    tx.query_row(
                        &format!("SELECT {} FROM devices WHERE uuid = ?1", SELECT_COLUMNS),
                        params![uuid],
                        record_from_row,
                    )
                    .map_err(StoreError::from)
                    .and_then(into_record)?
                }
            };

            tx.commit().map_err(StoreError::from)?;
            Ok(record)
        })
        .await
    }

    pub async fn device_get(&self, uuid: &str) -> StoreResult<Option<DeviceRecord>> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM devices WHERE uuid = ?1", SELECT_COLUMNS),
                params![uuid],
                record_from_row,
            )
            .optional()
            .map_err(StoreError::from)?
            .map(into_record)
            .transpose()
        })
        .await
    }

    /// Resolve a device by either its UUID or its human name.
    pub async fn device_get_by_identifier(&self, id: &str) -> StoreResult<Option<DeviceRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM devices WHERE uuid = ?1 OR name = ?1",
                    SELECT_COLUMNS
                ),
                params![id],
                record_from_row,
            )
            .optional()
            .map_err(StoreError::from)?
            .map(into_record)
            .transpose()
        })
        .await
    }

    pub async fn device_resolve_uuid_by_name(&self, name: &str) -> StoreResult<Option<String>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT uuid FROM devices WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn device_resolve_name_by_uuid(&self, uuid: &str) -> StoreResult<Option<String>> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT name FROM devices WHERE uuid = ?1",
                params![uuid],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn device_list(&self, limit: Option<u32>, offset: Option<u32>) -> StoreResult<Vec<DeviceRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM devices ORDER BY created_at LIMIT ?1 OFFSET ?2",
                    SELECT_COLUMNS
                ))
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map(
                    params![limit.unwrap_or(u32::MAX), offset.unwrap_or(0)],
                    record_from_row,
                )
                .map_err(StoreError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            rows.into_iter().map(into_record).collect()
        })
        .await
    }

    pub async fn device_delete(&self, uuid: &str) -> StoreResult<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StoreError::from)?;
            let deleted = tx
                .execute("DELETE FROM devices WHERE uuid = ?1", params![uuid])
                .map_err(StoreError::from)?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("device {}", uuid)));
            }
            // Twin pairs live only while the device exists
            tx.execute("DELETE FROM twin_desired WHERE device_id = ?1", params![uuid])
                .map_err(StoreError::from)?;
            tx.execute("DELETE FROM twin_reported WHERE device_id = ?1", params![uuid])
                .map_err(StoreError::from)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    /// Stamp the device's last-seen timestamp inside its meta document.
    pub async fn device_update_last_seen(&self, uuid: &str) -> StoreResult<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StoreError::from)?;
            let meta: Option<String> = tx
                .query_row(
                    "SELECT meta FROM devices WHERE uuid = ?1",
                    params![uuid],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::from)?;
            let Some(meta) = meta else {
                return Err(StoreError::NotFound(format!("device {}", uuid)));
            };
            let mut doc = match serde_json::from_str::<Value>(&meta) {
                Ok(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            let now = now_ts();
            doc.insert("lastSeen".to_string(), Value::String(now.clone()));
            tx.execute(
                "UPDATE devices SET meta = ?1, updated_at = ?2 WHERE uuid = ?3",
                params![Value::Object(doc).to_string(), now, uuid],
            )
            .map_err(StoreError::from)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }
}

fn map_name_conflict(err: rusqlite::Error, name: &str) -> StoreError {
    match StoreError::from(err) {
        StoreError::Duplicate(_) => StoreError::Duplicate(format!("device name '{}'", name)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use crate::{IdentityStore, StoreError};
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_defaults_name_from_uuid() {
        let store = IdentityStore::open_in_memory().unwrap();
        let record = store
            .device_upsert("9205255a-7a56-43b1-8b51-3b2a83fca4a1", None, None)
            .await
            .unwrap();
        assert_eq!(record.name, "EDGB-9205");
        assert_eq!(record.meta, json!({}));
    }

    #[tokio::test]
    async fn test_upsert_preserves_name_and_meta_on_update() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .device_upsert("u-1234", Some("pump-A"), Some(json!({"model": "mk2"})))
            .await
            .unwrap();

        let updated = store.device_upsert("u-1234", None, None).await.unwrap();
        assert_eq!(updated.name, "pump-A");
        assert_eq!(updated.meta, json!({"model": "mk2"}));
    }

    #[tokio::test]
    async fn test_name_resolution_round_trip() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .device_upsert("u-1234", Some("pump-A"), None)
            .await
            .unwrap();

        let uuid = store
            .device_resolve_uuid_by_name("pump-A")
            .await
            .unwrap()
            .unwrap();
        let name = store
            .device_resolve_name_by_uuid(&uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "pump-A");
    }

    #[tokio::test]
    async fn test_get_by_identifier_accepts_both() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .device_upsert("u-1234", Some("pump-A"), None)
            .await
            .unwrap();

        assert!(store
            .device_get_by_identifier("u-1234")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .device_get_by_identifier("pump-A")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .device_get_by_identifier("other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .device_upsert("u-1234", Some("pump-A"), None)
            .await
            .unwrap();
        match store.device_upsert("u-5678", Some("pump-A"), None).await {
            Err(StoreError::Duplicate(_)) => {}
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let store = IdentityStore::open_in_memory().unwrap();
        match store.device_upsert("u-1234", Some("-bad"), None).await {
            Err(StoreError::InvalidValue(_)) => {}
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_removes_twins() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.device_upsert("u-1234", None, None).await.unwrap();
        store
            .twin_set_reported("u-1234", json!({"x": 1}).as_object().unwrap().clone())
            .await
            .unwrap();

        store.device_delete("u-1234").await.unwrap();
        // The old documents are gone; a later get materializes a fresh pair
        let pair = store.twin_get("u-1234").await.unwrap();
        assert_eq!(pair.reported.version, 1);
        assert!(pair.reported.doc.is_empty());
    }

    #[tokio::test]
    async fn test_update_last_seen() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.device_upsert("u-1234", None, None).await.unwrap();
        store.device_update_last_seen("u-1234").await.unwrap();
        let record = store.device_get("u-1234").await.unwrap().unwrap();
        assert!(record.meta.get("lastSeen").is_some());
    }
}
