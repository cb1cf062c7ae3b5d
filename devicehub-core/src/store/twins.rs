use super::{now_ts, parse_ts, IdentityStore};
use crate::{StoreError, StoreResult, TwinDocument, TwinPair};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

fn load_document(conn: &Connection, table: &str, uuid: &str) -> StoreResult<TwinDocument> {
    let row: Option<(i64, String, String)> = conn
        .query_row(
            &format!(
                "SELECT version, doc, updated_at FROM {} WHERE device_id = ?1",
                table
            ),
            params![uuid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(StoreError::from)?;

    match row {
        Some((version, doc, updated_at)) => Ok(TwinDocument {
            version: version as u64,
            doc: serde_json::from_str(&doc)
                .map_err(|e| StoreError::InvalidValue(format!("Bad twin document: {}", e)))?,
            updated_at: parse_ts(&updated_at)?,
        }),
        None => Ok(TwinDocument::empty()),
    }
}

/// Shallow-merge a patch into a document: top-level keys overwrite, nulls
/// delete nothing (a null value is stored like any other value).
fn shallow_merge(doc: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        doc.insert(key, value);
    }
}

fn apply_patch(
    conn: &mut Connection,
    table: &str,
    uuid: &str,
    patch: Map<String, Value>,
) -> StoreResult<TwinDocument> {
    let tx = conn.transaction().map_err(StoreError::from)?;

    let current = load_document(&tx, table, uuid)?;
    let mut doc = current.doc;
    shallow_merge(&mut doc, patch);
    let version = current.version + 1;
    let now = now_ts();
    let doc_json = serde_json::to_string(&doc)
        .map_err(|e| StoreError::InvalidValue(format!("Twin document serialization: {}", e)))?;

    tx.execute(
        &format!(
            "INSERT INTO {table} (device_id, version, doc, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (device_id) DO UPDATE SET
                 version = excluded.version,
                 doc = excluded.doc,
                 updated_at = excluded.updated_at"
        ),
        params![uuid, version as i64, doc_json, now],
    )
    .map_err(StoreError::from)?;

    tx.commit().map_err(StoreError::from)?;

    Ok(TwinDocument {
        version,
        doc,
        updated_at: parse_ts(&now)?,
    })
}

fn ensure_document(
    conn: &Connection,
    table: &str,
    uuid: &str,
) -> StoreResult<TwinDocument> {
    let existing: Option<i64> = conn
        .query_row(
            &format!("SELECT version FROM {} WHERE device_id = ?1", table),
            params![uuid],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)?;
    if existing.is_none() {
        conn.execute(
            &format!(
                "INSERT INTO {} (device_id, version, doc, updated_at) VALUES (?1, 1, '{{}}', ?2)",
                table
            ),
            params![uuid, now_ts()],
        )
        .map_err(StoreError::from)?;
    }
    load_document(conn, table, uuid)
}

impl IdentityStore {
    /// Load the twin pair. The pair is created lazily: a get on a device
    /// without twin rows materializes empty documents at version 1.
    pub async fn twin_get(&self, uuid: &str) -> StoreResult<TwinPair> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StoreError::from)?;
            let pair = TwinPair {
                desired: ensure_document(&tx, "twin_desired", &uuid)?,
                reported: ensure_document(&tx, "twin_reported", &uuid)?,
            };
            tx.commit().map_err(StoreError::from)?;
            Ok(pair)
        })
        .await
    }

    /// Shallow-merge a patch into the desired document and advance its
    /// version by exactly one.
    pub async fn twin_set_desired(
        &self,
        uuid: &str,
        patch: Map<String, Value>,
    ) -> StoreResult<TwinDocument> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| apply_patch(conn, "twin_desired", &uuid, patch))
            .await
    }

    /// Shallow-merge a patch into the reported document and advance its
    /// version by exactly one.
    pub async fn twin_set_reported(
        &self,
        uuid: &str,
        patch: Map<String, Value>,
    ) -> StoreResult<TwinDocument> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| apply_patch(conn, "twin_reported", &uuid, patch))
            .await
    }
}
