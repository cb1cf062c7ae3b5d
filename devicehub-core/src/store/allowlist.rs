use super::{now_ts, parse_ts, IdentityStore};
use crate::{AllowlistEntry, StoreError, StoreResult};
use rusqlite::{params, OptionalExtension, Row};

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(String, Option<String>, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_entry(
    (uuid, note, created_at, used_at): (String, Option<String>, String, Option<String>),
) -> StoreResult<AllowlistEntry> {
    Ok(AllowlistEntry {
        uuid,
        note,
        created_at: parse_ts(&created_at)?,
        used_at: used_at.as_deref().map(parse_ts).transpose()?,
    })
}

impl IdentityStore {
    /// Look up an allow-list entry. `None` means the UUID is not whitelisted.
    pub async fn allowlist_check(&self, uuid: &str) -> StoreResult<Option<AllowlistEntry>> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT uuid, note, created_at, used_at FROM uuid_whitelist WHERE uuid = ?1",
                    params![uuid],
                    entry_from_row,
                )
                .optional()
                .map_err(StoreError::from)?;
            row.map(into_entry).transpose()
        })
        .await
    }

    /// Consume an allow-list entry. Idempotent: marking an already-used
    /// entry succeeds and leaves the original timestamp in place.
    pub async fn allowlist_mark_used(&self, uuid: &str) -> StoreResult<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE uuid_whitelist SET used_at = COALESCE(used_at, ?1) WHERE uuid = ?2",
                    params![now_ts(), uuid],
                )
                .map_err(StoreError::from)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("allow-list entry {}", uuid)));
            }
            Ok(())
        })
        .await
    }

    pub async fn allowlist_add(&self, uuid: &str, note: Option<&str>) -> StoreResult<AllowlistEntry> {
        let uuid = uuid.to_string();
        let note = note.map(|n| n.to_string());
        self.with_conn(move |conn| {
            let created_at = now_ts();
            conn.execute(
                "INSERT INTO uuid_whitelist (uuid, note, created_at, used_at) VALUES (?1, ?2, ?3, NULL)",
                params![uuid, note, created_at],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Duplicate(_) => {
                    StoreError::Duplicate(format!("allow-list entry {}", uuid))
                }
                other => other,
            })?;
            into_entry((uuid, note, created_at, None))
        })
        .await
    }

    pub async fn allowlist_remove(&self, uuid: &str) -> StoreResult<()> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM uuid_whitelist WHERE uuid = ?1", params![uuid])
                .map_err(StoreError::from)?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("allow-list entry {}", uuid)));
            }
            Ok(())
        })
        .await
    }

    pub async fn allowlist_list(&self) -> StoreResult<Vec<AllowlistEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT uuid, note, created_at, used_at FROM uuid_whitelist ORDER BY created_at",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([], entry_from_row)
                .map_err(StoreError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            rows.into_iter().map(into_entry).collect()
        })
        .await
    }
}
