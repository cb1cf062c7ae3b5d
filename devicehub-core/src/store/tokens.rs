use super::{now_ts, parse_ts, IdentityStore};
use crate::{ApiToken, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

/// Outcome of an API token check
#[derive(Debug, Clone)]
pub enum TokenValidation {
    Valid(ApiToken),
    Invalid,
    Expired,
    Inactive,
}

fn token_from_row(
    row: &Row<'_>,
) -> rusqlite::Result<(
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_token(
    (id, name, token, scopes, created_at, last_used, expires_at, active): (
        i64,
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        i64,
    ),
) -> StoreResult<ApiToken> {
    Ok(ApiToken {
        id,
        name,
        token,
        scopes: serde_json::from_str(&scopes).unwrap_or_default(),
        created_at: parse_ts(&created_at)?,
        last_used: last_used.as_deref().map(parse_ts).transpose()?,
        expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
        active: active != 0,
    })
}

const SELECT_COLUMNS: &str = "id, name, token, scopes, created_at, last_used, expires_at, active";

impl IdentityStore {
    /// Check a bearer secret against the token table, enforcing the active
    /// flag and expiry.
    pub async fn token_validate(&self, secret: &str) -> StoreResult<TokenValidation> {
        let secret = secret.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM api_tokens WHERE token = ?1", SELECT_COLUMNS),
                    params![secret],
                    token_from_row,
                )
                .optional()
                .map_err(StoreError::from)?;

            let Some(row) = row else {
                return Ok(TokenValidation::Invalid);
            };
            let token = into_token(row)?;

            if !token.active {
                return Ok(TokenValidation::Inactive);
            }
            if let Some(expires_at) = token.expires_at {
                if expires_at <= Utc::now() {
                    return Ok(TokenValidation::Expired);
                }
            }
            Ok(TokenValidation::Valid(token))
        })
        .await
    }

    pub async fn token_touch_last_used(&self, id: i64) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE api_tokens SET last_used = ?1 WHERE id = ?2",
                params![now_ts(), id],
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    pub async fn token_create(
        &self,
        name: &str,
        secret: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<ApiToken> {
        let name = name.to_string();
        let secret = secret.to_string();
        let scopes_json = serde_json::to_string(scopes)
            .map_err(|e| StoreError::InvalidValue(format!("Bad scopes: {}", e)))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO api_tokens (name, token, scopes, created_at, expires_at, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![
                    name,
                    secret,
                    scopes_json,
                    now_ts(),
                    expires_at.map(|dt| dt.to_rfc3339())
                ],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Duplicate(_) => StoreError::Duplicate("token secret".to_string()),
                other => other,
            })?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM api_tokens WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                token_from_row,
            )
            .map_err(StoreError::from)
            .and_then(into_token)
        })
        .await
    }

    pub async fn token_set_active(&self, id: i64, active: bool) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE api_tokens SET active = ?1 WHERE id = ?2",
                    params![active as i64, id],
                )
                .map_err(StoreError::from)?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("token {}", id)));
            }
            Ok(())
        })
        .await
    }
}
