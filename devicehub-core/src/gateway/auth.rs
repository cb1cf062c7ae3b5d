//! Bearer-token authentication for the gateway.
//!
//! Every `/api` request carries `Authorization: Bearer <token>`; WebSocket
//! clients pass the same secret as `?token=`. Checks hit the token table,
//! enforce the active flag and expiry, and touch `last_used`.

use super::GatewayState;
use crate::store::TokenValidation;
use crate::{ErrorCode, TokenIdentity};

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Validate a bearer secret against the store. The distinction between
/// invalid, expired and inactive is surfaced to the caller.
pub async fn validate_token(
    state: &GatewayState,
    secret: &str,
) -> Result<TokenIdentity, ErrorCode> {
    match state.store.token_validate(secret).await {
        Ok(TokenValidation::Valid(token)) => {
            if let Err(e) = state.store.token_touch_last_used(token.id).await {
                debug!("last_used update failed for token {}: {}", token.id, e);
            }
            Ok(TokenIdentity {
                id: token.id,
                name: token.name,
                scopes: token.scopes,
            })
        }
        Ok(TokenValidation::Invalid) => Err(ErrorCode::InvalidToken),
        Ok(TokenValidation::Expired) => Err(ErrorCode::TokenExpired),
        Ok(TokenValidation::Inactive) => Err(ErrorCode::TokenInactive),
        Err(_) => Err(ErrorCode::DbUnavailable),
    }
}

/// Middleware guarding the REST surface.
pub async fn require_token(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let secret = bearer_secret(&request);
    let Some(secret) = secret else {
        return unauthorized(ErrorCode::InvalidToken);
    };

    match validate_token(&state, &secret).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(code @ ErrorCode::DbUnavailable) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": code.as_str() })),
        )
            .into_response(),
        Err(code) => unauthorized(code),
    }
}

fn unauthorized(code: ErrorCode) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": code.as_str() })),
    )
        .into_response()
}

/// Pull the secret from the Authorization header, falling back to the
/// `token` query parameter.
fn bearer_secret(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(secret) = value.strip_prefix("Bearer ") {
                return Some(secret.trim().to_string());
            }
        }
    }
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use crate::mqtt_client::MockMqttClient;
    use crate::store::IdentityStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn test_state() -> Arc<GatewayState> {
        GatewayState::new(
            IdentityStore::open_in_memory().unwrap(),
            Arc::new(MockMqttClient::new()),
            IpcClient::new("/tmp/devicehub-test-unused.sock"),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_valid_token_touches_last_used() {
        let state = test_state();
        state
            .store
            .token_create("app", "secret-1", &[], None)
            .await
            .unwrap();

        let identity = validate_token(&state, "secret-1").await.unwrap();
        assert_eq!(identity.name, "app");

        match state.store.token_validate("secret-1").await.unwrap() {
            crate::store::TokenValidation::Valid(token) => assert!(token.last_used.is_some()),
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_expired_inactive() {
        let state = test_state();
        assert_eq!(
            validate_token(&state, "missing").await.unwrap_err(),
            ErrorCode::InvalidToken
        );

        state
            .store
            .token_create(
                "old",
                "expired-token",
                &[],
                Some(Utc::now() - ChronoDuration::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(
            validate_token(&state, "expired-token").await.unwrap_err(),
            ErrorCode::TokenExpired
        );

        let token = state
            .store
            .token_create("off", "inactive-token", &[], None)
            .await
            .unwrap();
        state.store.token_set_active(token.id, false).await.unwrap();
        assert_eq!(
            validate_token(&state, "inactive-token").await.unwrap_err(),
            ErrorCode::TokenInactive
        );
    }
}
