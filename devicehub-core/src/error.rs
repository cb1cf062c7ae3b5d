use thiserror::Error;

/// Main hub error type that encompasses all possible errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identity store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound("no matching row".to_string())
            }
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Duplicate(msg.unwrap_or_else(|| "constraint violation".to_string()))
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Certificate authority errors
#[derive(Debug, Error)]
pub enum CaError {
    #[error("Root CA not available: {0}")]
    NoRootCa(String),

    #[error("Invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("CSR subject CN does not match device UUID: {0}")]
    CsrCnMismatch(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Certificate storage failed: {0}")]
    Storage(String),
}

/// MQTT client errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Topic validation error: {0}")]
    TopicValidation(String),

    #[error("Message parsing error: {0}")]
    MessageParsing(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,
}

/// Application gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token inactive")]
    TokenInactive,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Method call timed out after {0} seconds")]
    MethodTimeout(u64),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// IPC bus errors
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for certificate authority operations
pub type CaResult<T> = Result<T, CaError>;

/// Result type alias for MQTT operations
pub type MqttResult<T> = Result<T, MqttError>;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type alias for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Stable wire-level error codes.
///
/// These strings travel on `.../rejected` topics and in HTTP/WebSocket error
/// bodies and must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidUuid,
    InvalidCsr,
    CsrCnMismatch,
    MissingCsrPem,
    UuidMismatch,
    BadRequest,
    UuidNotWhitelisted,
    UuidAlreadyUsed,
    InvalidToken,
    TokenExpired,
    TokenInactive,
    NoRootCa,
    NotFound,
    Duplicate,
    DbUnavailable,
    SigningFailed,
    IssueFailed,
    InternalError,
    MethodTimeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidUuid => "invalid_uuid",
            ErrorCode::InvalidCsr => "invalid_csr",
            ErrorCode::CsrCnMismatch => "csr_cn_mismatch",
            ErrorCode::MissingCsrPem => "missing_csrPem",
            ErrorCode::UuidMismatch => "uuid_mismatch",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::UuidNotWhitelisted => "uuid_not_whitelisted",
            ErrorCode::UuidAlreadyUsed => "uuid_already_used",
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::TokenInactive => "token_inactive",
            ErrorCode::NoRootCa => "no_root_ca",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Duplicate => "duplicate",
            ErrorCode::DbUnavailable => "db_unavailable",
            ErrorCode::SigningFailed => "signing_failed",
            ErrorCode::IssueFailed => "issue_failed",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::MethodTimeout => "method_timeout",
        }
    }

    /// HTTP status the admin-facing APIs map this code onto.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidUuid
            | ErrorCode::InvalidCsr
            | ErrorCode::CsrCnMismatch
            | ErrorCode::MissingCsrPem
            | ErrorCode::UuidMismatch
            | ErrorCode::BadRequest => 400,
            ErrorCode::InvalidToken | ErrorCode::TokenExpired | ErrorCode::TokenInactive => 401,
            ErrorCode::UuidNotWhitelisted | ErrorCode::UuidAlreadyUsed => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Duplicate => 409,
            ErrorCode::MethodTimeout => 504,
            ErrorCode::NoRootCa
            | ErrorCode::DbUnavailable
            | ErrorCode::SigningFailed
            | ErrorCode::IssueFailed
            | ErrorCode::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CaError {
    /// The wire code a device sees when this failure reaches a rejected topic.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            CaError::NoRootCa(_) => ErrorCode::NoRootCa,
            CaError::InvalidCsr(_) => ErrorCode::InvalidCsr,
            CaError::CsrCnMismatch(_) => ErrorCode::CsrCnMismatch,
            CaError::SigningFailed(_) | CaError::KeyGeneration(_) | CaError::Storage(_) => {
                ErrorCode::SigningFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let store_error = StoreError::NotFound("device xyz".to_string());
        let hub_error: HubError = store_error.into();
        match hub_error {
            HubError::Store(_) => {}
            _ => panic!("Error conversion failed"),
        }
    }

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(ErrorCode::CsrCnMismatch.as_str(), "csr_cn_mismatch");
        assert_eq!(ErrorCode::MissingCsrPem.as_str(), "missing_csrPem");
        assert_eq!(ErrorCode::UuidAlreadyUsed.as_str(), "uuid_already_used");
        assert_eq!(ErrorCode::MethodTimeout.as_str(), "method_timeout");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::BadRequest.http_status(), 400);
        assert_eq!(ErrorCode::InvalidToken.http_status(), 401);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::Duplicate.http_status(), 409);
        assert_eq!(ErrorCode::MethodTimeout.http_status(), 504);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
    }

    #[test]
    fn test_ca_error_wire_code() {
        let err = CaError::CsrCnMismatch("expected uuid".to_string());
        assert_eq!(err.wire_code(), ErrorCode::CsrCnMismatch);
        let err = CaError::KeyGeneration("rsa".to_string());
        assert_eq!(err.wire_code(), ErrorCode::SigningFailed);
    }
}
