//! # Bridge Error Types
//!
//! A single error enum covers the whole core. Variants follow the failure
//! taxonomy of the bridge: configuration, validation, protocol, network,
//! storage and local-platform failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for bridge operations
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Matrix error code the homeserver uses for rate limiting
pub const ERRCODE_LIMIT_EXCEEDED: &str = "M_LIMIT_EXCEEDED";

/// Bridge error
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Missing credentials, URL or other required settings
    #[error("configuration error: {0}")]
    Config(String),

    /// Input rejected before any network call
    #[error("validation error: {0}")]
    Validation(String),

    /// Non-2xx response from the homeserver
    #[error("matrix API error (status {status}, {errcode}): {message}")]
    Protocol {
        status: u16,
        errcode: String,
        message: String,
    },

    /// The homeserver rejected the call with `M_LIMIT_EXCEEDED`
    #[error("rate limited by homeserver (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Connection failure, timeout or broken response stream
    #[error("network error during {operation}: {message}")]
    Network { operation: String, message: String },

    /// JSON encoding/decoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Trusted key-value store failure
    #[error("store error: {0}")]
    Store(String),

    /// Local chat server failure
    #[error("local platform error: {0}")]
    Platform(String),

    /// Rate limiter wait hit its deadline or was cancelled
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A mapping write would overwrite an existing, different mapping
    #[error("mapping conflict: {0}")]
    Conflict(String),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    /// Wrap a transport error with the operation it interrupted
    pub fn network(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Network {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Build the error for a non-2xx homeserver response.
    ///
    /// 429 + `M_LIMIT_EXCEEDED` becomes [`BridgeError::RateLimited`].
    pub fn from_response(
        status: u16,
        errcode: Option<String>,
        message: Option<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let errcode = errcode.unwrap_or_else(|| "M_UNKNOWN".to_string());
        if status == 429 && errcode == ERRCODE_LIMIT_EXCEEDED {
            return Self::RateLimited { retry_after_ms };
        }
        Self::Protocol {
            status,
            errcode,
            message: message.unwrap_or_default(),
        }
    }

    /// Remote error code, when this is a protocol error
    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Protocol { errcode, .. } => Some(errcode.as_str()),
            Self::RateLimited { .. } => Some(ERRCODE_LIMIT_EXCEEDED),
            _ => None,
        }
    }

    /// HTTP status, when this is a protocol error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Protocol { status: 404, .. })
    }

    fn http_status(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Store(_) | Self::Platform(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Validation(_) | Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Protocol { .. } | Self::Network { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    fn matrix_errcode(&self) -> &str {
        match self {
            Self::Validation(_) => "M_INVALID_PARAM",
            Self::Serialization(_) => "M_NOT_JSON",
            Self::RateLimited { .. } => ERRCODE_LIMIT_EXCEEDED,
            _ => "M_UNKNOWN",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = Json(json!({
            "errcode": self.matrix_errcode(),
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        let operation = if e.is_timeout() {
            "request (timeout)"
        } else if e.is_connect() {
            "connect"
        } else {
            "request"
        };
        Self::network(operation, e)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}
