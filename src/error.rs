/// Unified error handling for the SiriDB gateway
///
/// Every failure the gateway can observe is expressed as a [`GatewayError`].
/// Startup errors (configuration, address parsing, handshake) are fatal and
/// end the process with exit code 1; per-request errors are converted into a
/// status code plus a JSON body and never take the process down.

use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Login rejected by the backend (422)
pub const STATUS_LOGIN_REJECTED: u16 = 422;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed address list or other startup input
    #[error("Parse error: {0}")]
    Parse(String),

    /// Backend reachable but the metadata handshake answer is malformed
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Backend unreachable; retried by the supervisor, never fatal on its own
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Unauthenticated access to a protected operation
    #[error("Authentication required: {0}")]
    Auth(String),

    /// Credentials rejected during login
    #[error("Login failed: {0}")]
    LoginRejected(String),

    /// Operation attempted while the backend is not connected
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected a query
    #[error("Query error: {0}")]
    Query(String),

    /// Backend rejected an insert
    #[error("Insert error: {0}")]
    Insert(String),

    /// Backend did not answer in time
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Request body could not be understood
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request body in a content type the gateway does not speak
    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    /// Unknown route or socket event
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener or socket errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        GatewayError::Unavailable(message.into())
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        GatewayError::Auth(message.into())
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        GatewayError::BadRequest(message.into())
    }

    pub fn handshake<S: Into<String>>(message: S) -> Self {
        GatewayError::Handshake(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        GatewayError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }

    /// Status code reported to the caller, identical for both transports
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Auth(_) => 401,
            GatewayError::LoginRejected(_) => STATUS_LOGIN_REJECTED,
            GatewayError::Unavailable(_) | GatewayError::Connectivity(_) => 503,
            GatewayError::Timeout { .. } => 504,
            GatewayError::BadRequest(_) | GatewayError::Parse(_) => 400,
            GatewayError::UnsupportedMediaType(_) => 415,
            GatewayError::NotFound(_) => 404,
            GatewayError::Query(_)
            | GatewayError::Insert(_)
            | GatewayError::Handshake(_)
            | GatewayError::Config(_)
            | GatewayError::Network(_)
            | GatewayError::Internal { .. } => 500,
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Parse(_) => "parse_error",
            GatewayError::Handshake(_) => "handshake_error",
            GatewayError::Connectivity(_) => "connectivity_error",
            GatewayError::Auth(_) => "auth_error",
            GatewayError::LoginRejected(_) => "auth_error",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::Query(_) => "query_error",
            GatewayError::Insert(_) => "insert_error",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::UnsupportedMediaType(_) => "unsupported_media_type",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Config(_) => "config_error",
            GatewayError::Network(_) => "network_error",
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    /// Message without the variant prefix, as placed in `error_msg`
    pub fn message(&self) -> String {
        match self {
            GatewayError::Parse(m)
            | GatewayError::Handshake(m)
            | GatewayError::Connectivity(m)
            | GatewayError::Auth(m)
            | GatewayError::LoginRejected(m)
            | GatewayError::Unavailable(m)
            | GatewayError::Query(m)
            | GatewayError::Insert(m)
            | GatewayError::BadRequest(m)
            | GatewayError::UnsupportedMediaType(m)
            | GatewayError::NotFound(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// JSON body describing the error
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "error_msg": self.message(),
        })
    }

    /// Check if this error is recoverable (the process keeps serving)
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            GatewayError::Parse(_)
                | GatewayError::Handshake(_)
                | GatewayError::Config(_)
                | GatewayError::Internal { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GatewayError::Parse(_)
            | GatewayError::Handshake(_)
            | GatewayError::Config(_)
            | GatewayError::Internal { .. } => ErrorSeverity::Critical,
            GatewayError::Connectivity(_)
            | GatewayError::Unavailable(_)
            | GatewayError::Timeout { .. }
            | GatewayError::Network(_) => ErrorSeverity::Warning,
            GatewayError::Auth(_)
            | GatewayError::LoginRejected(_)
            | GatewayError::BadRequest(_)
            | GatewayError::UnsupportedMediaType(_)
            | GatewayError::NotFound(_) => ErrorSeverity::Info,
            GatewayError::Query(_) | GatewayError::Insert(_) => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that end the process
    Critical,
    /// Errors that affect a request but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about caller mistakes
    Info,
}
