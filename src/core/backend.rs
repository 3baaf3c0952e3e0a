/// Narrow interface between the gateway core and the backend client library
///
/// The core never speaks the cluster wire protocol itself; it holds
/// `Arc<dyn BackendClient>` handles produced by a `ClientFactory`.
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::core::ServerAddress;
use crate::error::GatewayError;

/// User/password pair used to authenticate against the cluster
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(user: U, password: P) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Errors reported by a backend client
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("not connected to any server")]
    NotConnected,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection lost while waiting for a response")]
    ConnectionLost,

    #[error("{0}")]
    Query(String),

    #[error("{0}")]
    Insert(String),

    #[error("{0}")]
    Server(String),

    #[error("{0}")]
    Pool(String),

    #[error("{0}")]
    UserAccess(String),

    #[error("{0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotConnected | BackendError::ConnectionLost => {
                GatewayError::Unavailable(err.to_string())
            }
            BackendError::Server(msg) | BackendError::Pool(msg) => GatewayError::Unavailable(msg),
            BackendError::Io(msg) => GatewayError::Connectivity(msg),
            BackendError::Timeout(after) => GatewayError::timeout(format!("backend request ({after:?})")),
            BackendError::Query(msg) => GatewayError::Query(msg),
            BackendError::Insert(msg) => GatewayError::Insert(msg),
            BackendError::UserAccess(msg) | BackendError::Auth(msg) => GatewayError::Auth(msg),
            BackendError::Protocol(msg) => GatewayError::internal(msg),
        }
    }
}

/// One logical client bound to a fixed set of credentials
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Start connecting in the background; returns immediately
    fn connect(&self);

    /// Whether at least one server connection is authenticated and usable
    fn is_connected(&self) -> bool;

    /// Wait until connected; fails early with `Auth` when the credentials were rejected
    async fn wait_connected(&self, timeout: Duration) -> Result<(), BackendError>;

    async fn query(&self, query: &str, timeout: Duration) -> Result<Value, BackendError>;

    async fn insert(&self, data: Value, timeout: Duration) -> Result<Value, BackendError>;

    /// Close all connections and stop reconnecting (idempotent)
    fn close(&self);
}

/// Creates clients for arbitrary credentials against the configured cluster
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        credentials: &Credentials,
        database: &str,
        servers: &[ServerAddress],
    ) -> std::sync::Arc<dyn BackendClient>;
}
