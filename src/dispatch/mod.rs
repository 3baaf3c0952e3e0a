/// Transport-neutral gateway operations
///
/// Both the HTTP handlers and the socket event loop turn their input into an
/// `Operation`, hand it to `Dispatcher::dispatch` and frame the returned
/// `Reply` in their own way.
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::backend::Credentials;
use crate::core::session::{SessionBroker, SessionHandle, TransportContext};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::supervisor::Supervisor;
use crate::error::{ErrorSeverity, GatewayError, GatewayResult};

/// Body of a login request
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Body of a query request; `timeout` is in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Operation {
    DbInfo,
    AuthFetch,
    AuthLogin(LoginRequest),
    AuthLogout,
    Query(QueryRequest),
    /// Series map forwarded verbatim
    Insert(Value),
}

impl Operation {
    /// Build an operation from a socket event name and its payload
    pub fn from_event(event: &str, data: Value) -> GatewayResult<Self> {
        match event {
            "db-info" => Ok(Operation::DbInfo),
            "auth fetch" => Ok(Operation::AuthFetch),
            "auth logout" => Ok(Operation::AuthLogout),
            "auth login" => serde_json::from_value(data)
                .map(Operation::AuthLogin)
                .map_err(|e| GatewayError::bad_request(format!("invalid login request: {e}"))),
            "query" => serde_json::from_value(data)
                .map(Operation::Query)
                .map_err(|e| GatewayError::bad_request(format!("invalid query request: {e}"))),
            "insert" => Ok(Operation::Insert(data)),
            other => Err(GatewayError::NotFound(format!("unknown event '{other}'"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::DbInfo => "db-info",
            Operation::AuthFetch => "auth fetch",
            Operation::AuthLogin(_) => "auth login",
            Operation::AuthLogout => "auth logout",
            Operation::Query(_) => "query",
            Operation::Insert(_) => "insert",
        }
    }
}

/// What the transport should do with the client's session after a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Unchanged,
    /// Set the session cookie to this id
    Set(String),
    /// Expire the session cookie
    Clear,
}

/// Transport-neutral result: status code plus JSON payload
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub payload: Value,
    pub session: SessionChange,
}

impl Reply {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: 200,
            payload,
            session: SessionChange::Unchanged,
        }
    }

    pub fn error(err: &GatewayError) -> Self {
        Self {
            status: err.status_code(),
            payload: err.to_payload(),
            session: SessionChange::Unchanged,
        }
    }

    fn with_session(mut self, session: SessionChange) -> Self {
        self.session = session;
        self
    }
}

pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    broker: Arc<SessionBroker>,
    shutdown: Arc<ShutdownCoordinator>,
    query_timeout: Duration,
    insert_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        supervisor: Arc<Supervisor>,
        broker: Arc<SessionBroker>,
        shutdown: Arc<ShutdownCoordinator>,
        query_timeout: Duration,
        insert_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            broker,
            shutdown,
            query_timeout,
            insert_timeout,
        }
    }

    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.broker
    }

    /// Run one operation; errors are folded into the reply
    pub async fn dispatch(&self, ctx: &TransportContext, op: Operation) -> Reply {
        let name = op.name();
        match self.execute(ctx, op).await {
            Ok(reply) => {
                debug!("{} -> {}", name, reply.status);
                reply
            }
            Err(e) => {
                match e.severity() {
                    ErrorSeverity::Critical => error!("{} failed: {}", name, e),
                    ErrorSeverity::Error | ErrorSeverity::Warning => warn!("{} failed: {}", name, e),
                    ErrorSeverity::Info => debug!("{} rejected: {}", name, e),
                }
                Reply::error(&e)
            }
        }
    }

    async fn execute(&self, ctx: &TransportContext, op: Operation) -> GatewayResult<Reply> {
        if !self.shutdown.is_running() {
            return Err(GatewayError::unavailable("server is shutting down"));
        }

        match op {
            Operation::DbInfo => self.db_info(ctx).await,
            Operation::AuthFetch => Ok(self.auth_fetch(ctx).await),
            Operation::AuthLogin(request) => self.auth_login(ctx, request).await,
            Operation::AuthLogout => Ok(self.auth_logout(ctx).await),
            Operation::Query(request) => self.query(ctx, request).await,
            Operation::Insert(data) => self.insert(ctx, data).await,
        }
    }

    async fn db_info(&self, ctx: &TransportContext) -> GatewayResult<Reply> {
        self.broker.credentials(ctx).await?;
        let info = self.supervisor.db_info()?;
        let payload = serde_json::to_value(info)
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        Ok(Reply::ok(payload))
    }

    async fn auth_fetch(&self, ctx: &TransportContext) -> Reply {
        let status = self.broker.fetch(ctx).await;
        Reply::ok(json!({
            "authenticated": status.authenticated,
            "user": status.user,
            "auth_required": self.broker.settings().require_auth,
        }))
    }

    async fn auth_login(&self, ctx: &TransportContext, request: LoginRequest) -> GatewayResult<Reply> {
        let credentials = Credentials::new(request.username, request.password);
        let handle = self.broker.login(credentials.clone(), ctx).await?;

        let (user, session) = match handle {
            SessionHandle::Cookie(id) => (credentials.user, SessionChange::Set(id)),
            SessionHandle::Socket(_) => (credentials.user, SessionChange::Unchanged),
            SessionHandle::NotRequired => (
                self.supervisor.connection().credentials.user.clone(),
                SessionChange::Unchanged,
            ),
        };
        info!("User '{}' logged in", user);
        Ok(Reply::ok(json!({ "user": user })).with_session(session))
    }

    async fn auth_logout(&self, ctx: &TransportContext) -> Reply {
        self.broker.logout(ctx).await;
        let session = match ctx {
            TransportContext::Http { .. } => SessionChange::Clear,
            TransportContext::Socket { .. } => SessionChange::Unchanged,
        };
        Reply::ok(json!({ "user": null })).with_session(session)
    }

    async fn query(&self, ctx: &TransportContext, request: QueryRequest) -> GatewayResult<Reply> {
        let credentials = self.broker.credentials(ctx).await?;
        let timeout = match request.timeout {
            None => self.query_timeout,
            Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs)
                .map_err(|_| GatewayError::bad_request(format!("invalid query timeout: {secs}")))?,
            Some(secs) => {
                return Err(GatewayError::bad_request(format!("invalid query timeout: {secs}")))
            }
        };
        if request.query.trim().is_empty() {
            return Err(GatewayError::bad_request("query cannot be empty"));
        }

        self.ensure_connected()?;
        let client = self.supervisor.client_for(&credentials).await?;
        let result = client.query(&request.query, timeout).await?;
        Ok(Reply::ok(result))
    }

    async fn insert(&self, ctx: &TransportContext, data: Value) -> GatewayResult<Reply> {
        let credentials = self.broker.credentials(ctx).await?;

        self.ensure_connected()?;
        let client = self.supervisor.client_for(&credentials).await?;
        let result = client.insert(data, self.insert_timeout).await?;
        Ok(Reply::ok(result))
    }

    fn ensure_connected(&self) -> GatewayResult<()> {
        if self.supervisor.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::unavailable("not connected to SiriDB"))
        }
    }
}
