/// Session management shared by the HTTP and socket transports
///
/// HTTP clients are tracked by a cookie session, socket clients by their
/// connection id. Both stores sit behind async locks; every broker operation
/// may be called concurrently from any connection handler.
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::backend::Credentials;
use crate::core::supervisor::Supervisor;
use crate::error::{GatewayError, GatewayResult};
use crate::utils;

/// Name of the HTTP session cookie
pub const SESSION_COOKIE: &str = "siridbadminsessionid";

/// Identifier of one socket connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cookie-backed session of an HTTP client
#[derive(Debug, Clone)]
pub struct HttpSession {
    pub authenticated: bool,
    pub user: String,
    /// Only kept in multi-user mode
    pub credentials: Option<Credentials>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

/// In-memory cookie session store with sliding expiry
pub struct HttpSessionStore {
    sessions: RwLock<HashMap<String, HttpSession>>,
    max_age: Duration,
}

impl HttpSessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Create an authenticated session and return its identifier
    pub async fn create(&self, user: String, credentials: Option<Credentials>) -> String {
        let id = utils::generate_session_id();
        let now = Instant::now();
        let session = HttpSession {
            authenticated: true,
            user,
            credentials,
            created_at: now,
            last_activity: now,
        };
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    /// Look up a live session and refresh its activity timestamp. Expired
    /// sessions stay in place until `cleanup_expired_sessions` removes them.
    pub async fn get(&self, id: &str) -> Option<HttpSession> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) if session.last_activity.elapsed() <= self.max_age => {
                session.last_activity = Instant::now();
                Some(session.clone())
            }
            _ => None,
        }
    }

    pub async fn destroy(&self, id: &str) -> Option<HttpSession> {
        self.sessions.write().await.remove(id)
    }

    /// Remove expired sessions and hand them back
    pub async fn cleanup_expired_sessions(&self) -> Vec<HttpSession> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.last_activity.elapsed() > self.max_age)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Credentials of authenticated socket connections
#[derive(Default)]
pub struct SocketSessionStore {
    sessions: RwLock<HashMap<ConnectionId, Credentials>>,
}

impl SocketSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store credentials for a connection, returning the ones they replace
    pub async fn insert(&self, id: ConnectionId, credentials: Credentials) -> Option<Credentials> {
        self.sessions.write().await.insert(id, credentials)
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Credentials> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &ConnectionId) -> Option<Credentials> {
        self.sessions.write().await.remove(id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Where a request came from, as far as authentication is concerned
#[derive(Debug, Clone)]
pub enum TransportContext {
    Http {
        session_id: Option<String>,
        /// Value of an `Authorization: Secret <value>` header
        secret: Option<String>,
    },
    Socket {
        connection_id: ConnectionId,
    },
}

impl TransportContext {
    pub fn http(session_id: Option<String>) -> Self {
        TransportContext::Http {
            session_id,
            secret: None,
        }
    }

    pub fn socket(connection_id: ConnectionId) -> Self {
        TransportContext::Socket { connection_id }
    }
}

/// Outcome of a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHandle {
    /// New HTTP session; the transport sets this cookie
    Cookie(String),
    /// Socket connection now authenticated
    Socket(ConnectionId),
    /// Authentication is disabled, nothing was stored
    NotRequired,
}

/// Authentication state reported by `fetch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub user: Option<String>,
}

/// Authentication switches from the configuration
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub require_auth: bool,
    pub multi_user: bool,
    pub secret: Option<String>,
}

pub struct SessionBroker {
    settings: AuthSettings,
    configured: Credentials,
    http: Arc<HttpSessionStore>,
    sockets: SocketSessionStore,
    supervisor: Arc<Supervisor>,
}

impl SessionBroker {
    pub fn new(settings: AuthSettings, cookie_max_age: Duration, supervisor: Arc<Supervisor>) -> Self {
        let configured = supervisor.connection().credentials.clone();
        Self {
            settings,
            configured,
            http: Arc::new(HttpSessionStore::new(cookie_max_age)),
            sockets: SocketSessionStore::new(),
            supervisor,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn http_store(&self) -> Arc<HttpSessionStore> {
        Arc::clone(&self.http)
    }

    pub fn socket_store(&self) -> &SocketSessionStore {
        &self.sockets
    }

    /// Validate credentials against the backend and open a session
    pub async fn login(
        &self,
        credentials: Credentials,
        ctx: &TransportContext,
    ) -> GatewayResult<SessionHandle> {
        if !self.settings.require_auth {
            return Ok(SessionHandle::NotRequired);
        }

        if !self.settings.multi_user && credentials != self.configured {
            return Err(GatewayError::LoginRejected(
                "credentials rejected".to_string(),
            ));
        }

        self.supervisor.authenticate(&credentials).await?;

        match ctx {
            TransportContext::Http { session_id, .. } => {
                if let Some(old) = session_id {
                    self.release(self.http.destroy(old).await.and_then(|s| s.credentials));
                }
                let stored = self.settings.multi_user.then(|| credentials.clone());
                let id = self.http.create(credentials.user.clone(), stored).await;
                info!("HTTP login for user '{}'", credentials.user);
                Ok(SessionHandle::Cookie(id))
            }
            TransportContext::Socket { connection_id } => {
                info!(
                    "Socket login for user '{}' on connection {}",
                    credentials.user, connection_id
                );
                let replaced = self.sockets.insert(connection_id.clone(), credentials).await;
                self.release(replaced);
                Ok(SessionHandle::Socket(connection_id.clone()))
            }
        }
    }

    /// Drop the session of this context; a no-op when there is none
    pub async fn logout(&self, ctx: &TransportContext) {
        match ctx {
            TransportContext::Http { session_id, .. } => {
                if let Some(id) = session_id {
                    self.release(self.http.destroy(id).await.and_then(|s| s.credentials));
                }
            }
            TransportContext::Socket { connection_id } => {
                self.release(self.sockets.remove(connection_id).await);
            }
        }
    }

    /// Report whether the context is authenticated
    pub async fn fetch(&self, ctx: &TransportContext) -> AuthStatus {
        if !self.settings.require_auth {
            return AuthStatus {
                authenticated: true,
                user: Some(self.configured.user.clone()),
            };
        }

        let user = match ctx {
            TransportContext::Http { session_id, secret } => {
                if secret.as_deref().is_some_and(|s| self.secret_matches(s)) {
                    Some(self.configured.user.clone())
                } else {
                    match session_id {
                        Some(id) => self
                            .http
                            .get(id)
                            .await
                            .filter(|s| s.authenticated)
                            .map(|s| s.user),
                        None => None,
                    }
                }
            }
            TransportContext::Socket { connection_id } => {
                self.sockets.get(connection_id).await.map(|c| c.user)
            }
        };

        AuthStatus {
            authenticated: user.is_some(),
            user,
        }
    }

    /// Effective credentials for a request, or `Auth` when unauthenticated
    pub async fn credentials(&self, ctx: &TransportContext) -> GatewayResult<Credentials> {
        if !self.settings.require_auth {
            return Ok(self.configured.clone());
        }

        let session_credentials = match ctx {
            TransportContext::Http { session_id, secret } => {
                if secret.as_deref().is_some_and(|s| self.secret_matches(s)) {
                    return Ok(self.configured.clone());
                }
                match session_id {
                    Some(id) => match self.http.get(id).await {
                        Some(session) if session.authenticated => {
                            Some(session.credentials.unwrap_or_else(|| self.configured.clone()))
                        }
                        _ => None,
                    },
                    None => None,
                }
            }
            TransportContext::Socket { connection_id } => self.sockets.get(connection_id).await,
        };

        match session_credentials {
            Some(credentials) if self.settings.multi_user => Ok(credentials),
            Some(_) => Ok(self.configured.clone()),
            None => Err(GatewayError::auth("not authenticated")),
        }
    }

    /// Socket closed; safe to call for connections that never logged in
    pub async fn on_disconnect(&self, connection_id: &ConnectionId) {
        if let Some(credentials) = self.sockets.remove(connection_id).await {
            debug!("Removed socket session for connection {}", connection_id);
            self.release(Some(credentials));
        }
    }

    /// Expire idle HTTP sessions every quarter of the cookie max age
    pub async fn start_cleanup_task(self: Arc<Self>) {
        let period = (self.http.max_age() / 4).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            let expired = self.http.cleanup_expired_sessions().await;
            if !expired.is_empty() {
                debug!("Cleaned up {} expired HTTP sessions", expired.len());
            }
            for session in expired {
                self.release(session.credentials);
            }
        }
    }

    fn release(&self, credentials: Option<Credentials>) {
        if let Some(credentials) = credentials {
            self.supervisor.release(&credentials);
        }
    }

    fn secret_matches(&self, presented: &str) -> bool {
        match &self.settings.secret {
            Some(expected) => Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes()),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::resolve;
    use crate::core::backend::testing::MockFactory;

    fn broker(settings: AuthSettings, factory: Arc<MockFactory>) -> SessionBroker {
        broker_with_max_age(settings, factory, Duration::from_secs(60))
    }

    fn broker_with_max_age(
        settings: AuthSettings,
        factory: Arc<MockFactory>,
        max_age: Duration,
    ) -> SessionBroker {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            Credentials::new("iris", "siri"),
            "dbtest".to_string(),
            resolve("localhost").unwrap(),
            factory,
            tx,
        )
        .with_handshake_timeout(Duration::from_millis(200));
        SessionBroker::new(settings, max_age, Arc::new(supervisor))
    }

    fn auth_required(multi_user: bool) -> AuthSettings {
        AuthSettings {
            require_auth: true,
            multi_user,
            secret: Some("my_super_secret".to_string()),
        }
    }

    #[tokio::test]
    async fn test_http_store_expiry_and_cleanup() {
        let store = HttpSessionStore::new(Duration::from_millis(20));
        let id = store.create("iris".to_string(), None).await;
        assert!(store.get(&id).await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get(&id).await.is_none());

        store.create("iris".to_string(), None).await;
        store.create("iris".to_string(), None).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        // the first one expired too, lookups leave it for cleanup
        assert_eq!(store.cleanup_expired_sessions().await.len(), 3);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_auth_not_required_always_authenticated() {
        let broker = broker(AuthSettings::default(), Arc::new(MockFactory::default()));

        let contexts = [
            TransportContext::http(None),
            TransportContext::http(Some("bogus".to_string())),
            TransportContext::socket(ConnectionId::new()),
        ];
        for ctx in &contexts {
            let status = broker.fetch(ctx).await;
            assert!(status.authenticated);
            assert_eq!(status.user.as_deref(), Some("iris"));
            assert_eq!(broker.credentials(ctx).await.unwrap(), Credentials::new("iris", "siri"));
        }

        let handle = broker
            .login(Credentials::new("anyone", "x"), &contexts[0])
            .await
            .unwrap();
        assert_eq!(handle, SessionHandle::NotRequired);
        assert_eq!(broker.http_store().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_http_login_logout_round_trip() {
        let broker = broker(auth_required(false), Arc::new(MockFactory::default()));
        let anonymous = TransportContext::http(None);
        let before = broker.fetch(&anonymous).await;
        assert!(!before.authenticated);

        let handle = broker
            .login(Credentials::new("iris", "siri"), &anonymous)
            .await
            .unwrap();
        let cookie = match handle {
            SessionHandle::Cookie(id) => id,
            other => panic!("expected cookie, got {other:?}"),
        };

        let ctx = TransportContext::http(Some(cookie));
        assert!(broker.fetch(&ctx).await.authenticated);

        broker.logout(&ctx).await;
        assert_eq!(broker.fetch(&ctx).await, before);
        assert!(broker.credentials(&ctx).await.is_err());

        // logging out twice is fine
        broker.logout(&ctx).await;
        broker.logout(&anonymous).await;
    }

    #[tokio::test]
    async fn test_socket_login_logout_round_trip() {
        let broker = broker(auth_required(true), Arc::new(MockFactory::default()));
        let ctx = TransportContext::socket(ConnectionId::new());
        let before = broker.fetch(&ctx).await;

        broker
            .login(Credentials::new("alice", "pw"), &ctx)
            .await
            .unwrap();
        assert_eq!(
            broker.credentials(&ctx).await.unwrap(),
            Credentials::new("alice", "pw")
        );

        broker.logout(&ctx).await;
        assert_eq!(broker.fetch(&ctx).await, before);
        assert_eq!(broker.socket_store().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_single_user_mode_rejects_other_users() {
        let broker = broker(auth_required(false), Arc::new(MockFactory::default()));
        let err = broker
            .login(Credentials::new("alice", "pw"), &TransportContext::http(None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::LoginRejected(_)));
        assert_eq!(err.message(), "credentials rejected");

        // a wrong password for the configured user reads the same
        let err = broker
            .login(Credentials::new("iris", "wrong"), &TransportContext::http(None))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "credentials rejected");
    }

    #[tokio::test]
    async fn test_single_user_mode_uses_configured_credentials() {
        let broker = broker(auth_required(false), Arc::new(MockFactory::default()));
        let ctx = TransportContext::socket(ConnectionId::new());
        broker
            .login(Credentials::new("iris", "siri"), &ctx)
            .await
            .unwrap();
        assert_eq!(
            broker.credentials(&ctx).await.unwrap(),
            Credentials::new("iris", "siri")
        );
    }

    #[tokio::test]
    async fn test_backend_rejected_login() {
        let broker = broker(auth_required(true), Arc::new(MockFactory::rejecting(&["mallory"])));
        let ctx = TransportContext::socket(ConnectionId::new());
        let err = broker
            .login(Credentials::new("mallory", "guess"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 422);
        assert!(!broker.fetch(&ctx).await.authenticated);
    }

    #[tokio::test]
    async fn test_secret_authenticates_http_requests() {
        let broker = broker(auth_required(false), Arc::new(MockFactory::default()));

        let good = TransportContext::Http {
            session_id: None,
            secret: Some("my_super_secret".to_string()),
        };
        assert!(broker.fetch(&good).await.authenticated);
        assert!(broker.credentials(&good).await.is_ok());

        let bad = TransportContext::Http {
            session_id: None,
            secret: Some("guess".to_string()),
        };
        assert!(!broker.fetch(&bad).await.authenticated);
        assert!(matches!(
            broker.credentials(&bad).await.unwrap_err(),
            GatewayError::Auth(_)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_removes_only_that_connection() {
        let broker = Arc::new(broker(auth_required(true), Arc::new(MockFactory::default())));
        let leaving = ConnectionId::new();
        broker
            .login(Credentials::new("alice", "pw"), &TransportContext::socket(leaving.clone()))
            .await
            .unwrap();

        let joining = ConnectionId::new();
        let login = {
            let broker = Arc::clone(&broker);
            let ctx = TransportContext::socket(joining.clone());
            tokio::spawn(async move { broker.login(Credentials::new("bob", "pw"), &ctx).await })
        };

        broker.on_disconnect(&leaving).await;
        broker.on_disconnect(&leaving).await;
        login.await.unwrap().unwrap();

        assert!(broker.socket_store().get(&leaving).await.is_none());
        assert_eq!(
            broker.socket_store().get(&joining).await,
            Some(Credentials::new("bob", "pw"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_socket_logins_do_not_cross_talk() {
        let broker = Arc::new(broker(auth_required(true), Arc::new(MockFactory::default())));

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let id = ConnectionId::new();
                    let ctx = TransportContext::socket(id.clone());
                    let creds = Credentials::new(format!("user{i}"), format!("pw{i}"));
                    broker.login(creds.clone(), &ctx).await.unwrap();
                    assert_eq!(broker.credentials(&ctx).await.unwrap(), creds);
                    (id, creds)
                })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(broker.socket_store().session_count().await, 100);
        for (id, creds) in sessions {
            assert_eq!(broker.socket_store().get(&id).await, Some(creds));
        }
    }

    fn closed(factory: &MockFactory, user: &str) -> Vec<bool> {
        factory
            .clients_of(user)
            .iter()
            .map(|c| c.closed.load(std::sync::atomic::Ordering::SeqCst))
            .collect()
    }

    #[tokio::test]
    async fn test_disconnect_closes_user_client_after_last_socket() {
        let factory = Arc::new(MockFactory::default());
        let broker = broker(auth_required(true), Arc::clone(&factory));
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        for id in [&first, &second] {
            broker
                .login(Credentials::new("alice", "pw"), &TransportContext::socket(id.clone()))
                .await
                .unwrap();
        }
        assert_eq!(broker.supervisor.user_client_count(), 1);

        broker.on_disconnect(&first).await;
        assert_eq!(closed(&factory, "alice"), vec![false]);

        broker.on_disconnect(&second).await;
        assert_eq!(broker.supervisor.user_client_count(), 0);
        assert_eq!(closed(&factory, "alice"), vec![true]);
    }

    #[tokio::test]
    async fn test_logout_and_relogin_release_user_clients() {
        let factory = Arc::new(MockFactory::default());
        let broker = broker(auth_required(true), Arc::clone(&factory));

        let cookie = match broker
            .login(Credentials::new("alice", "pw"), &TransportContext::http(None))
            .await
            .unwrap()
        {
            SessionHandle::Cookie(id) => id,
            other => panic!("expected cookie, got {other:?}"),
        };
        let ctx = TransportContext::http(Some(cookie));

        // logging in as someone else on the same cookie drops alice's client
        broker.login(Credentials::new("bob", "pw"), &ctx).await.unwrap();
        assert_eq!(closed(&factory, "alice"), vec![true]);

        let socket = TransportContext::socket(ConnectionId::new());
        broker.login(Credentials::new("carol", "pw"), &socket).await.unwrap();
        broker.logout(&socket).await;
        assert_eq!(closed(&factory, "carol"), vec![true]);

        assert_eq!(broker.supervisor.user_client_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_http_sessions_release_user_clients() {
        let factory = Arc::new(MockFactory::default());
        let broker = Arc::new(broker_with_max_age(
            auth_required(true),
            Arc::clone(&factory),
            Duration::from_millis(20),
        ));
        broker
            .login(Credentials::new("alice", "pw"), &TransportContext::http(None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let gc = tokio::spawn(Arc::clone(&broker).start_cleanup_task());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broker.supervisor.user_client_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "user client not released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gc.abort();

        assert_eq!(broker.http_store().session_count().await, 0);
        assert_eq!(closed(&factory, "alice"), vec![true]);
    }
}
