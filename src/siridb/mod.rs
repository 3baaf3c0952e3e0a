/// SiriDB client used behind `BackendClient`
///
/// A client keeps one `ServerConnection` per configured address. Each address
/// gets a keep-alive task that reconnects while the server is down and pings
/// it while it is up. Requests go to the first connected server in the
/// configured order.
pub mod connection;
pub mod protocol;
pub mod qpack;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::address::ServerAddress;
use crate::core::backend::{BackendClient, BackendError, ClientFactory, Credentials};
use crate::core::supervisor::LogSender;
use connection::ServerConnection;
use protocol::request;

/// Interval of the per-server keep-alive loop
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const PING_TIMEOUT: Duration = Duration::from_secs(5);

struct ClientInner {
    credentials: Credentials,
    database: String,
    servers: Vec<Arc<ServerConnection>>,
    closed: AtomicBool,
    auth_error: Mutex<Option<String>>,
    log_tx: LogSender,
}

impl ClientInner {
    fn log(&self, message: String) {
        let _ = self.log_tx.send(message);
    }

    async fn keepalive(self: Arc<Self>, server: Arc<ServerConnection>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            server.refresh();
            if server.is_connected() {
                if let Err(e) = server.ping(PING_TIMEOUT).await {
                    self.log(format!("lost connection to {}: {}", server.address(), e));
                    server.close().await;
                }
                continue;
            }

            match server.open(&self.credentials, &self.database).await {
                Ok(()) => {
                    *lock(&self.auth_error) = None;
                    self.log(format!(
                        "connected to {} as '{}'",
                        server.address(),
                        self.credentials.user
                    ));
                }
                Err(BackendError::Auth(msg)) => {
                    self.log(format!(
                        "authentication as '{}' failed on {}: {}",
                        self.credentials.user,
                        server.address(),
                        msg
                    ));
                    *lock(&self.auth_error) = Some(msg);
                }
                Err(e) => self.log(format!("cannot connect to {}: {}", server.address(), e)),
            }
        }
    }

    /// First connected server in configured order
    fn pick(&self) -> Option<&Arc<ServerConnection>> {
        self.servers.iter().find(|server| {
            server.refresh();
            server.is_connected()
        })
    }

    async fn send(&self, tp: u8, body: &Value, timeout: Duration) -> Result<Value, BackendError> {
        let server = self.pick().ok_or(BackendError::NotConnected)?;
        server.request(tp, body, timeout).await?.into_result()
    }
}

pub struct SiriClient {
    inner: Arc<ClientInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    interval: Duration,
}

impl SiriClient {
    pub fn new(
        credentials: Credentials,
        database: String,
        servers: &[ServerAddress],
        log_tx: LogSender,
    ) -> Self {
        let servers = servers
            .iter()
            .cloned()
            .map(|address| Arc::new(ServerConnection::new(address)))
            .collect();
        Self {
            inner: Arc::new(ClientInner {
                credentials,
                database,
                servers,
                closed: AtomicBool::new(false),
                auth_error: Mutex::new(None),
                log_tx,
            }),
            tasks: Mutex::new(Vec::new()),
            interval: KEEPALIVE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl BackendClient for SiriClient {
    fn connect(&self) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        for server in &self.inner.servers {
            let task = Arc::clone(&self.inner).keepalive(Arc::clone(server), self.interval);
            tasks.push(tokio::spawn(task));
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.pick().is_some()
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return Ok(());
            }
            if let Some(msg) = lock(&self.inner.auth_error).clone() {
                return Err(BackendError::Auth(msg));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::NotConnected);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn query(&self, query: &str, timeout: Duration) -> Result<Value, BackendError> {
        self.inner
            .send(request::QUERY, &json!([query, null]), timeout)
            .await
    }

    async fn insert(&self, data: Value, timeout: Duration) -> Result<Value, BackendError> {
        self.inner.send(request::INSERT, &data, timeout).await
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let servers = self.inner.servers.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for server in servers {
                    server.close().await;
                }
            });
        }
    }
}

impl Drop for SiriClient {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Creates `SiriClient`s that report through the shared log channel
pub struct SiriClientFactory {
    log_tx: LogSender,
    interval: Duration,
}

impl SiriClientFactory {
    pub fn new(log_tx: LogSender) -> Self {
        Self {
            log_tx,
            interval: KEEPALIVE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl ClientFactory for SiriClientFactory {
    fn create(
        &self,
        credentials: &Credentials,
        database: &str,
        servers: &[ServerAddress],
    ) -> Arc<dyn BackendClient> {
        Arc::new(
            SiriClient::new(
                credentials.clone(),
                database.to_string(),
                servers,
                self.log_tx.clone(),
            )
            .with_interval(self.interval),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
