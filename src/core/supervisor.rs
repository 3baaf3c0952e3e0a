/// Supervision of the single logical connection to the SiriDB cluster
///
/// The supervisor starts the backend client, waits (forever, on a fixed
/// interval) until it reports connected, then runs one metadata handshake.
/// A malformed handshake answer means the backend speaks something we do not
/// understand, which is fatal for the whole process.
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::backend::{BackendClient, BackendError, ClientFactory, Credentials};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::ServerAddress;
use crate::error::{GatewayError, GatewayResult};

/// Fixed delay between connection checks while the cluster is unreachable
pub const RETRY_CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout for the post-connect handshake and for login probes
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub const HANDSHAKE_QUERY: &str = "show time_precision, version";

/// How long a request waits for a reconnecting per-user client
pub const USER_CLIENT_WAIT: Duration = Duration::from_secs(2);

/// Trivial authenticated query used to validate login credentials
pub const LOGIN_PROBE_QUERY: &str = "show who_am_i";

/// Sender half of the backend log channel
pub type LogSender = mpsc::UnboundedSender<String>;

/// Cluster metadata learned during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbInfo {
    pub dbname: String,
    pub time_precision: String,
    pub version: String,
    pub http_server: String,
}

/// Credentials, database and address list of the process-wide connection
pub struct BackendConnection {
    pub credentials: Credentials,
    pub database: String,
    pub addresses: Vec<ServerAddress>,
    client: Arc<dyn BackendClient>,
}

impl BackendConnection {
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn client(&self) -> Arc<dyn BackendClient> {
        Arc::clone(&self.client)
    }
}

struct UserClient {
    client: Arc<dyn BackendClient>,
    /// Sessions currently holding this client
    sessions: usize,
}

pub struct Supervisor {
    connection: BackendConnection,
    factory: Arc<dyn ClientFactory>,
    info: RwLock<Option<DbInfo>>,
    /// Multi-user clients, one per set of credentials held by live sessions
    user_clients: Mutex<HashMap<Credentials, UserClient>>,
    retry_interval: Duration,
    handshake_timeout: Duration,
    log_tx: LogSender,
}

impl Supervisor {
    pub fn new(
        credentials: Credentials,
        database: String,
        addresses: Vec<ServerAddress>,
        factory: Arc<dyn ClientFactory>,
        log_tx: LogSender,
    ) -> Self {
        let client = factory.create(&credentials, &database, &addresses);
        Self {
            connection: BackendConnection {
                credentials,
                database,
                addresses,
                client,
            },
            factory,
            info: RwLock::new(None),
            user_clients: Mutex::new(HashMap::new()),
            retry_interval: RETRY_CONNECT_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            log_tx,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn connection(&self) -> &BackendConnection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Connect, wait for the cluster, handshake. Never returns an error: a
    /// failed handshake triggers a fatal shutdown, an interrupt ends the wait.
    pub async fn run(&self, shutdown: &ShutdownCoordinator) {
        self.connection.client.connect();

        while !self.connection.is_connected() {
            self.log(format!(
                "not connected to SiriDB, try again in {} seconds",
                self.retry_interval.as_secs_f64()
            ));
            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = shutdown.wait() => return,
            }
        }

        match self.handshake().await {
            Ok(info) => {
                info!(
                    "Connected to SiriDB database '{}' (version {}, time precision {})",
                    info.dbname, info.version, info.time_precision
                );
            }
            Err(e) => {
                shutdown.fatal(e);
            }
        }
    }

    /// Query time precision and version and store them for `db_info`
    pub async fn handshake(&self) -> GatewayResult<DbInfo> {
        let response = self
            .connection
            .client
            .query(HANDSHAKE_QUERY, self.handshake_timeout)
            .await
            .map_err(|e| GatewayError::handshake(format!("handshake query failed: {e}")))?;

        let (time_precision, version) = parse_handshake(&response)?;
        let info = DbInfo {
            dbname: self.connection.database.clone(),
            time_precision,
            version,
            http_server: crate::VERSION.to_string(),
        };

        match self.info.write() {
            Ok(mut slot) => *slot = Some(info.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(info.clone()),
        }
        Ok(info)
    }

    /// Metadata for the db-info operation; unavailable until the handshake ran
    pub fn db_info(&self) -> GatewayResult<DbInfo> {
        let slot = match self.info.read() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
            .ok_or_else(|| GatewayError::unavailable("not connected to SiriDB"))
    }

    /// Client that executes requests with `credentials`. Per-user clients
    /// only exist while a session holds them; a missing one means the
    /// session is gone.
    pub async fn client_for(&self, credentials: &Credentials) -> GatewayResult<Arc<dyn BackendClient>> {
        if *credentials == self.connection.credentials {
            return Ok(self.connection.client());
        }

        let client = self
            .cached_client(credentials)
            .ok_or_else(|| GatewayError::auth("session is no longer valid, log in again"))?;
        if !client.is_connected() {
            client.wait_connected(USER_CLIENT_WAIT).await?;
        }
        Ok(client)
    }

    /// Validate credentials with a probe query issued as that user.
    ///
    /// On success a per-user client is held for the new session and must be
    /// given back with `release`. Clients held by other sessions are never
    /// touched by a failed attempt.
    pub async fn authenticate(&self, credentials: &Credentials) -> GatewayResult<()> {
        if *credentials == self.connection.credentials {
            return self.probe(&self.connection.client, credentials).await;
        }

        let (client, fresh) = match self.cached_client(credentials) {
            Some(client) => (client, false),
            None => {
                debug!("Opening SiriDB connection for user '{}'", credentials.user);
                let client = self.factory.create(
                    credentials,
                    &self.connection.database,
                    &self.connection.addresses,
                );
                client.connect();
                (client, true)
            }
        };

        if let Err(e) = self.probe(&client, credentials).await {
            if fresh {
                client.close();
            }
            return Err(e);
        }

        self.retain(credentials, client, fresh);
        Ok(())
    }

    /// Give back the client held by a session that ended
    pub fn release(&self, credentials: &Credentials) {
        if *credentials == self.connection.credentials {
            return;
        }
        let mut clients = lock(&self.user_clients);
        if let Some(entry) = clients.get_mut(credentials) {
            entry.sessions = entry.sessions.saturating_sub(1);
            if entry.sessions == 0 {
                if let Some(entry) = clients.remove(credentials) {
                    debug!("Closing SiriDB connection for user '{}'", credentials.user);
                    entry.client.close();
                }
            }
        }
    }

    /// Number of per-user clients currently open
    pub fn user_client_count(&self) -> usize {
        lock(&self.user_clients).len()
    }

    fn cached_client(&self, credentials: &Credentials) -> Option<Arc<dyn BackendClient>> {
        lock(&self.user_clients)
            .get(credentials)
            .map(|entry| Arc::clone(&entry.client))
    }

    fn retain(&self, credentials: &Credentials, client: Arc<dyn BackendClient>, fresh: bool) {
        let mut clients = lock(&self.user_clients);
        match clients.entry(credentials.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().sessions += 1;
                if fresh && !Arc::ptr_eq(&entry.get().client, &client) {
                    // A concurrent login for the same user got there first.
                    client.close();
                }
            }
            Entry::Vacant(entry) => {
                let client = if fresh {
                    client
                } else {
                    // The cached client was released while probing.
                    let client = self.factory.create(
                        credentials,
                        &self.connection.database,
                        &self.connection.addresses,
                    );
                    client.connect();
                    client
                };
                entry.insert(UserClient {
                    client,
                    sessions: 1,
                });
            }
        }
    }

    async fn probe(&self, client: &Arc<dyn BackendClient>, credentials: &Credentials) -> GatewayResult<()> {
        let probe = async {
            client.wait_connected(self.handshake_timeout).await?;
            client.query(LOGIN_PROBE_QUERY, self.handshake_timeout).await
        };

        match probe.await {
            Ok(_) => Ok(()),
            Err(BackendError::Auth(msg)) | Err(BackendError::UserAccess(msg)) => {
                warn!("Login rejected for user '{}': {}", credentials.user, msg);
                Err(GatewayError::LoginRejected(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the main connection and every per-user connection (idempotent)
    pub fn close_all(&self) {
        self.connection.client.close();
        for (_, entry) in lock(&self.user_clients).drain() {
            entry.client.close();
        }
    }

    fn log(&self, message: String) {
        // The drain only goes away at process exit.
        let _ = self.log_tx.send(message);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Extract `(time_precision, version)` from the handshake response
pub fn parse_handshake(response: &Value) -> GatewayResult<(String, String)> {
    let map = response
        .as_object()
        .ok_or_else(|| GatewayError::handshake("missing 'map' in data"))?;

    let data = map
        .get("data")
        .and_then(Value::as_array)
        .filter(|arr| arr.len() == 2)
        .ok_or_else(|| GatewayError::handshake("missing array 'data' or length 2 in map"))?;

    let value_of = |item: &Value| item.get("value").and_then(Value::as_str).map(str::to_string);

    match (value_of(&data[0]), value_of(&data[1])) {
        (Some(time_precision), Some(version)) => Ok((time_precision, version)),
        _ => Err(GatewayError::handshake(
            "cannot find time_precision and/or version in data",
        )),
    }
}

/// Create the backend log channel and its drain
pub fn log_channel() -> (LogSender, LogDrain) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, LogDrain { rx })
}

/// Sole consumer of backend client log messages
pub struct LogDrain {
    rx: mpsc::UnboundedReceiver<String>,
}

impl LogDrain {
    /// Emit messages until shutdown begins, then flush what is queued
    pub async fn run(mut self, shutdown: Arc<ShutdownCoordinator>) {
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => info!(target: "siridb", "{}", message),
                    None => return,
                },
                _ = shutdown.wait() => break,
            }
        }
        while let Ok(message) = self.rx.try_recv() {
            info!(target: "siridb", "{}", message);
        }
    }
}
