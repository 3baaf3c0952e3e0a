/// siridb-http - HTTP and WebSocket gateway for SiriDB time series clusters
///
/// The gateway keeps one supervised connection to the cluster, authenticates
/// clients with cookie sessions (HTTP) or per-connection sessions (WebSocket)
/// and forwards queries and inserts through a transport-neutral dispatcher.
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod siridb;
pub mod transport;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::backend::ClientFactory;
use crate::core::session::SessionBroker;
use crate::core::shutdown::{listen_for_signals, ExitReason, ShutdownCoordinator};
use crate::core::supervisor::{log_channel, LogDrain, LogSender, Supervisor};
use crate::dispatch::Dispatcher;
use crate::error::{GatewayError, GatewayResult};
use crate::siridb::SiriClientFactory;
use crate::transport::AppState;

/// Version reported as `http_server` in db-info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long open HTTP and socket connections may hold up the exit
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Gateway {
    config: Config,
    shutdown: Arc<ShutdownCoordinator>,
    log_tx: LogSender,
    drain: LogDrain,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        let (log_tx, drain) = log_channel();
        Self {
            config,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            log_tx,
            drain,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle for triggering shutdown from outside
    pub fn shutdown(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> GatewayResult<ExitReason> {
        self.config.validate()?;
        let bind_addr = self.config.server.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            GatewayError::internal(format!("cannot listen on {bind_addr}: {e}"))
        })?;

        let factory = Arc::new(SiriClientFactory::new(self.log_tx.clone()));
        self.serve(listener, factory).await
    }

    /// Serve on an already bound listener with the given backend clients
    pub async fn serve(
        self,
        listener: TcpListener,
        factory: Arc<dyn ClientFactory>,
    ) -> GatewayResult<ExitReason> {
        let Gateway {
            config,
            shutdown,
            log_tx,
            drain,
        } = self;

        let addresses = config.database.addresses()?;
        let drain_task = tokio::spawn(drain.run(Arc::clone(&shutdown)));

        let supervisor = Arc::new(Supervisor::new(
            config.database.credentials(),
            config.database.dbname.clone(),
            addresses,
            factory,
            log_tx,
        ));
        let broker = Arc::new(SessionBroker::new(
            config.server.auth_settings(),
            config.server.cookie_max_age(),
            Arc::clone(&supervisor),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&supervisor),
            Arc::clone(&broker),
            Arc::clone(&shutdown),
            config.server.query_timeout(),
            config.server.insert_timeout(),
        ));

        let mut tasks = vec![tokio::spawn(listen_for_signals(Arc::clone(&shutdown)))];
        {
            let supervisor = Arc::clone(&supervisor);
            let shutdown = Arc::clone(&shutdown);
            tasks.push(tokio::spawn(async move { supervisor.run(&shutdown).await }));
        }
        if config.server.require_authentication {
            tasks.push(tokio::spawn(Arc::clone(&broker).start_cleanup_task()));
        }

        let app = transport::router(
            AppState::new(dispatcher, config.server.cookie_max_age),
            config.server.enable_socket,
        );
        let local_addr = listener.local_addr()?;
        info!(
            "siridb-http {} serving on {} (socket: {}, authentication: {}, multi-user: {})",
            VERSION,
            local_addr,
            config.server.enable_socket,
            config.server.require_authentication,
            config.server.enable_multi_user
        );

        let server = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                let stop = Arc::clone(&shutdown);
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        stop.wait().await;
                    })
                    .await;
                if let Err(e) = result {
                    shutdown.fatal(GatewayError::from(e));
                }
            })
        };

        shutdown.wait().await;

        supervisor.close_all();
        for task in tasks {
            task.abort();
        }
        if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, server).await.is_err() {
            warn!("Open client connections did not close in time");
        }
        let _ = drain_task.await;

        Ok(shutdown.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::testing::MockFactory;
    use crate::core::shutdown::ShutdownState;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.require_authentication = false;
        config
    }

    #[tokio::test]
    async fn test_gateway_serves_until_interrupted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let gateway = Gateway::new(test_config());
        let shutdown = gateway.shutdown();
        let running = tokio::spawn(gateway.serve(listener, Arc::new(MockFactory::default())));

        let (mut ws, _) = connect_async(format!("ws://{addr}/socket")).await.unwrap();
        let reply = loop {
            ws.send(Message::text(json!({"id": 1, "event": "db-info"}).to_string()))
                .await
                .unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            let reply: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            // db-info is unavailable until the handshake has run
            if reply["status"] == 200 {
                break reply;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let info: Value = serde_json::from_str(reply["data"].as_str().unwrap()).unwrap();
        assert_eq!(info["dbname"], "dbtest");
        assert_eq!(info["http_server"], VERSION);
        ws.close(None).await.unwrap();

        shutdown.trigger(ExitReason::Interrupt);
        let reason = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, ExitReason::Interrupt);
        assert_eq!(shutdown.state(), ShutdownState::Terminated);
    }

    #[tokio::test]
    async fn test_invalid_server_list_fails_before_serving() {
        let mut config = test_config();
        config.database.servers = "siridb01:notaport".to_string();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let err = Gateway::new(config)
            .serve(listener, Arc::new(MockFactory::default()))
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
    }
}
