/// Process shutdown coordination
///
/// `Running -> ShuttingDown -> Terminated`. The first trigger wins; later
/// triggers are ignored so an interrupt racing a fatal error keeps whichever
/// reason arrived first.
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

/// Lifecycle state of the gateway process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Why the process is going down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator interrupt (CTRL+C / SIGTERM)
    Interrupt,
    /// Unrecoverable error; the message is printed to the operator
    Fatal(String),
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Interrupt => 0,
            ExitReason::Fatal(_) => 1,
        }
    }
}

pub struct ShutdownCoordinator {
    state: watch::Sender<ShutdownState>,
    reason: Mutex<Option<ExitReason>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state,
            reason: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Begin shutting down. Returns false if shutdown was already under way.
    pub fn trigger(&self, reason: ExitReason) -> bool {
        {
            let mut slot = match self.reason.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_some() {
                return false;
            }
            match &reason {
                ExitReason::Interrupt => info!("Interrupt received, shutting down"),
                ExitReason::Fatal(msg) => error!("Fatal error, shutting down: {}", msg),
            }
            *slot = Some(reason);
        }
        self.state.send_replace(ShutdownState::ShuttingDown);
        true
    }

    /// Shorthand for a fatal trigger from any error value
    pub fn fatal<E: std::fmt::Display>(&self, err: E) -> bool {
        self.trigger(ExitReason::Fatal(err.to_string()))
    }

    pub fn reason(&self) -> Option<ExitReason> {
        match self.reason.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Resolve once shutdown has begun
    pub async fn wait(&self) -> ExitReason {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = rx.wait_for(|state| *state != ShutdownState::Running).await;
        self.reason().unwrap_or(ExitReason::Interrupt)
    }

    /// Mark the process as terminated and hand back the exit reason
    pub fn finish(&self) -> ExitReason {
        let reason = self.reason().unwrap_or(ExitReason::Interrupt);
        self.state.send_replace(ShutdownState::Terminated);
        reason
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward CTRL+C (and SIGTERM on unix) into the coordinator
pub async fn listen_for_signals(coordinator: std::sync::Arc<ShutdownCoordinator>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    coordinator.trigger(ExitReason::Interrupt);
}
