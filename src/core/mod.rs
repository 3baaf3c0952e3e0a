/// Core gateway components shared by both transports
pub mod address;
pub mod backend;
pub mod session;
pub mod shutdown;
pub mod supervisor;

pub use address::{resolve, ServerAddress, DEFAULT_PORT};
pub use backend::{BackendClient, BackendError, ClientFactory, Credentials};
pub use session::{AuthSettings, AuthStatus, ConnectionId, SessionBroker, SessionHandle, TransportContext};
pub use shutdown::{ExitReason, ShutdownCoordinator, ShutdownState};
pub use supervisor::{DbInfo, Supervisor};
