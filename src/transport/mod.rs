/// Client-facing transports: the HTTP API and the WebSocket event channel
pub mod http;
pub mod socket;

use std::sync::Arc;

use crate::dispatch::Dispatcher;

/// Shared state handed to every axum handler
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Session cookie lifetime in seconds
    pub cookie_max_age: u64,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, cookie_max_age: u64) -> Self {
        Self {
            dispatcher,
            cookie_max_age,
        }
    }
}

pub use http::router;
