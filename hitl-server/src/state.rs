//! Shared application state for the HTTP handlers.

use std::time::Duration;

use hitl::broker::Broker;
use hitl::io::config::ServerConfig;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    /// Long-poll budget for `GET /next` without a `timeout` parameter.
    pub default_poll: Duration,
    /// Cap on any long-poll budget.
    pub max_poll: Duration,
}

impl AppState {
    pub fn new(broker: Broker, config: &ServerConfig) -> Self {
        Self {
            broker,
            default_poll: config.default_poll(),
            max_poll: config.max_poll(),
        }
    }
}
