//! Client configuration.

use std::time::Duration;

use crate::constants::{
    COMMIT_TIMEOUT, DEFAULT_SERVER_URL, RECONCILE_TIMEOUT, RESUBSCRIBE_DELAY, SHAPE_PATH,
};

/// Everything a session needs to reach the server. Built explicitly and
/// handed to [`spawn_session`](crate::spawn_session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the mutation RPC (and, by default, the gateway).
    pub server_url: String,
    /// Override for the subscription endpoint.
    pub shape_url: Option<String>,
    pub commit_timeout: Duration,
    pub reconcile_timeout: Duration,
    pub resubscribe_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_URL)
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        let server_url: String = server_url.into();
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            shape_url: None,
            commit_timeout: COMMIT_TIMEOUT,
            reconcile_timeout: RECONCILE_TIMEOUT,
            resubscribe_delay: RESUBSCRIBE_DELAY,
        }
    }

    /// Apply `TODOLOG_SHAPE_URL` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("TODOLOG_SHAPE_URL") {
            if !url.trim().is_empty() {
                self.shape_url = Some(url);
            }
        }
        self
    }

    pub fn with_shape_url(mut self, url: impl Into<String>) -> Self {
        self.shape_url = Some(url.into());
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// The subscription endpoint: the override, or the gateway on the server.
    pub fn shape_url(&self) -> String {
        match &self.shape_url {
            Some(url) => url.clone(),
            None => format!("{}{SHAPE_PATH}", self.server_url),
        }
    }
}
