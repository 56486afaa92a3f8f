//! Relay configuration.
//!
//! Every knob the core consumes is injected through [`RelayConfig`]; nothing
//! in the relay reads the environment or hardcodes a secret. The binary builds
//! a config from CLI flags / environment variables, tests build one directly.

use std::net::SocketAddr;
use std::time::Duration;

use sigrelay_protocol::Role;

/// Configuration for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP address the listener binds to.
    pub bind_addr: SocketAddr,
    /// URL path for the WebSocket endpoint.
    pub ws_path: String,
    /// Shared secret a producer must present.
    pub producer_token: String,
    /// Shared secret a consumer must present.
    pub consumer_token: String,
    /// Deadline for a producer response before a `timeout` error is synthesized.
    pub request_timeout: Duration,
    /// Deadline for the first (auth) frame on a new connection.
    pub auth_timeout: Duration,
    /// Interval between WebSocket Ping frames on authenticated sessions.
    pub keepalive_interval: Duration,
    /// Per-session outbound channel capacity in messages.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            ws_path: "/ws".to_string(),
            producer_token: "producer-secret".to_string(),
            consumer_token: "consumer-secret".to_string(),
            request_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
            channel_capacity: 64,
        }
    }
}

impl RelayConfig {
    /// Create a config with the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP address to bind to.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the URL path for the WebSocket upgrade endpoint (default: `"/ws"`).
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Set the shared secrets for both roles.
    pub fn with_tokens(
        mut self,
        producer_token: impl Into<String>,
        consumer_token: impl Into<String>,
    ) -> Self {
        self.producer_token = producer_token.into();
        self.consumer_token = consumer_token.into();
        self
    }

    /// Set the producer-response deadline (default: 10 s).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the auth-frame deadline (default: 10 s).
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval (default: 20 s).
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the per-session send-buffer capacity in messages (default: 64).
    pub fn with_channel_capacity(mut self, cap: usize) -> Self {
        self.channel_capacity = cap;
        self
    }

    /// The secret expected for the given role.
    pub fn expected_token(&self, role: Role) -> &str {
        match role {
            Role::Producer => &self.producer_token,
            Role::Consumer => &self.consumer_token,
        }
    }
}
