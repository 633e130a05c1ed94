//! Server configuration.
//!
//! Every setting is optional. Build one in code:
//!
//! ```rust
//! use perch::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .host("0.0.0.0")
//!     .port(8080)
//!     .idle_timeout(Duration::from_secs(5))
//!     .cors(None)
//!     .build();
//!
//! assert_eq!(config.port(), 8080);
//! assert_eq!(config.cors(), None);
//! ```
//!
//! or load one from TOML:
//!
//! ```rust
//! use perch::ServerConfig;
//!
//! let config = ServerConfig::from_toml_str(r#"
//!     port = 8080
//!     idle_timeout_ms = 5000
//!     cors = "https://example.com"
//! "#).unwrap();
//!
//! assert_eq!(config.host(), "127.0.0.1");
//! assert_eq!(config.cors(), Some("https://example.com"));
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 56789;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_CORS: &str = "*";

/// Server configuration. Use [`ServerConfig::builder()`] or
/// [`ServerConfig::from_toml_str`] to construct one.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    host: String,
    port: u16,
    idle_timeout_ms: u64,
    /// Advisory only. Handed to the OS as the listen backlog; excess
    /// connections are not rejected by the server.
    max_connections: u32,
    /// `Access-Control-Allow-Origin` value. Empty or absent disables it.
    cors: Option<String>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder { config: Self::default() }
    }

    /// Parses a TOML document. Missing keys take their defaults; unknown
    /// keys are an error.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// The cross-origin header value, or `None` when the header is disabled.
    pub fn cors(&self) -> Option<&str> {
        self.cors.as_deref().filter(|v| !v.is_empty())
    }

    /// The address to listen on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Address`] if `host` is not an IP address.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let ip: IpAddr = self.host.parse().map_err(|_| Error::Address(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            cors: Some(DEFAULT_CORS.to_owned()),
        }
    }
}

/// Fluent builder for [`ServerConfig`].
#[derive(Clone, Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Port `0` lets the OS pick; read it back with
    /// [`Server::local_addr`](crate::Server::local_addr).
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sub-millisecond precision is dropped.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn cors(mut self, origin: Option<&str>) -> Self {
        self.config.cors = origin.map(str::to_owned);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
