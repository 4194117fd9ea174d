//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use tq_core::{Result, TqError, WorkerConfig};

/// Configuration for the tq server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the API server to.
    pub api_addr: SocketAddr,
    /// Backend URL handed to [`crate::connect`].
    pub backend_url: String,
    /// Namespace prefix for keys/tables.
    pub namespace: String,
    /// Worker pool settings.
    pub worker: WorkerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            backend_url: "sqlite:tq.db?mode=rwc".to_string(),
            namespace: "tq".to_string(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Read the configuration from the process environment.
    ///
    /// Recognized variables: `TQ_API_ADDR`, `TQ_BACKEND_URL`, `TQ_NAMESPACE`
    /// and `TQ_SHUTDOWN_TIMEOUT_SECS`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = ServerConfig::builder();

        if let Some(addr) = lookup("TQ_API_ADDR") {
            builder = builder
                .api_addr_str(&addr)
                .map_err(|e| TqError::Config(format!("Invalid TQ_API_ADDR '{}': {}", addr, e)))?;
        }
        if let Some(url) = lookup("TQ_BACKEND_URL") {
            builder = builder.backend_url(url);
        }
        if let Some(namespace) = lookup("TQ_NAMESPACE") {
            builder = builder.namespace(namespace);
        }
        if let Some(secs) = lookup("TQ_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                TqError::Config(format!("Invalid TQ_SHUTDOWN_TIMEOUT_SECS '{}'", secs))
            })?;
            builder = builder.shutdown_timeout(Duration::from_secs(secs));
        }

        Ok(builder.build())
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API bind address.
    pub fn api_addr(mut self, addr: SocketAddr) -> Self {
        self.config.api_addr = addr;
        self
    }

    /// Set the API bind address from a string.
    pub fn api_addr_str(mut self, addr: &str) -> std::result::Result<Self, std::net::AddrParseError> {
        self.config.api_addr = addr.parse()?;
        Ok(self)
    }

    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.config.backend_url = url.into();
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Replace the worker pool settings.
    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.config.worker = worker;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker.shutdown_timeout = timeout;
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
