//! Configuration for the broker.
//!
//! Sources are layered: built-in defaults, then an optional `broker.toml`
//! (or the file named by `BROKER_CONFIG`), then `BROKER__SECTION__KEY`
//! environment variables.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on how long shutdown waits for in-flight work.
    pub drain_timeout_secs: u64,
}

/// Shared secrets. Empty strings disable the corresponding check.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Key workers and relay clients present in their `register` frame.
    #[serde(default)]
    pub client_key: String,
    /// Bearer token required on the client-facing HTTP surface.
    #[serde(default)]
    pub api_key: String,
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Idle timeout per proxied request, re-armed while the worker heartbeats.
    pub request_timeout_secs: u64,
    /// Absolute ceiling per proxied request; 0 disables it.
    pub request_hard_timeout_secs: u64,
    /// Maximum number of workers one embeddings request fans out to.
    pub max_parallel_embeddings: usize,
    pub heartbeat_interval_secs: u64,
    /// Workers silent for longer than this are pruned.
    pub heartbeat_expiry_secs: u64,
    pub outbound_queue_capacity: usize,
    pub registration_timeout_secs: u64,
}

/// JSON-RPC relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub request_timeout_secs: u64,
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
    pub heartbeat_interval_ms: u64,
    pub dead_after_ms: u64,
    pub max_concurrency_per_client: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Load configuration from defaults, file and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("BROKER_CONFIG").unwrap_or_else(|_| "broker".to_string());
        Self::load_from(&file)
    }

    /// Load configuration using `file` as the optional file source.
    pub fn load_from(file: &str) -> Result<Self, ConfigError> {
        let loader = ConfigLoader::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.drain_timeout_secs", 30)?
            .set_default("auth.client_key", "")?
            .set_default("auth.api_key", "")?
            .set_default("gateway.request_timeout_secs", 300)?
            .set_default("gateway.request_hard_timeout_secs", 0)?
            .set_default("gateway.max_parallel_embeddings", 4)?
            .set_default("gateway.heartbeat_interval_secs", 10)?
            .set_default("gateway.heartbeat_expiry_secs", 30)?
            .set_default("gateway.outbound_queue_capacity", 32)?
            .set_default("gateway.registration_timeout_secs", 10)?
            .set_default("relay.request_timeout_secs", 60)?
            .set_default("relay.max_request_bytes", 10 * 1024 * 1024)?
            .set_default("relay.max_response_bytes", 10 * 1024 * 1024)?
            .set_default("relay.heartbeat_interval_ms", 15_000)?
            .set_default("relay.dead_after_ms", 45_000)?
            .set_default("relay.max_concurrency_per_client", 8)?
            .set_default("logging.level", "info")?
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix("BROKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        loader.try_deserialize()
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Option<Duration> {
        (self.request_hard_timeout_secs > 0)
            .then(|| Duration::from_secs(self.request_hard_timeout_secs))
    }

    pub fn heartbeat_expiry(&self) -> Duration {
        Duration::from_secs(self.heartbeat_expiry_secs)
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dead_after(&self) -> Duration {
        Duration::from_millis(self.dead_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load_from("/nonexistent/broker-config").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.gateway.outbound_queue_capacity, 32);
        assert!(config.gateway.hard_timeout().is_none());
        assert!(config.auth.client_key.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[auth]\nclient_key = \"s3cret\"\n[gateway]\nrequest_hard_timeout_secs = 600\nmax_parallel_embeddings = 2"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().trim_end_matches(".toml").to_string();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.auth.client_key, "s3cret");
        assert_eq!(config.gateway.max_parallel_embeddings, 2);
        assert_eq!(config.gateway.hard_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.gateway.request_timeout_secs, 300);
    }
}
