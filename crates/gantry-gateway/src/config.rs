//! Gateway configuration.
//!
//! Read from `gateway.toml`, with `GATEWAY_`-prefixed environment variables
//! layered on top (`__` separates nested keys, e.g.
//! `GATEWAY_CORRELATION__TIMEOUT=2s`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::{Error as FigmentError, Figment};
use gantry_broker::{duration, BrokerConfig};
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading or parsing gateway configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(Box<FigmentError>),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,

    /// How long to wait for a worker's response, and how long work stays valid.
    pub correlation: CorrelationConfig,

    /// Request limits.
    pub limits: LimitsConfig,

    /// Broker connection shared with the worker managers.
    pub broker: BrokerConfig,
}

impl GatewayConfig {
    /// Loads `gateway.toml` from the working directory if present, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::file("gateway.toml"))
            .merge(Self::env())
            .extract::<Self>()
            .map_err(ConfigError::from)
    }

    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `GATEWAY_` override file settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new().merge(Toml::file(path)).merge(Self::env());
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Toml::string(content));
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    fn env() -> Env {
        Env::prefixed("GATEWAY_").split("__")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.correlation.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "correlation.timeout must be positive".to_owned(),
            ));
        }
        if self.correlation.item_ttl < self.correlation.timeout {
            return Err(ConfigError::Invalid(
                "correlation.item_ttl must not be shorter than correlation.timeout".to_owned(),
            ));
        }
        if self.limits.max_body_size == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_body_size must be at least 1".to_owned(),
            ));
        }
        self.broker.validate().map_err(ConfigError::Invalid)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to bind the server to.
    pub bind_address: SocketAddr,

    /// Time to wait for in-flight requests during shutdown.
    #[serde(deserialize_with = "duration::deserialize")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// After this the caller gets a 503 and any late response is discarded.
    #[serde(deserialize_with = "duration::deserialize")]
    pub timeout: Duration,

    /// Lifetime stamped on every work item.
    #[serde(deserialize_with = "duration::deserialize")]
    pub item_ttl: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(900),
            item_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 6 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_broker::BackendConfig;

    #[test]
    fn defaults() {
        let config = GatewayConfig::parse("").unwrap();
        assert_eq!(config.server.bind_address.port(), 3000);
        assert_eq!(config.correlation.timeout, Duration::from_millis(900));
        assert_eq!(config.correlation.item_ttl, Duration::from_secs(60));
        assert!(matches!(config.broker.backend, BackendConfig::Memory));
        config.validate().unwrap();
    }

    #[test]
    fn config_from_string() {
        let config = GatewayConfig::parse(
            r#"
            [server]
            bind_address = "127.0.0.1:9000"
            shutdown_timeout = "5s"

            [correlation]
            timeout = "2s"
            item_ttl = "1m"

            [limits]
            max_body_size = 1024

            [broker]
            consumer_name = "edge"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address.to_string(), "127.0.0.1:9000");
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.correlation.timeout, Duration::from_secs(2));
        assert_eq!(config.correlation.item_ttl, Duration::from_secs(60));
        assert_eq!(config.limits.max_body_size, 1024);
        assert_eq!(config.broker.work_queue(), "edgerequests");
    }

    #[test]
    fn ttl_shorter_than_timeout_is_rejected() {
        let config = GatewayConfig::parse(
            r#"
            [correlation]
            timeout = "5s"
            item_ttl = "1s"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = GatewayConfig::parse("[broker]\npoll_interval = \"0s\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = GatewayConfig::load_from("/nonexistent/gateway.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
