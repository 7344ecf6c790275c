//! Worker manager configuration.
//!
//! Read from `worker.toml`, with `WORKER_`-prefixed environment variables
//! layered on top (`__` separates nested keys, e.g.
//! `WORKER_POOL__MAX_PROCESSES=8`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use gantry_broker::{duration, BrokerConfig};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::process::ProcessOptions;
use crate::state::WorkerId;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool: PoolConfig,
    pub process: ProcessConfig,
    pub broker: BrokerConfig,
}

impl WorkerConfig {
    /// Loads `worker.toml` from the working directory if present, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file("worker.toml"))
            .merge(Self::env());
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Loads configuration from the given file, then the environment.
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
        Figment::new()
            .merge(Toml::string(content))
            .extract::<Self>()
            .map_err(ConfigError::from)
    }

    fn env() -> Env {
        Env::prefixed("WORKER_").split("__")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_processes == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_processes must be at least 1".to_owned(),
            ));
        }
        if self.process.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "process.request_timeout must be positive".to_owned(),
            ));
        }
        if self.process.handler.is_empty() {
            return Err(ConfigError::Invalid("process.handler is empty".to_owned()));
        }
        self.broker.validate().map_err(ConfigError::Invalid)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker processes started with the pool.
    pub max_processes: usize,

    /// Start a replacement for every worker that dies outside shutdown.
    pub replenish: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: 4,
            replenish: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Bridge binary spawned for each worker.
    pub program: PathBuf,

    /// Extra arguments for `program`.
    pub args: Vec<String>,

    /// Handler name passed to the bridge.
    pub handler: String,

    /// Location of the handler code, passed to the bridge.
    pub code_path: PathBuf,

    /// Directory holding the per-worker sockets.
    pub socket_dir: PathBuf,

    /// Nominal handler timeout. Requests are abandoned after 1.5 times this.
    #[serde(deserialize_with = "duration::deserialize")]
    pub request_timeout: Duration,

    /// How long a spawned worker may take to report ready.
    #[serde(deserialize_with = "duration::deserialize")]
    pub spawn_timeout: Duration,

    /// Drop privileges in the child.
    pub run_as: Option<RunAs>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gantry-sample-handler"),
            args: Vec::new(),
            handler: "handler".to_owned(),
            code_path: PathBuf::from("."),
            socket_dir: std::env::temp_dir(),
            request_timeout: Duration::from_secs(3),
            spawn_timeout: Duration::from_secs(10),
            run_as: None,
        }
    }
}

impl ProcessConfig {
    /// Options for one worker, with its own socket path.
    #[must_use]
    pub fn options_for(&self, id: WorkerId) -> ProcessOptions {
        ProcessOptions {
            program: self.program.clone(),
            args: self.args.clone(),
            handler: self.handler.clone(),
            code_path: self.code_path.clone(),
            socket_path: self.socket_dir.join(format!(".gantry-{id}.sock")),
            request_timeout: self.request_timeout,
            spawn_timeout: self.spawn_timeout,
            run_as: self.run_as,
        }
    }
}

/// Credentials the child runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkerConfig::parse("").unwrap();
        assert_eq!(config.pool.max_processes, 4);
        assert!(!config.pool.replenish);
        assert_eq!(config.process.handler, "handler");
        assert_eq!(config.process.request_timeout, Duration::from_secs(3));
        assert_eq!(config.process.spawn_timeout, Duration::from_secs(10));
        assert!(config.process.run_as.is_none());
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let config = WorkerConfig::parse(
            r#"
            [pool]
            max_processes = 2
            replenish = true

            [process]
            program = "/usr/local/bin/my-handler"
            args = ["--quiet"]
            handler = "main"
            code_path = "/srv/code"
            socket_dir = "/run/gantry"
            request_timeout = "250ms"
            spawn_timeout = "2s"
            run_as = { uid = 1337, gid = 1337 }

            [broker]
            consumer_name = "lambda"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_processes, 2);
        assert!(config.pool.replenish);
        assert_eq!(config.process.args, ["--quiet"]);
        assert_eq!(config.process.request_timeout, Duration::from_millis(250));
        assert_eq!(config.process.run_as, Some(RunAs { uid: 1337, gid: 1337 }));
        assert_eq!(config.broker.work_queue(), "lambdarequests");
    }

    #[test]
    fn options_get_a_socket_per_worker() {
        let config = ProcessConfig {
            socket_dir: PathBuf::from("/run/gantry"),
            ..ProcessConfig::default()
        };
        let a = config.options_for(WorkerId::generate());
        let b = config.options_for(WorkerId::generate());

        assert_ne!(a.socket_path, b.socket_path);
        assert!(a.socket_path.starts_with("/run/gantry"));
    }

    #[test]
    fn validate_rejects_empty_pool() {
        let config = WorkerConfig::parse("[pool]\nmax_processes = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let config = WorkerConfig::parse("[broker]\npoll_interval = \"0ms\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_missing_file() {
        assert!(matches!(
            WorkerConfig::load_from("/nonexistent/worker.toml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
