//! Worker manager errors.

use std::path::PathBuf;

use figment::Error as FigmentError;
use gantry_broker::BrokerError;
use gantry_proto::ProtocolError;
use thiserror::Error;

use crate::state::WorkerId;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// `start` called on a worker that has left CREATING.
    #[error("worker {0} was already started")]
    AlreadyStarted(WorkerId),

    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Removing the socket file failed for a reason other than it being gone.
    #[error("failed to remove {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pool is not running")]
    PoolStopped,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
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
