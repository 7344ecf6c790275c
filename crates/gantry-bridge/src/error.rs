//! Bridge runtime errors.

use std::path::PathBuf;

use gantry_proto::ProtocolError;
use thiserror::Error;

/// Errors that stop the bridge runtime.
///
/// Every variant is terminal: the worker process exits and the supervisor
/// observes the exit.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("missing spawn environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("handler code path does not exist: {}", .0.display())]
    CodePathMissing(PathBuf),

    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("handler panicked")]
    HandlerPanicked,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
