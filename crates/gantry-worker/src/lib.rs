//! gantry worker manager.
//!
//! Supervises a pool of bridge worker processes and feeds them work items
//! from the broker:
//!
//! - [`WorkerProcess`]: one spawned worker and its state machine
//! - [`Pool`]: the scheduler dispatching work items to READY workers
//! - [`LogSink`]: where handler log records end up

pub mod config;
pub mod error;
pub mod log_sink;
pub mod pool;
pub mod process;
pub mod state;

pub use config::{PoolConfig, ProcessConfig, RunAs, WorkerConfig};
pub use error::{ConfigError, WorkerError};
pub use log_sink::{LogSink, MemoryLogSink, TracingLogSink};
pub use pool::{Pool, PoolSnapshot, ReadyQueue};
pub use process::{ProcessOptions, Requester, WorkerProcess, SHUTDOWN_GRACE_PERIOD};
pub use state::{StateChange, WorkerId, WorkerState};
