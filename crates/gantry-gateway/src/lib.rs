//! HTTP ingress gateway for gantry.
//!
//! Every inbound request is published to the broker as a work item; the
//! response a worker publishes back is written to the HTTP caller.

pub mod config;
pub mod error;
pub mod server;

pub use config::{ConfigError, CorrelationConfig, GatewayConfig, LimitsConfig, ServerConfig};
pub use error::GatewayError;
pub use server::{router, run, REQUEST_ID_HEADER};
