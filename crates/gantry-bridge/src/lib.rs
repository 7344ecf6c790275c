//! Worker-side bridge runtime for gantry.
//!
//! A worker binary registers its handlers and hands control to [`run`]:
//!
//! ```ignore
//! use gantry_bridge::{Completion, ExecutionContext, Handler, HandlerError, HandlerRegistry};
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl Handler for Hello {
//!     async fn call(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<Completion, HandlerError> {
//!         ctx.log().info(["hello from", ctx.handler_name()]);
//!         Ok(Completion::raw("Hello!"))
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     gantry_bridge::init_tracing();
//!     let registry = HandlerRegistry::new().with("handler", Hello);
//!     if let Err(e) = gantry_bridge::run(registry).await {
//!         tracing::error!(error = %e, "worker failed");
//!         std::process::exit(1);
//!     }
//! }
//! ```
//!
//! stdout is reserved for the ready marker, so diagnostics go to stderr.

mod config;
mod context;
mod error;
mod handler;
mod runtime;
pub mod signals;

pub use config::SpawnConfig;
pub use context::{ExecutionContext, InvocationLogger};
pub use error::BridgeError;
pub use handler::{Completion, Handler, HandlerError, HandlerRegistry, StructuredResponse};
pub use runtime::{run, BridgeRuntime};

pub use gantry_proto::{RequestId, WorkItem};

/// Installs a stderr tracing subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();
}
