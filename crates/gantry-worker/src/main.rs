//! gantry worker manager binary.
//!
//! Usage: `gantry-worker [CONFIG]`. Without an argument `worker.toml` is read
//! from the working directory when present.

use std::sync::Arc;

use gantry_worker::{Pool, TracingLogSink, WorkerConfig};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => WorkerConfig::load_from(path)?,
        None => WorkerConfig::load()?,
    };
    config.validate()?;

    info!(
        program = %config.process.program.display(),
        handler = %config.process.handler,
        queue = %config.broker.work_queue(),
        "gantry worker manager starting"
    );

    let broker = gantry_broker::connect(&config.broker).await?;
    let pool = Pool::start(&config, broker, Arc::new(TracingLogSink))?;

    shutdown_signal().await;
    info!("Shutdown signal received, tearing down");

    if let Err(e) = pool.shutdown().await {
        error!(error = %e, "Worker pool shutdown failed");
        return Err(e.into());
    }

    info!("Worker manager shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
