//! Signal handling for the worker process.

use nix::sys::signal::{signal, SigHandler, Signal};
use tokio::signal::unix::{signal as tokio_signal, SignalKind};
use tracing::{info, warn};

/// Ignores signals that would otherwise kill the worker without cleanup.
pub fn ignore_disruptive_signals() {
    // SAFETY: installing SIG_IGN does not run any handler code.
    unsafe {
        let _ = signal(Signal::SIGHUP, SigHandler::SigIgn);
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Resolves when the supervisor asks the worker to terminate.
pub async fn terminated() {
    let mut sigterm = match tokio_signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };

    sigterm.recv().await;
    info!("received SIGTERM, shutting down");
}
