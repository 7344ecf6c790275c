//! Serve loop of the worker side of the bridge.

use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use gantry_proto::spawn::READY_MARKER;
use gantry_proto::transport::{read_message, write_message, BridgeListener};
use gantry_proto::{BridgeMessage, BridgeResponse, Codec, ProtocolError, WorkItem, WorkResponse};
use tokio::net::UnixStream;
use tracing::{debug, error, info};

use crate::config::SpawnConfig;
use crate::context::ExecutionContext;
use crate::error::BridgeError;
use crate::handler::{Handler, HandlerRegistry};

/// Runs a worker until the supervisor terminates it.
///
/// Reads the spawn environment, binds the socket, announces readiness on stdout
/// and serves invocations. Returns an error when the worker must exit non-zero.
pub async fn run(registry: HandlerRegistry) -> Result<(), BridgeError> {
    crate::signals::ignore_disruptive_signals();

    let config = SpawnConfig::from_env()?;
    config.validate()?;

    let runtime = BridgeRuntime::new(config, &registry)?;
    let listener = BridgeListener::bind(&runtime.config.socket_path)?;
    info!(
        handler = %runtime.config.handler,
        socket = %listener.path().display(),
        "bridge listening"
    );

    announce_ready()?;
    runtime.serve(listener, crate::signals::terminated()).await
}

fn announce_ready() -> Result<(), BridgeError> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{READY_MARKER}")?;
    stdout.flush()?;
    Ok(())
}

/// A handler bound to its spawn configuration.
pub struct BridgeRuntime {
    config: SpawnConfig,
    handler: Arc<dyn Handler>,
}

impl BridgeRuntime {
    /// Resolves the configured handler from the registry.
    pub fn new(config: SpawnConfig, registry: &HandlerRegistry) -> Result<Self, BridgeError> {
        let handler = registry
            .get(&config.handler)
            .ok_or_else(|| BridgeError::UnknownHandler(config.handler.clone()))?;

        Ok(Self { config, handler })
    }

    /// Accepts supervisor connections until `shutdown` resolves.
    ///
    /// Connections are served one at a time; a worker only ever has one
    /// supervisor.
    pub async fn serve<F>(&self, listener: BridgeListener, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let stream = tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => accepted?,
            };
            debug!("supervisor connected");

            tokio::select! {
                () = &mut shutdown => break,
                result = self.handle_connection(stream) => result?,
            }
        }

        debug!("bridge closed");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<(), BridgeError> {
        let mut codec = Codec::with_capacity(8192);

        loop {
            let Some(message) = read_message(&mut stream).await? else {
                debug!("connection closed");
                return Ok(());
            };

            let item = match message {
                BridgeMessage::Invoke(item) => item,
                BridgeMessage::Response(_) => {
                    return Err(ProtocolError::UnexpectedMessage("response sent to a worker").into());
                }
            };

            let response = self.invoke(item).await?;
            write_message(&mut stream, &mut codec, &BridgeMessage::Response(response)).await?;
        }
    }

    /// Runs the handler for one item and normalises its completion.
    ///
    /// A failing or panicking handler is reported as an error so the caller can
    /// terminate the process.
    pub async fn invoke(&self, item: WorkItem) -> Result<BridgeResponse, BridgeError> {
        let request_id = item.request_id.clone();
        let ctx = ExecutionContext::new(request_id.clone(), &self.config.handler, &self.config.code_path);
        let mut response = WorkResponse::scaffold(request_id.clone());

        let completion = match AssertUnwindSafe(self.handler.call(&item, &ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(completion)) => completion,
            Ok(Err(e)) => {
                error!(request_id = %request_id, error = %e, "handler returned an error");
                return Err(BridgeError::HandlerFailed(e.to_string()));
            }
            Err(_) => {
                error!(request_id = %request_id, "handler panicked");
                return Err(BridgeError::HandlerPanicked);
            }
        };

        completion.apply_to(&mut response);
        response.request_id = request_id;

        Ok(BridgeResponse {
            logs: ctx.into_logs(),
            callback_data: response,
        })
    }
}
