//! Gateway-side client: publishes work items and waits for their responses.
//!
//! Every client owns one private callback channel. Responses arriving on it
//! are matched to waiting callers by request id; the first match wins and
//! anything unmatched is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gantry_proto::{Codec, MessageType, RequestId, WorkItem, WorkItemBuilder, WorkResponse};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::traits::Broker;
use crate::types::ResponseStream;

enum Command {
    Register {
        waiter: Waiter,
        accepted: oneshot::Sender<bool>,
    },
    Forget {
        request_id: RequestId,
        generation: u64,
    },
}

struct Waiter {
    request_id: RequestId,
    generation: u64,
    reply: oneshot::Sender<WorkResponse>,
}

/// Callers waiting on a response, keyed by request id.
///
/// At most one live caller holds a given id. The generation identifies the
/// call that registered it, so a caller that gave up can only forget itself.
#[derive(Default)]
struct PendingResponses {
    waiting: HashMap<RequestId, (u64, oneshot::Sender<WorkResponse>)>,
}

impl PendingResponses {
    fn register(&mut self, waiter: Waiter) -> bool {
        if let Some((_, reply)) = self.waiting.get(&waiter.request_id) {
            if !reply.is_closed() {
                return false;
            }
        }
        self.waiting
            .insert(waiter.request_id, (waiter.generation, waiter.reply));
        true
    }

    fn forget(&mut self, request_id: &RequestId, generation: u64) {
        if self
            .waiting
            .get(request_id)
            .is_some_and(|(registered, _)| *registered == generation)
        {
            self.waiting.remove(request_id);
        }
    }

    fn resolve(&mut self, response: WorkResponse) {
        match self.waiting.remove(&response.request_id) {
            Some((_, reply)) => {
                // The caller may have given up between timeout and forget.
                let _ = reply.send(response);
            }
            None => debug!(request_id = %response.request_id, "discarding unmatched response"),
        }
    }
}

/// Publishes work and correlates responses for the HTTP gateway.
pub struct GatewayClient {
    broker: Arc<dyn Broker>,
    queue: String,
    callback_channel: String,
    timeout: Duration,
    item_ttl: Duration,
    commands: mpsc::UnboundedSender<Command>,
    generations: AtomicU64,
    cancel: CancellationToken,
    correlator: JoinHandle<()>,
}

impl GatewayClient {
    /// Declares the work queue, subscribes to a fresh callback channel and
    /// starts correlating responses.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        config: &BrokerConfig,
        timeout: Duration,
        item_ttl: Duration,
    ) -> Result<Self, BrokerError> {
        let queue = config.work_queue();
        broker.declare_work_queue(&queue).await?;

        let callback_channel = format!("{}.{}", config.consumer_name, Uuid::new_v4().simple());
        let responses = broker.subscribe_responses(&callback_channel).await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let correlator = tokio::spawn(correlate(command_rx, responses, cancel.clone()));

        info!(queue = %queue, callback = %callback_channel, "gateway client connected");

        Ok(Self {
            broker,
            queue,
            callback_channel,
            timeout,
            item_ttl,
            commands,
            generations: AtomicU64::new(0),
            cancel,
            correlator,
        })
    }

    pub fn callback_channel(&self) -> &str {
        &self.callback_channel
    }

    /// Starts a work item addressed back to this client.
    pub fn new_item(&self, request_id: RequestId) -> WorkItemBuilder {
        WorkItem::builder(request_id, self.callback_channel.clone()).ttl(self.item_ttl)
    }

    /// Publishes `item` and waits for its response.
    ///
    /// Never fails: a response that does not arrive within the configured
    /// timeout, or any broker error on the way, yields the 503
    /// "unable to process" response. If another call is already waiting on
    /// the item's request id, the item is re-keyed with a generated id; the
    /// returned response always carries the id that was actually used.
    pub async fn process(&self, mut item: WorkItem) -> WorkResponse {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let waiting = match self.register(&item.request_id, generation).await {
            Ok(Some(waiting)) => waiting,
            Ok(None) => {
                let duplicate = std::mem::replace(&mut item.request_id, RequestId::generate());
                warn!(
                    request_id = %duplicate,
                    replacement = %item.request_id,
                    "request id already in flight, generated a new one"
                );
                match self.register(&item.request_id, generation).await {
                    Ok(Some(waiting)) => waiting,
                    Ok(None) | Err(_) => return WorkResponse::unable_to_process(item.request_id),
                }
            }
            Err(_) => return WorkResponse::unable_to_process(item.request_id),
        };

        let request_id = item.request_id.clone();
        match self.exchange(item, waiting).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "no response for request");
                let _ = self.commands.send(Command::Forget {
                    request_id: request_id.clone(),
                    generation,
                });
                WorkResponse::unable_to_process(request_id)
            }
        }
    }

    /// Registers a waiter for `request_id`. `None` means the id is taken.
    async fn register(
        &self,
        request_id: &RequestId,
        generation: u64,
    ) -> Result<Option<oneshot::Receiver<WorkResponse>>, BrokerError> {
        let (reply, response) = oneshot::channel();
        let (accepted, registered) = oneshot::channel();
        self.commands
            .send(Command::Register {
                waiter: Waiter {
                    request_id: request_id.clone(),
                    generation,
                    reply,
                },
                accepted,
            })
            .map_err(|_| BrokerError::Closed)?;

        match registered.await {
            Ok(true) => Ok(Some(response)),
            Ok(false) => Ok(None),
            Err(_) => Err(BrokerError::Closed),
        }
    }

    async fn exchange(
        &self,
        item: WorkItem,
        response: oneshot::Receiver<WorkResponse>,
    ) -> Result<WorkResponse, ExchangeError> {
        let mut codec = Codec::with_capacity(1024);
        let frame = codec
            .encode(&item, MessageType::WorkItem)
            .map_err(|e| ExchangeError::Broker(e.into()))?;
        self.broker
            .publish_work(&self.queue, frame)
            .await
            .map_err(ExchangeError::Broker)?;

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ExchangeError::Broker(BrokerError::Closed)),
            Err(_) => Err(ExchangeError::TimedOut(self.timeout)),
        }
    }

    /// Stops correlating and closes the broker connection.
    pub async fn tear_down(&self) {
        self.cancel.cancel();
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "failed to close broker");
        }
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.correlator.abort();
    }
}

#[derive(Debug, thiserror::Error)]
enum ExchangeError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Broker(BrokerError),
}

async fn correlate(
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut responses: ResponseStream,
    cancel: CancellationToken,
) {
    let mut pending = PendingResponses::default();

    loop {
        // Registrations go first so a response can never beat its waiter.
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Register { waiter, accepted }) => {
                    let _ = accepted.send(pending.register(waiter));
                }
                Some(Command::Forget { request_id, generation }) => {
                    pending.forget(&request_id, generation);
                }
                None => break,
            },
            payload = responses.recv() => match payload {
                Some(payload) => match Codec::decode_frame::<WorkResponse>(&payload, MessageType::WorkResponse) {
                    Ok(response) => pending.resolve(response),
                    Err(e) => warn!(error = %e, "discarding undecodable response"),
                },
                None => {
                    debug!("response stream ended");
                    break;
                }
            },
        }
    }

    debug!(waiting = pending.waiting.len(), "correlator stopped");
}
