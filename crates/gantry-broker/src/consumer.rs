//! Worker-side consumer of the shared work queue.

use std::sync::Arc;
use std::time::Duration;

use gantry_proto::{Codec, MessageType, RequestId, WorkItem, WorkResponse};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::delivery::DeliveryTracker;
use crate::error::BrokerError;
use crate::traits::Broker;
use crate::types::Delivery;

const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Pause after a requeue before taking the next item.
const REQUEUE_BACKOFF: Duration = Duration::from_millis(50);

/// How the scheduler disposed of a delivered work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Handled; remove from the queue.
    Ack(RequestId),
    /// Not handled here; requeue for another consumer.
    Nack(RequestId),
}

/// Pulls work items one at a time and forwards them to a scheduler.
///
/// The next item is only taken once the previous one has been settled, so a
/// stalled pool never holds more than one item hostage.
pub struct BrokerConsumer {
    broker: Arc<dyn Broker>,
    queue: String,
    poll_interval: Duration,
    tracker: DeliveryTracker,
    settlements: mpsc::UnboundedReceiver<Settlement>,
    work: mpsc::Sender<WorkItem>,
    cancel: CancellationToken,
}

impl BrokerConsumer {
    /// Declares the work queue and starts consuming it.
    ///
    /// Returns the handle used to settle deliveries and the stream of decoded
    /// work items.
    pub async fn start(
        broker: Arc<dyn Broker>,
        config: &BrokerConfig,
    ) -> Result<(ConsumerHandle, mpsc::Receiver<WorkItem>), BrokerError> {
        let queue = config.work_queue();
        broker.declare_work_queue(&queue).await?;

        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let consumer = Self {
            broker: Arc::clone(&broker),
            queue,
            poll_interval: config.poll_interval,
            tracker: DeliveryTracker::new(),
            settlements: settle_rx,
            work: work_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(consumer.run());

        let handle = ConsumerHandle {
            settlements: settle_tx,
            responder: Responder { broker },
            cancel,
            task,
        };
        Ok((handle, work_rx))
    }

    async fn run(mut self) {
        info!(queue = %self.queue, "consuming work items");

        loop {
            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                received = self.broker.receive(&self.queue, self.poll_interval) => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "receive failed");
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(RECEIVE_RETRY_DELAY) => continue,
                    }
                }
            };

            let Some(request_id) = self.accept(delivery).await else {
                continue;
            };

            let requeued = match self.await_settlement(&request_id).await {
                Some(requeued) => requeued,
                None => break,
            };

            if requeued {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(REQUEUE_BACKOFF) => {}
                }
            }
        }

        for tag in self.tracker.drain().collect::<Vec<_>>() {
            if let Err(e) = self.broker.nack(&tag).await {
                debug!(error = %e, "failed to release unsettled delivery");
            }
        }
        debug!(queue = %self.queue, "consumer stopped");
    }

    /// Decodes and tracks a delivery, then hands it to the scheduler.
    async fn accept(&mut self, delivery: Delivery) -> Option<RequestId> {
        let item: WorkItem = match Codec::decode_frame(&delivery.payload, MessageType::WorkItem) {
            Ok(item) => item,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "dropping undecodable work item");
                if let Err(e) = self.broker.ack(&delivery.tag).await {
                    warn!(error = %e, "failed to drop undecodable work item");
                }
                return None;
            }
        };

        let request_id = item.request_id.clone();
        if let Err(e) = self.tracker.track(request_id.clone(), delivery.tag.clone()) {
            warn!(request_id = %request_id, error = %e, "requeueing duplicate delivery");
            let _ = self.broker.nack(&delivery.tag).await;
            return None;
        }

        debug!(request_id = %request_id, "work item received");
        if self.work.send(item).await.is_err() {
            debug!("scheduler gone, stopping consumer");
            self.cancel.cancel();
        }
        Some(request_id)
    }

    /// Applies settlements until `request_id` is settled.
    ///
    /// Returns whether it was requeued, or `None` on shutdown.
    async fn await_settlement(&mut self, request_id: &RequestId) -> Option<bool> {
        let mut requeued = false;
        while self.tracker.is_tracking(request_id) {
            let settlement = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                settlement = self.settlements.recv() => settlement?,
            };

            if matches!(&settlement, Settlement::Nack(id) if id == request_id) {
                requeued = true;
            }
            self.settle(settlement).await;
        }
        Some(requeued)
    }

    async fn settle(&mut self, settlement: Settlement) {
        let (request_id, ack) = match &settlement {
            Settlement::Ack(id) => (id, true),
            Settlement::Nack(id) => (id, false),
        };

        let tag = match self.tracker.take(request_id) {
            Ok(tag) => tag,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "ignoring settlement");
                return;
            }
        };

        let result = if ack {
            self.broker.ack(&tag).await
        } else {
            self.broker.nack(&tag).await
        };

        if let Err(e) = result {
            error!(request_id = %request_id, ack, error = %e, "failed to settle delivery");
        }
    }
}

/// Scheduler-side handle to a running [`BrokerConsumer`].
pub struct ConsumerHandle {
    settlements: mpsc::UnboundedSender<Settlement>,
    responder: Responder,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn ack(&self, request_id: RequestId) {
        self.settle(Settlement::Ack(request_id));
    }

    pub fn nack(&self, request_id: RequestId) {
        self.settle(Settlement::Nack(request_id));
    }

    fn settle(&self, settlement: Settlement) {
        if self.settlements.send(settlement).is_err() {
            debug!("consumer stopped, settlement dropped");
        }
    }

    /// Publishes responses for work taken from this consumer.
    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }

    /// Stops consuming and waits for the consumer task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "consumer task failed");
        }
    }
}

/// Publishes work responses to their callback channels.
#[derive(Clone)]
pub struct Responder {
    broker: Arc<dyn Broker>,
}

impl Responder {
    pub async fn respond(&self, callback_channel: &str, response: &WorkResponse) -> Result<(), BrokerError> {
        let mut codec = Codec::with_capacity(1024);
        let frame = codec.encode(response, MessageType::WorkResponse)?;
        self.broker.publish_response(callback_channel, frame).await
    }
}
