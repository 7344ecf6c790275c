//! In-process broker for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::traits::Broker;
use crate::types::{Delivery, DeliveryTag, ResponseStream};

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
    next_tag: u64,
    subscribers: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    closed: bool,
}

impl MemoryState {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    arrivals: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting in `queue`.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries handed out but not yet settled, across all queues.
    pub async fn unacked_len(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    async fn try_take(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let Some(payload) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        let tag = state.next_tag;
        state.next_tag += 1;
        state.unacked.insert(tag, (queue.to_string(), payload.clone()));

        Ok(Some(Delivery {
            tag: DeliveryTag::new(queue, tag.to_be_bytes().to_vec()),
            payload,
        }))
    }

    fn tag_id(tag: &DeliveryTag) -> Result<u64, BrokerError> {
        let bytes: [u8; 8] = tag
            .handle()
            .try_into()
            .map_err(|_| BrokerError::Backend("malformed delivery tag".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_work_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish_work(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(payload.to_vec());
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a publish in between is not missed.
            let arrived = self.arrivals.notified();

            if let Some(delivery) = self.try_take(queue).await? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let id = Self::tag_id(tag)?;
        let mut state = self.state.lock().await;

        state
            .unacked
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(id.to_string()))
    }

    async fn nack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let id = Self::tag_id(tag)?;
        {
            let mut state = self.state.lock().await;
            let (queue, payload) = state
                .unacked
                .remove(&id)
                .ok_or_else(|| BrokerError::UnknownDelivery(id.to_string()))?;
            state.queues.entry(queue).or_default().push_front(payload);
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn subscribe_responses(&self, channel: &str) -> Result<ResponseStream, BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(channel.to_string(), tx);
        Ok(rx)
    }

    async fn publish_response(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        // Nobody listening means the response is dropped, as with pub/sub.
        if let Some(subscriber) = state.subscribers.get(channel) {
            if subscriber.send(payload.to_vec()).is_err() {
                state.subscribers.remove(channel);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.subscribers.clear();
        drop(state);

        self.arrivals.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "gantryrequests";

    #[tokio::test]
    async fn publish_receive_ack() {
        let broker = MemoryBroker::new();
        broker.declare_work_queue(QUEUE).await.unwrap();
        broker.publish_work(QUEUE, b"one").await.unwrap();

        let delivery = broker
            .receive(QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"one");
        assert_eq!(broker.unacked_len().await, 1);

        broker.ack(&delivery.tag).await.unwrap();
        assert_eq!(broker.unacked_len().await, 0);
        assert!(broker
            .receive(QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn nack_requeues_at_the_front() {
        let broker = MemoryBroker::new();
        broker.publish_work(QUEUE, b"first").await.unwrap();
        broker.publish_work(QUEUE, b"second").await.unwrap();

        let first = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        broker.nack(&first.tag).await.unwrap();

        let again = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.payload, b"first");
        assert_eq!(broker.queue_len(QUEUE).await, 1);
    }

    #[tokio::test]
    async fn settling_twice_is_an_error() {
        let broker = MemoryBroker::new();
        broker.publish_work(QUEUE, b"x").await.unwrap();
        let delivery = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();

        broker.ack(&delivery.tag).await.unwrap();
        assert!(matches!(
            broker.ack(&delivery.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
        assert!(matches!(
            broker.nack(&delivery.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let publisher = broker.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_work(QUEUE, b"late").await.unwrap();
        });

        let delivery = broker.receive(QUEUE, Duration::from_secs(5)).await.unwrap();
        assert_eq!(delivery.unwrap().payload, b"late");
    }

    #[tokio::test]
    async fn responses_reach_only_the_subscribed_channel() {
        let broker = MemoryBroker::new();
        let mut mine = broker.subscribe_responses("gateway-a").await.unwrap();

        broker.publish_response("gateway-a", b"for a").await.unwrap();
        broker.publish_response("gateway-b", b"for b").await.unwrap();

        assert_eq!(mine.recv().await.unwrap(), b"for a");
        assert!(mine.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_ends_response_streams() {
        let broker = MemoryBroker::new();
        let mut stream = broker.subscribe_responses("gateway").await.unwrap();

        broker.close().await.unwrap();
        assert!(stream.recv().await.is_none());
        assert!(matches!(
            broker.publish_work(QUEUE, b"x").await,
            Err(BrokerError::Closed)
        ));
    }
}
