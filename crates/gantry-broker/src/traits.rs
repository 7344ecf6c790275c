use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{Delivery, DeliveryTag, ResponseStream};

/// A message broker with manual acknowledgement.
///
/// Two kinds of channel are used: shared work queues, where each message is
/// delivered to one consumer and must be settled, and response channels, which
/// are fire-and-forget and only reach a subscriber that is currently listening.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a non-durable work queue. Idempotent.
    async fn declare_work_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish_work(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Takes the next message, waiting up to `wait` for one to arrive.
    ///
    /// The message stays owned by the broker until acked or nacked.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Settles a delivery as handled.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Returns a delivery to the front of its queue for redelivery.
    async fn nack(&self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Starts listening on a private response channel.
    async fn subscribe_responses(&self, channel: &str) -> Result<ResponseStream, BrokerError>;

    async fn publish_response(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Releases connections and ends every response stream.
    async fn close(&self) -> Result<(), BrokerError>;
}
