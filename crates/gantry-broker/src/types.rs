use tokio::sync::mpsc;

/// Opaque broker-native handle identifying one delivery until it is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTag {
    queue: String,
    handle: Vec<u8>,
}

impl DeliveryTag {
    pub fn new(queue: impl Into<String>, handle: impl Into<Vec<u8>>) -> Self {
        Self {
            queue: queue.into(),
            handle: handle.into(),
        }
    }

    /// Queue the delivery came from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Backend-specific handle bytes.
    pub fn handle(&self) -> &[u8] {
        &self.handle
    }
}

/// A message taken from a work queue and not yet acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
}

/// Payloads published to a subscribed response channel.
pub type ResponseStream = mpsc::UnboundedReceiver<Vec<u8>>;
