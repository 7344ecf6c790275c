use gantry_proto::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("No delivery in flight for request {0}")]
    UnknownDelivery(String),

    #[error("Request {0} already has a delivery in flight")]
    DuplicateDelivery(String),

    #[error("Broker connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
