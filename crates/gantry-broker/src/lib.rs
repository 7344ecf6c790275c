//! Message broker plumbing for gantry.
//!
//! The gateway publishes [`WorkItem`](gantry_proto::WorkItem)s to a shared
//! work queue through a [`GatewayClient`] and waits for the matching response
//! on its private callback channel. The worker manager drains the same queue
//! with a [`BrokerConsumer`], one item at a time, settling each delivery
//! explicitly and publishing responses through a [`Responder`].
//!
//! Two backends implement [`Broker`]: [`MemoryBroker`] for tests and
//! single-process setups, and `ValkeyBroker` (feature `valkey`) for real
//! deployments.

mod client;
pub mod config;
mod consumer;
mod delivery;
mod error;
mod memory;
mod provider;
mod traits;
mod types;

#[cfg(feature = "valkey")]
mod valkey;

pub use client::GatewayClient;
pub use config::{duration, work_queue_name, BackendConfig, BrokerConfig};
pub use consumer::{BrokerConsumer, ConsumerHandle, Responder, Settlement};
pub use delivery::DeliveryTracker;
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use provider::connect;
pub use traits::Broker;
pub use types::{Delivery, DeliveryTag, ResponseStream};

#[cfg(feature = "valkey")]
pub use valkey::ValkeyBroker;
