use std::sync::Arc;

use tracing::info;

use crate::config::{BackendConfig, BrokerConfig};
use crate::error::BrokerError;
use crate::memory::MemoryBroker;
use crate::traits::Broker;

#[cfg(feature = "valkey")]
use crate::valkey::ValkeyBroker;

/// Opens the backend named in the configuration.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
    match &config.backend {
        BackendConfig::Memory => {
            info!("using in-memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        #[cfg(feature = "valkey")]
        BackendConfig::Valkey {
            url,
            namespace,
            pool_size,
        } => {
            let broker = ValkeyBroker::connect(url, namespace, *pool_size).await?;
            info!(namespace = %namespace, "connected to valkey broker");
            Ok(Arc::new(broker))
        }
    }
}
