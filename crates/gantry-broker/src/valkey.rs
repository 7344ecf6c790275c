//! Valkey/Redis broker backend.
//!
//! Work queues are lists. Publishers `LPUSH`, consumers `BLMOVE` the oldest
//! entry into an unacked list private to this broker instance, ack removes it
//! from there, and nack moves it back to the consuming end of the queue.
//! Responses travel over pub/sub, so they only reach a listening gateway.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::traits::Broker;
use crate::types::{Delivery, DeliveryTag, ResponseStream};

const REQUEUE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Shortest `BLMOVE` block. A zero timeout would wait until work arrives.
const MIN_BLOCK: Duration = Duration::from_millis(10);

fn block_timeout(wait: Duration) -> f64 {
    wait.max(MIN_BLOCK).as_secs_f64()
}

pub struct ValkeyBroker {
    pool: Pool,
    client: redis::Client,
    namespace: String,
    unacked_key: String,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl ValkeyBroker {
    pub async fn connect(url: &str, namespace: &str, pool_size: usize) -> Result<Self, BrokerError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let client = redis::Client::open(url).map_err(|e| BrokerError::Connection(e.to_string()))?;

        let broker = Self {
            pool,
            client,
            namespace: namespace.to_string(),
            unacked_key: format!("{namespace}:unacked:{}", Uuid::new_v4().simple()),
            listeners: Mutex::new(Vec::new()),
        };

        let mut conn = broker.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(broker)
    }

    async fn conn(&self) -> Result<Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    fn response_key(&self, channel: &str) -> String {
        format!("{}:responses:{}", self.namespace, channel)
    }
}

#[async_trait]
impl Broker for ValkeyBroker {
    async fn declare_work_queue(&self, queue: &str) -> Result<(), BrokerError> {
        // Lists spring into existence on first push; only check reachability.
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!(queue = %self.queue_key(queue), "work queue declared");
        Ok(())
    }

    async fn publish_work(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        conn.lpush::<_, _, ()>(self.queue_key(queue), payload)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.conn().await?;

        let payload: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(self.queue_key(queue))
            .arg(&self.unacked_key)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(block_timeout(wait))
            .query_async(&mut *conn)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        Ok(payload.map(|payload| Delivery {
            tag: DeliveryTag::new(queue, payload.clone()),
            payload,
        }))
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .lrem(&self.unacked_key, 1, tag.handle())
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        if removed == 0 {
            return Err(BrokerError::UnknownDelivery(tag.queue().to_string()));
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(REQUEUE_SCRIPT);
        let moved: i64 = script
            .key(&self.unacked_key)
            .key(self.queue_key(tag.queue()))
            .arg(tag.handle())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        if moved == 0 {
            return Err(BrokerError::UnknownDelivery(tag.queue().to_string()));
        }
        Ok(())
    }

    async fn subscribe_responses(&self, channel: &str) -> Result<ResponseStream, BrokerError> {
        let key = self.response_key(channel);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        pubsub
            .subscribe(&key)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<Vec<u8>>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %key, error = %e, "unreadable response payload"),
                }
            }
            debug!(channel = %key, "response subscription ended");
        });

        self.listeners.lock().await.push(listener);
        Ok(rx)
    }

    async fn publish_response(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(self.response_key(channel), payload)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        for listener in self.listeners.lock().await.drain(..) {
            listener.abort();
        }
        self.pool.close();
        Ok(())
    }
}
