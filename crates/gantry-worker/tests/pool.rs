//! Pool scheduler end to end over the in-memory broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_broker::{
    Broker, BrokerConfig, BrokerError, Delivery, DeliveryTag, GatewayClient, MemoryBroker, ResponseStream,
};
use gantry_proto::{Codec, MessageType, RequestId, WorkItem, WorkResponse};
use gantry_worker::{
    MemoryLogSink, Pool, PoolConfig, PoolSnapshot, ProcessConfig, WorkerConfig, WorkerError, WorkerState,
};
use tempfile::TempDir;

const SAMPLE_HANDLER: &str = env!("CARGO_BIN_EXE_gantry-sample-handler");

fn config(dir: &TempDir, max_processes: usize, replenish: bool) -> WorkerConfig {
    WorkerConfig {
        pool: PoolConfig {
            max_processes,
            replenish,
        },
        process: ProcessConfig {
            program: PathBuf::from(SAMPLE_HANDLER),
            code_path: dir.path().to_path_buf(),
            socket_dir: dir.path().to_path_buf(),
            request_timeout: Duration::from_millis(400),
            ..ProcessConfig::default()
        },
        broker: BrokerConfig {
            poll_interval: Duration::from_millis(50),
            ..BrokerConfig::default()
        },
    }
}

fn start(config: &WorkerConfig, broker: &MemoryBroker) -> Pool {
    Pool::start(config, Arc::new(broker.clone()), Arc::new(MemoryLogSink::new())).unwrap()
}

async fn wait_until(pool: &Pool, what: &str, check: impl Fn(&PoolSnapshot) -> bool) -> PoolSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = pool.snapshot().await.unwrap();
        if check(&snapshot) {
            return snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}: {snapshot:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn publish(broker: &MemoryBroker, item: &WorkItem) {
    let mut codec = Codec::new();
    let frame = codec.encode(item, MessageType::WorkItem).unwrap();
    broker
        .publish_work(&BrokerConfig::default().work_queue(), frame)
        .await
        .unwrap();
}

fn sockets_in(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".sock"))
        .count()
}

#[tokio::test]
async fn consumer_starts_once_a_worker_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let pool = start(&config(&dir, 2, false), &broker);

    let snapshot = wait_until(&pool, "all workers ready", |s| s.ready_count() == 2).await;
    assert!(snapshot.consuming);
    assert_eq!(snapshot.workers.len(), 2);
    assert!(snapshot.workers.iter().all(|(_, state)| *state == WorkerState::Ready));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn dispatches_and_publishes_response() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut responses = broker.subscribe_responses("cb").await.unwrap();
    let pool = start(&config(&dir, 1, false), &broker);
    wait_until(&pool, "a ready worker", |s| s.ready_count() == 1).await;

    let item = WorkItem::builder(RequestId::from("r1"), "cb")
        .body("incrementCounter")
        .build();
    publish(&broker, &item).await;

    let payload = tokio::time::timeout(Duration::from_secs(5), responses.recv())
        .await
        .unwrap()
        .unwrap();
    let response: WorkResponse = Codec::decode_frame(&payload, MessageType::WorkResponse).unwrap();
    assert_eq!(response.request_id, RequestId::from("r1"));
    assert_eq!(response.body, "1");

    // Acked on dispatch.
    assert_eq!(broker.unacked_len().await, 0);
    assert_eq!(broker.queue_len(&BrokerConfig::default().work_queue()).await, 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn gateway_round_trip_through_pool() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let pool = start(&config(&dir, 2, false), &broker);
    wait_until(&pool, "ready workers", |s| s.ready_count() == 2).await;

    let client = GatewayClient::connect(
        Arc::new(broker.clone()),
        &BrokerConfig::default(),
        Duration::from_secs(5),
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    let response = client
        .process(client.new_item(RequestId::from("r1")).body("simpleJsonReturn").build())
        .await;
    assert_eq!(response.status_code, 503);
    assert_eq!(response.body, "Hello Body");
    assert_eq!(response.header("X-CUSTOM-HEADER"), Some("xcustomvalue"));
    assert_eq!(response.request_id, RequestId::from("r1"));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn item_is_requeued_when_no_worker_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut responses = broker.subscribe_responses("cb").await.unwrap();
    let pool = start(&config(&dir, 1, false), &broker);
    wait_until(&pool, "a ready worker", |s| s.ready_count() == 1).await;

    // Occupy the only worker until it times out and dies.
    publish(&broker, &WorkItem::builder(RequestId::from("busy"), "cb").body("neverRespond").build()).await;
    wait_until(&pool, "the worker to be busy", |s| s.ready_count() == 0).await;

    publish(&broker, &WorkItem::builder(RequestId::from("waiting"), "cb").body("incrementCounter").build()).await;

    let payload = tokio::time::timeout(Duration::from_secs(5), responses.recv())
        .await
        .unwrap()
        .unwrap();
    let response: WorkResponse = Codec::decode_frame(&payload, MessageType::WorkResponse).unwrap();
    assert_eq!(response.request_id, RequestId::from("busy"));
    assert_eq!(response.status_code, 500);

    wait_until(&pool, "the dead worker to be removed", |s| s.workers.is_empty()).await;

    // Nothing served the second item; it is still owned by the broker.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(responses.try_recv().is_err());
    let queue = BrokerConfig::default().work_queue();
    assert_eq!(broker.queue_len(&queue).await + broker.unacked_len().await, 1);

    pool.shutdown().await.unwrap();
    assert_eq!(broker.unacked_len().await, 0);
}

#[tokio::test]
async fn expired_items_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut responses = broker.subscribe_responses("cb").await.unwrap();

    let item = WorkItem::builder(RequestId::from("stale"), "cb")
        .ttl(Duration::ZERO)
        .build();
    publish(&broker, &item).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let pool = start(&config(&dir, 1, false), &broker);
    wait_until(&pool, "a ready worker", |s| s.consuming).await;

    let queue = BrokerConfig::default().work_queue();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.queue_len(&queue).await + broker.unacked_len().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "expired item never settled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(responses.try_recv().is_err());
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.ready_count(), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn dead_workers_are_not_replaced_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let pool = start(&config(&dir, 1, false), &broker);
    wait_until(&pool, "a ready worker", |s| s.ready_count() == 1).await;

    publish(&broker, &WorkItem::builder(RequestId::from("r1"), "cb").body("killSelfError").build()).await;

    wait_until(&pool, "the worker to be removed", |s| s.workers.is_empty()).await;
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn replenish_replaces_dead_workers() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let pool = start(&config(&dir, 1, true), &broker);
    let before = wait_until(&pool, "a ready worker", |s| s.ready_count() == 1).await;
    let (original, _) = before.workers[0];

    publish(&broker, &WorkItem::builder(RequestId::from("r1"), "cb").body("killSelfError").build()).await;

    let after = wait_until(&pool, "a replacement worker", |s| {
        s.ready_count() == 1 && s.workers.iter().all(|(id, _)| *id != original)
    })
    .await;
    assert_eq!(after.workers.len(), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_destroys_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let pool = start(&config(&dir, 3, false), &broker);
    wait_until(&pool, "ready workers", |s| s.ready_count() == 3).await;
    assert_eq!(sockets_in(&dir), 3);

    pool.shutdown().await.unwrap();

    assert_eq!(sockets_in(&dir), 0);
    assert!(broker
        .publish_work(&BrokerConfig::default().work_queue(), b"x")
        .await
        .is_err());
}

/// Delegates to a memory broker but cannot be closed.
struct StuckBroker(MemoryBroker);

#[async_trait]
impl Broker for StuckBroker {
    async fn declare_work_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.0.declare_work_queue(queue).await
    }

    async fn publish_work(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.0.publish_work(queue, payload).await
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.0.receive(queue, wait).await
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.0.ack(tag).await
    }

    async fn nack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.0.nack(tag).await
    }

    async fn subscribe_responses(&self, channel: &str) -> Result<ResponseStream, BrokerError> {
        self.0.subscribe_responses(channel).await
    }

    async fn publish_response(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.0.publish_response(channel, payload).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Err(BrokerError::Backend("connection reset".to_owned()))
    }
}

#[tokio::test]
async fn shutdown_reports_broker_close_failure() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let pool = Pool::start(
        &config(&dir, 1, false),
        Arc::new(StuckBroker(broker.clone())),
        Arc::new(MemoryLogSink::new()),
    )
    .unwrap();
    wait_until(&pool, "a ready worker", |s| s.ready_count() == 1).await;

    let result = pool.shutdown().await;
    assert!(matches!(result, Err(WorkerError::Broker(BrokerError::Backend(_)))));
    // Workers are torn down regardless.
    assert_eq!(sockets_in(&dir), 0);
}
