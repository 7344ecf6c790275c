//! Pool scheduler: a fixed set of worker processes fed from the broker.
//!
//! The pool runs as a single task. It learns about workers only through their
//! state changes, keeps a FIFO of READY workers, and starts consuming the work
//! queue once the first worker is READY.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use gantry_broker::{Broker, BrokerConfig, BrokerConsumer, ConsumerHandle};
use gantry_proto::{now_millis, WorkItem};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ProcessConfig, WorkerConfig};
use crate::error::WorkerError;
use crate::log_sink::LogSink;
use crate::process::WorkerProcess;
use crate::state::{StateChange, WorkerId, WorkerState};

/// Workers eligible for dispatch, oldest-ready first.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: VecDeque<WorkerId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a worker unless it is already queued.
    pub fn push(&mut self, id: WorkerId) {
        if !self.queue.contains(&id) {
            self.queue.push_back(id);
        }
    }

    pub fn remove(&mut self, id: WorkerId) {
        self.queue.retain(|queued| *queued != id);
    }

    /// Pops the oldest worker for which `is_ready` holds, discarding stale
    /// entries on the way.
    pub fn pop_ready(&mut self, mut is_ready: impl FnMut(WorkerId) -> bool) -> Option<WorkerId> {
        while let Some(id) = self.queue.pop_front() {
            if is_ready(id) {
                return Some(id);
            }
            debug!(worker_id = %id, "skipping stale ready entry");
        }
        None
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.queue.iter().copied()
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub workers: Vec<(WorkerId, WorkerState)>,
    pub ready: Vec<WorkerId>,
    pub consuming: bool,
}

impl PoolSnapshot {
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }
}

enum PoolCommand {
    Snapshot(oneshot::Sender<PoolSnapshot>),
    Shutdown(oneshot::Sender<Result<(), WorkerError>>),
}

/// Handle to a running pool.
pub struct Pool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    task: JoinHandle<()>,
}

impl Pool {
    /// Starts `pool.max_processes` workers and the scheduler task.
    ///
    /// Any worker failing to start aborts construction; workers already
    /// started are torn down as their handles drop.
    pub fn start(
        config: &WorkerConfig,
        broker: Arc<dyn Broker>,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Self, WorkerError> {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let mut scheduler = Scheduler {
            workers: HashMap::new(),
            ready: ReadyQueue::new(),
            state_tx,
            state_changes: state_rx,
            commands: command_rx,
            broker,
            broker_config: config.broker.clone(),
            process_config: config.process.clone(),
            replenish: config.pool.replenish,
            log_sink,
            consumer: None,
            work: None,
            shutting_down: false,
        };

        for _ in 0..config.pool.max_processes {
            scheduler.spawn_worker()?;
        }
        info!(
            workers = config.pool.max_processes,
            replenish = config.pool.replenish,
            "worker pool started"
        );

        let task = tokio::spawn(scheduler.run());
        Ok(Self { commands, task })
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot, WorkerError> {
        let (reply, snapshot) = oneshot::channel();
        self.commands
            .send(PoolCommand::Snapshot(reply))
            .map_err(|_| WorkerError::PoolStopped)?;
        snapshot.await.map_err(|_| WorkerError::PoolStopped)
    }

    /// Stops consuming, destroys every worker and closes the broker.
    ///
    /// A worker cleanup failure is reported ahead of a broker close failure.
    /// In-flight requests are not drained; they resolve with the processing
    /// error response as their workers die.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(PoolCommand::Shutdown(reply))
            .map_err(|_| WorkerError::PoolStopped)?;
        let result = done.await.map_err(|_| WorkerError::PoolStopped)?;

        if let Err(e) = self.task.await {
            warn!(error = %e, "pool task failed");
        }
        result
    }
}

struct Scheduler {
    workers: HashMap<WorkerId, WorkerProcess>,
    ready: ReadyQueue,
    state_tx: mpsc::UnboundedSender<StateChange>,
    state_changes: mpsc::UnboundedReceiver<StateChange>,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    broker: Arc<dyn Broker>,
    broker_config: BrokerConfig,
    process_config: ProcessConfig,
    replenish: bool,
    log_sink: Arc<dyn LogSink>,
    consumer: Option<ConsumerHandle>,
    work: Option<mpsc::Receiver<WorkItem>>,
    shutting_down: bool,
}

impl Scheduler {
    fn spawn_worker(&mut self) -> Result<WorkerId, WorkerError> {
        let id = WorkerId::generate();
        let mut worker = WorkerProcess::new(
            id,
            self.process_config.options_for(id),
            self.state_tx.clone(),
            Arc::clone(&self.log_sink),
        );
        worker.start()?;
        self.workers.insert(id, worker);
        Ok(id)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PoolCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(PoolCommand::Shutdown(reply)) => {
                        let _ = reply.send(self.shutdown().await);
                        break;
                    }
                    None => {
                        if let Err(e) = self.shutdown().await {
                            error!(error = %e, "pool shutdown failed");
                        }
                        break;
                    }
                },
                Some(change) = self.state_changes.recv() => self.on_state_change(change).await,
                item = next_item(&mut self.work) => match item {
                    Some(item) => self.dispatch(item),
                    None => {
                        warn!("work stream ended");
                        self.work = None;
                    }
                },
            }
        }
        debug!("pool stopped");
    }

    async fn on_state_change(&mut self, change: StateChange) {
        let StateChange { worker_id, state } = change;

        match state {
            WorkerState::Ready => {
                if !self.workers.contains_key(&worker_id) {
                    return;
                }
                self.ready.push(worker_id);
                if self.consumer.is_none() && !self.shutting_down {
                    self.start_consumer().await;
                }
            }
            WorkerState::Dead => {
                self.ready.remove(worker_id);
                if self.workers.remove(&worker_id).is_none() {
                    return;
                }
                info!(worker_id = %worker_id, remaining = self.workers.len(), "worker removed from pool");

                if self.replenish && !self.shutting_down {
                    match self.spawn_worker() {
                        Ok(replacement) => info!(worker_id = %replacement, "replacement worker started"),
                        Err(e) => error!(error = %e, "failed to start replacement worker"),
                    }
                }
            }
            _ => self.ready.remove(worker_id),
        }
    }

    async fn start_consumer(&mut self) {
        match BrokerConsumer::start(Arc::clone(&self.broker), &self.broker_config).await {
            Ok((handle, work)) => {
                info!(queue = %self.broker_config.work_queue(), "first worker ready, consuming");
                self.consumer = Some(handle);
                self.work = Some(work);
            }
            // Retried on the next READY.
            Err(e) => error!(error = %e, "failed to start broker consumer"),
        }
    }

    fn dispatch(&mut self, item: WorkItem) {
        let Some(consumer) = &self.consumer else {
            return;
        };
        let request_id = item.request_id.clone();

        if item.is_expired(now_millis()) {
            warn!(request_id = %request_id, "dropping expired work item");
            consumer.ack(request_id);
            return;
        }

        let workers = &self.workers;
        let worker = self
            .ready
            .pop_ready(|id| workers.get(&id).is_some_and(|w| w.state() == WorkerState::Ready))
            .and_then(|id| workers.get(&id));

        let Some(worker) = worker else {
            info!(request_id = %request_id, "no ready worker, requeueing");
            consumer.nack(request_id);
            return;
        };

        // Settled before the handler runs; a worker crash after this loses the item.
        consumer.ack(request_id.clone());

        let requester = worker.requester();
        let responder = consumer.responder();
        debug!(request_id = %request_id, worker_id = %requester.worker_id(), "dispatching");

        tokio::spawn(async move {
            let callback_channel = item.callback_channel.clone();
            let response = requester.handle_request(item).await;
            if let Err(e) = responder.respond(&callback_channel, &response).await {
                warn!(request_id = %request_id, error = %e, "failed to publish response");
            }
        });
    }

    fn snapshot(&self) -> PoolSnapshot {
        let mut workers: Vec<_> = self
            .workers
            .values()
            .map(|worker| (worker.id(), worker.state()))
            .collect();
        workers.sort_by_key(|(id, _)| *id);

        PoolSnapshot {
            workers,
            ready: self.ready.iter().collect(),
            consuming: self.consumer.is_some(),
        }
    }

    async fn shutdown(&mut self) -> Result<(), WorkerError> {
        self.shutting_down = true;
        info!(workers = self.workers.len(), "shutting down worker pool");

        if let Some(consumer) = self.consumer.take() {
            consumer.shutdown().await;
        }
        self.work = None;

        let results = join_all(self.workers.values().map(|worker| worker.destroy())).await;
        self.workers.clear();
        self.ready = ReadyQueue::new();

        let closed = self.broker.close().await;
        if let Err(e) = &closed {
            warn!(error = %e, "failed to close broker");
        }

        results.into_iter().collect::<Result<(), _>>()?;
        closed.map_err(WorkerError::from)
    }
}

async fn next_item(work: &mut Option<mpsc::Receiver<WorkItem>>) -> Option<WorkItem> {
    match work {
        Some(work) => work.recv().await,
        None => std::future::pending().await,
    }
}
