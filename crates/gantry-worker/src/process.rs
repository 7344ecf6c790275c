//! Supervision of one bridge worker process.
//!
//! A [`WorkerProcess`] is a handle. Starting it spawns the child and a
//! supervisor task that owns everything mutable: the child, its output pipes,
//! the bridge connection and the in-flight request. The handle talks to the
//! supervisor over a command channel, and every state change is published both
//! on a watch channel and to the pool's listener.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use gantry_proto::spawn::{CODE_PATH_ENV, HANDLER_ENV, READY_MARKER, SCHEMA_ENV, SOCKET_PATH_ENV};
use gantry_proto::transport::{read_message, write_message};
use gantry_proto::{BridgeMessage, Codec, ProtocolError, RequestId, SchemaDescriptor, WorkItem, WorkResponse};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RunAs;
use crate::error::WorkerError;
use crate::log_sink::LogSink;
use crate::state::{StateChange, WorkerId, WorkerState};

/// Time between SIGTERM and SIGKILL.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Everything needed to spawn and supervise one worker.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub handler: String,
    pub code_path: PathBuf,
    /// Exclusively owned by this worker; removed on cleanup.
    pub socket_path: PathBuf,
    pub request_timeout: Duration,
    pub spawn_timeout: Duration,
    pub run_as: Option<RunAs>,
}

impl ProcessOptions {
    /// How long a request may stay in flight before the worker is destroyed.
    #[must_use]
    pub fn request_deadline(&self) -> Duration {
        self.request_timeout.mul_f64(1.5)
    }
}

enum Control {
    Invoke {
        item: WorkItem,
        reply: oneshot::Sender<WorkResponse>,
    },
    Destroy(oneshot::Sender<Result<(), WorkerError>>),
}

/// Publishes state transitions. Owned by whoever currently drives the worker.
struct StateReporter {
    worker_id: WorkerId,
    state: watch::Sender<WorkerState>,
    listener: mpsc::UnboundedSender<StateChange>,
}

impl StateReporter {
    fn set(&self, state: WorkerState) {
        self.state.send_replace(state);
        debug!(worker_id = %self.worker_id, state = %state, "state changed");
        let _ = self.listener.send(StateChange {
            worker_id: self.worker_id,
            state,
        });
    }

    fn current(&self) -> WorkerState {
        *self.state.borrow()
    }
}

/// Handle to one supervised worker process.
pub struct WorkerProcess {
    id: WorkerId,
    options: ProcessOptions,
    log_sink: Arc<dyn LogSink>,
    state: watch::Receiver<WorkerState>,
    reporter: Option<StateReporter>,
    commands: Option<mpsc::UnboundedSender<Control>>,
}

impl WorkerProcess {
    /// Creates a worker in CREATING. Nothing is spawned until [`start`](Self::start).
    pub fn new(
        id: WorkerId,
        options: ProcessOptions,
        listener: mpsc::UnboundedSender<StateChange>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        let (state_tx, state) = watch::channel(WorkerState::Creating);
        Self {
            id,
            options,
            log_sink,
            state,
            reporter: Some(StateReporter {
                worker_id: id,
                state: state_tx,
                listener,
            }),
            commands: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Follows this worker's state.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.options.socket_path
    }

    /// Spawns the child and starts supervising it.
    ///
    /// Only legal in CREATING; any later call fails with
    /// [`WorkerError::AlreadyStarted`].
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.state() != WorkerState::Creating {
            return Err(WorkerError::AlreadyStarted(self.id));
        }
        let schema = SchemaDescriptor::current().to_base64()?;
        let Some(reporter) = self.reporter.take() else {
            return Err(WorkerError::AlreadyStarted(self.id));
        };

        let mut command = Command::new(&self.options.program);
        command
            .args(&self.options.args)
            .env_clear()
            .env(HANDLER_ENV, &self.options.handler)
            .env(CODE_PATH_ENV, &self.options.code_path)
            .env(SOCKET_PATH_ENV, &self.options.socket_path)
            .env(SCHEMA_ENV, schema)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(run_as) = self.options.run_as {
            command.uid(run_as.uid).gid(run_as.gid);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                reporter.set(WorkerState::Dead);
                return Err(WorkerError::Spawn {
                    program: self.options.program.clone(),
                    source,
                });
            }
        };

        info!(
            worker_id = %self.id,
            pid = ?child.id(),
            socket = %self.options.socket_path.display(),
            "worker spawned"
        );

        let stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let stderr = child.stderr.take().map(|err| BufReader::new(err).lines());
        reporter.set(WorkerState::Spawning);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            id: self.id,
            spawn_deadline: Instant::now() + self.options.spawn_timeout,
            options: self.options.clone(),
            reporter,
            log_sink: Arc::clone(&self.log_sink),
            child,
            exited: false,
            commands: command_rx,
            stdout,
            stderr,
            connection: None,
            in_flight: None,
            codec: Codec::with_capacity(8192),
        };
        tokio::spawn(supervisor.run());

        self.commands = Some(commands);
        Ok(())
    }

    /// A cloneable handle for dispatching requests to this worker.
    pub fn requester(&self) -> Requester {
        Requester {
            worker_id: self.id,
            state: self.state.clone(),
            commands: self.commands.clone(),
        }
    }

    /// See [`Requester::handle_request`].
    pub async fn handle_request(&self, item: WorkItem) -> WorkResponse {
        self.requester().handle_request(item).await
    }

    /// Terminates the worker and cleans up after it.
    ///
    /// A no-op in CREATING, DYING and DEAD. Resolves once cleanup is done.
    pub async fn destroy(&self) -> Result<(), WorkerError> {
        if self.state().is_undestroyable() {
            return Ok(());
        }
        let Some(commands) = &self.commands else {
            return Ok(());
        };

        let (reply, done) = oneshot::channel();
        if commands.send(Control::Destroy(reply)).is_err() {
            // Supervisor already finished.
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("socket_path", &self.options.socket_path)
            .finish_non_exhaustive()
    }
}

/// Dispatches requests to one worker.
#[derive(Clone)]
pub struct Requester {
    worker_id: WorkerId,
    state: watch::Receiver<WorkerState>,
    commands: Option<mpsc::UnboundedSender<Control>>,
}

impl Requester {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Sends `item` to the worker and waits for its response.
    ///
    /// A worker that is not READY answers immediately with the synthetic
    /// "unavailable" 500. A worker that dies or overruns its deadline with the
    /// request in flight answers with the "processing error" 500.
    pub async fn handle_request(&self, item: WorkItem) -> WorkResponse {
        let request_id = item.request_id.clone();

        if *self.state.borrow() != WorkerState::Ready {
            return WorkResponse::unavailable(request_id);
        }
        let Some(commands) = &self.commands else {
            return WorkResponse::unavailable(request_id);
        };

        let (reply, response) = oneshot::channel();
        if commands.send(Control::Invoke { item, reply }).is_err() {
            return WorkResponse::unavailable(request_id);
        }

        response
            .await
            .unwrap_or_else(|_| WorkResponse::processing_error(request_id))
    }
}

struct InFlight {
    request_id: RequestId,
    reply: oneshot::Sender<WorkResponse>,
    deadline: Instant,
}

/// Open bridge connection. Frames are read on a separate task so a partially
/// read frame is never lost to a `select!`.
struct Connection {
    writer: OwnedWriteHalf,
    frames: mpsc::Receiver<Result<BridgeMessage, ProtocolError>>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn open(stream: UnixStream) -> Self {
        let (mut read_half, writer) = stream.into_split();
        let (tx, frames) = mpsc::channel(4);

        let reader = tokio::spawn(async move {
            loop {
                match read_message(&mut read_half).await {
                    Ok(Some(message)) => {
                        if tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Self {
            writer,
            frames,
            reader,
        }
    }
}

enum Event {
    Control(Option<Control>),
    Stdout(std::io::Result<Option<String>>),
    Stderr(std::io::Result<Option<String>>),
    Frame(Option<Result<BridgeMessage, ProtocolError>>),
    Exited(std::io::Result<ExitStatus>),
    Deadline,
}

enum Flow {
    Continue,
    Stop,
}

struct Supervisor {
    id: WorkerId,
    options: ProcessOptions,
    reporter: StateReporter,
    log_sink: Arc<dyn LogSink>,
    child: Child,
    exited: bool,
    commands: mpsc::UnboundedReceiver<Control>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    connection: Option<Connection>,
    in_flight: Option<InFlight>,
    spawn_deadline: Instant,
    codec: Codec,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline();
            let event = tokio::select! {
                command = self.commands.recv() => Event::Control(command),
                line = next_line(&mut self.stdout) => Event::Stdout(line),
                line = next_line(&mut self.stderr) => Event::Stderr(line),
                frame = next_frame(&mut self.connection) => Event::Frame(frame),
                status = self.child.wait(), if !self.exited => Event::Exited(status),
                () = sleep_until(deadline) => Event::Deadline,
            };

            if let Flow::Stop = self.handle(event).await {
                break;
            }
        }
        debug!(worker_id = %self.id, "supervisor stopped");
    }

    fn deadline(&self) -> Option<Instant> {
        if self.reporter.current() == WorkerState::Spawning {
            return Some(self.spawn_deadline);
        }
        self.in_flight.as_ref().map(|in_flight| in_flight.deadline)
    }

    async fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::Control(Some(Control::Invoke { item, reply })) => {
                self.invoke(item, reply).await;
                Flow::Continue
            }
            Event::Control(Some(Control::Destroy(reply))) => {
                let result = self.destroy().await;
                let _ = reply.send(result);
                Flow::Stop
            }
            Event::Control(None) => {
                debug!(worker_id = %self.id, "handle dropped");
                self.terminate().await
            }
            Event::Stdout(Ok(Some(line))) => self.on_stdout(line).await,
            Event::Stdout(result) => {
                if let Err(e) = result {
                    warn!(worker_id = %self.id, error = %e, "failed to read worker stdout");
                }
                self.stdout = None;
                Flow::Continue
            }
            Event::Stderr(Ok(Some(line))) => {
                info!(worker_id = %self.id, "{line}");
                Flow::Continue
            }
            Event::Stderr(_) => {
                self.stderr = None;
                Flow::Continue
            }
            Event::Frame(Some(Ok(message))) => self.on_message(message).await,
            Event::Frame(Some(Err(e))) => {
                warn!(worker_id = %self.id, error = %e, "bridge protocol error");
                self.terminate().await
            }
            Event::Frame(None) => {
                debug!(worker_id = %self.id, "bridge connection closed");
                self.terminate().await
            }
            Event::Exited(status) => {
                self.exited = true;
                match status {
                    Ok(status) => info!(worker_id = %self.id, %status, "worker exited"),
                    Err(e) => warn!(worker_id = %self.id, error = %e, "failed to wait for worker"),
                }
                self.terminate().await
            }
            Event::Deadline => self.on_deadline().await,
        }
    }

    async fn on_stdout(&mut self, line: String) -> Flow {
        if line.trim_end() != READY_MARKER || self.reporter.current() != WorkerState::Spawning {
            info!(worker_id = %self.id, "{line}");
            return Flow::Continue;
        }

        match UnixStream::connect(&self.options.socket_path).await {
            Ok(stream) => {
                self.connection = Some(Connection::open(stream));
                self.reporter.set(WorkerState::Ready);
                Flow::Continue
            }
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "failed to connect to worker");
                self.terminate().await
            }
        }
    }

    async fn invoke(&mut self, item: WorkItem, reply: oneshot::Sender<WorkResponse>) {
        if self.reporter.current() != WorkerState::Ready || self.in_flight.is_some() {
            let _ = reply.send(WorkResponse::unavailable(item.request_id));
            return;
        }

        let request_id = item.request_id.clone();
        self.in_flight = Some(InFlight {
            request_id: request_id.clone(),
            reply,
            deadline: Instant::now() + self.options.request_deadline(),
        });
        self.reporter.set(WorkerState::RequestSent);

        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        // The deadline resolves the request if this fails.
        if let Err(e) = write_message(
            &mut connection.writer,
            &mut self.codec,
            &BridgeMessage::Invoke(item),
        )
        .await
        {
            warn!(worker_id = %self.id, request_id = %request_id, error = %e, "failed to send request");
        }
    }

    async fn on_message(&mut self, message: BridgeMessage) -> Flow {
        let response = match message {
            BridgeMessage::Response(response) => response,
            BridgeMessage::Invoke(_) => {
                warn!(worker_id = %self.id, "worker sent an invoke");
                return self.terminate().await;
            }
        };

        let request_id = &response.callback_data.request_id;
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if &in_flight.request_id == request_id => in_flight,
            other => {
                self.in_flight = other;
                debug!(worker_id = %self.id, request_id = %request_id, "discarding stale response");
                return Flow::Continue;
            }
        };

        self.reporter.set(WorkerState::Ready);
        for record in &response.logs {
            self.log_sink.write(self.id, record);
        }
        let _ = in_flight.reply.send(response.callback_data);
        Flow::Continue
    }

    async fn on_deadline(&mut self) -> Flow {
        if self.reporter.current() == WorkerState::Spawning {
            warn!(
                worker_id = %self.id,
                timeout = ?self.options.spawn_timeout,
                "worker did not become ready"
            );
            return self.terminate().await;
        }

        if let Some(in_flight) = &self.in_flight {
            warn!(
                worker_id = %self.id,
                request_id = %in_flight.request_id,
                timeout = ?self.options.request_deadline(),
                "request timed out"
            );
            self.reporter.set(WorkerState::TimedOut);
            return self.terminate().await;
        }

        Flow::Continue
    }

    /// Destroys the worker from inside the supervisor and stops.
    async fn terminate(&mut self) -> Flow {
        if let Err(e) = self.destroy().await {
            error!(worker_id = %self.id, error = %e, "worker cleanup failed");
        }
        Flow::Stop
    }

    async fn destroy(&mut self) -> Result<(), WorkerError> {
        if self.reporter.current().is_undestroyable() {
            return Ok(());
        }
        self.reporter.set(WorkerState::Dying);

        if !self.exited {
            self.send_sigterm();
            match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, self.child.wait()).await {
                Ok(Ok(status)) => debug!(worker_id = %self.id, %status, "worker terminated"),
                Ok(Err(e)) => warn!(worker_id = %self.id, error = %e, "failed to wait for worker"),
                Err(_) => {
                    debug!(worker_id = %self.id, "grace period elapsed, killing worker");
                    if let Err(e) = self.child.kill().await {
                        warn!(worker_id = %self.id, error = %e, "failed to kill worker");
                    }
                }
            }
            self.exited = true;
        }

        self.cleanup()
    }

    fn send_sigterm(&self) {
        let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(worker_id = %self.id, error = %e, "failed to send SIGTERM");
        }
    }

    /// Releases everything the worker owned and marks it DEAD.
    ///
    /// The socket file is gone before DEAD is published, and DEAD is published
    /// before the in-flight request resolves.
    fn cleanup(&mut self) -> Result<(), WorkerError> {
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
        }

        let removed = match std::fs::remove_file(&self.options.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkerError::Cleanup {
                path: self.options.socket_path.clone(),
                source,
            }),
        };

        self.reporter.set(WorkerState::Dead);

        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight
                .reply
                .send(WorkResponse::processing_error(in_flight.request_id));
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Control::Invoke { item, reply } => {
                    let _ = reply.send(WorkResponse::unavailable(item.request_id));
                }
                Control::Destroy(reply) => {
                    let _ = reply.send(Ok(()));
                }
            }
        }

        info!(worker_id = %self.id, "worker dead");
        removed
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(connection: &mut Option<Connection>) -> Option<Result<BridgeMessage, ProtocolError>> {
    match connection {
        Some(connection) => connection.frames.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
