//! The stream worker: sole owner of the upstream connection.
//!
//! The worker runs on its own OS thread with a current-thread runtime. Its loop applies control
//! commands to the registry, forwards upstream events through the pipeline and dispatcher, and
//! then re-evaluates the connection against the registry. Connects and disconnects run as tasks
//! whose completions come back through an internal channel, so commands keep flowing while a
//! connection is being opened or torn down. A new connection is only opened from `Idle`, which
//! is reached only after the previous connection confirmed its teardown.

use std::{
    any::Any,
    collections::BTreeSet,
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    thread,
    time::Duration,
};

use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinError,
    time::Instant,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    control::{ControlCommand, ControlReceiver, Polled},
    dispatch::Dispatcher,
    pipeline::MessagePipeline,
    registry::SessionRegistry,
    upstream::{EventSink, Upstream, UpstreamConnection, UpstreamError, UpstreamSignal},
};

const WORKER_THREAD_NAME: &str = "stream-worker";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Longest the loop waits for a control command before re-evaluating.
    pub poll_interval: Duration,
    /// Delay before reconnecting after a transient upstream failure.
    pub reconnect_backoff: Duration,
    pub max_batch: usize,
    /// Capacity of the channel between the open connection and the worker loop.
    pub event_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            reconnect_backoff: Duration::from_secs(2),
            max_batch: 64,
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on every worker transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    /// Generation of the most recent connection attempt.
    pub generation: u64,
    /// Filters of the most recent connection attempt.
    pub filters: BTreeSet<String>,
    /// Connections opened after the first one.
    pub restarts: u64,
    /// Set after a rate limit until the next filter registration.
    pub suppressed: bool,
    pub terminated: bool,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self {
            state: StreamState::Idle,
            generation: 0,
            filters: BTreeSet::new(),
            restarts: 0,
            suppressed: false,
            terminated: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("stream worker panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn stream worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to build stream worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("stream worker already exited: {0}")]
    Exited(String),
}

enum Completion {
    Connected {
        generation: u64,
        result: Result<Box<dyn UpstreamConnection>, UpstreamError>,
    },
    Disconnected {
        generation: u64,
    },
    /// A connect or disconnect task panicked or was cancelled before reporting.
    Crashed {
        generation: u64,
        phase: &'static str,
        reason: String,
    },
}

pub struct StreamWorker {
    config: WorkerConfig,
    registry: Arc<SessionRegistry>,
    upstream: Arc<dyn Upstream>,
    pipeline: MessagePipeline,
    dispatcher: Dispatcher,
    control: ControlReceiver,
    state: StreamState,
    generation: u64,
    connects: u64,
    active_filters: BTreeSet<String>,
    connection: Option<Box<dyn UpstreamConnection>>,
    /// The connection being opened already reported a failure.
    failed_while_starting: bool,
    suppressed: bool,
    retry_at: Option<Instant>,
    shutting_down: bool,
    control_open: bool,
    fatal: Option<WorkerError>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    signals_tx: mpsc::Sender<(u64, UpstreamSignal)>,
    signals_rx: mpsc::Receiver<(u64, UpstreamSignal)>,
    status: watch::Sender<StreamStatus>,
}

impl StreamWorker {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<SessionRegistry>,
        upstream: Arc<dyn Upstream>,
        pipeline: MessagePipeline,
        control: ControlReceiver,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::channel(config.event_buffer.max(1));
        let (status, _) = watch::channel(StreamStatus::default());
        Self {
            dispatcher: Dispatcher::new(registry.clone()),
            config,
            registry,
            upstream,
            pipeline,
            control,
            state: StreamState::Idle,
            generation: 0,
            connects: 0,
            active_filters: BTreeSet::new(),
            connection: None,
            failed_while_starting: false,
            suppressed: false,
            retry_at: None,
            shutting_down: false,
            control_open: true,
            fatal: None,
            completions_tx,
            completions_rx,
            signals_tx,
            signals_rx,
            status,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    /// Starts the worker on a dedicated thread. A panic inside the loop is caught and reported
    /// through the returned handle rather than tearing the process down silently.
    pub fn spawn(self) -> Result<StreamWorkerHandle, WorkerError> {
        let status = self.status.subscribe();
        let registry = self.registry.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(WorkerError::Runtime)?;
                    runtime.block_on(self.run())
                }));
                let result = match outcome {
                    Ok(result) => result,
                    Err(payload) => {
                        registry.clear();
                        Err(WorkerError::Panicked(panic_message(payload)))
                    }
                };
                if let Err(err) = &result {
                    error!(target = "stream.worker", error = %err, "stream worker terminated");
                }
                let _ = done_tx.send(result);
            })
            .map_err(WorkerError::Spawn)?;
        Ok(StreamWorkerHandle {
            thread,
            done: done_rx,
            status,
            outcome: None,
        })
    }

    /// Runs until shutdown is requested (or every control sender is dropped) and the
    /// connection is torn down, or until a fatal fault: rejected credentials or a crashed
    /// connect/disconnect task.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(target = "stream.worker", "stream worker started");
        self.publish_status();
        loop {
            let wait = self.next_wait();
            tokio::select! {
                biased;
                Some(completion) = self.completions_rx.recv() => self.on_completion(completion),
                polled = self.control.poll(wait, self.config.max_batch), if self.control_open => {
                    self.on_polled(polled)
                }
                Some((generation, signal)) = self.signals_rx.recv() => {
                    self.on_signal(generation, signal)
                }
            }
            self.evaluate();
            if self.state == StreamState::Idle && (self.shutting_down || self.fatal.is_some()) {
                break;
            }
        }

        self.registry.clear();
        let status = self.status.borrow().clone();
        self.status.send_replace(StreamStatus {
            terminated: true,
            ..status
        });
        match self.fatal.take() {
            Some(err) => Err(err),
            None => {
                info!(target = "stream.worker", "stream worker stopped");
                Ok(())
            }
        }
    }

    fn next_wait(&self) -> Duration {
        match self.retry_at {
            Some(at) if self.state == StreamState::Idle => {
                let until = at.saturating_duration_since(Instant::now());
                until.min(self.config.poll_interval)
            }
            _ => self.config.poll_interval,
        }
    }

    fn on_polled(&mut self, polled: Polled) {
        match polled {
            Polled::Idle => {}
            Polled::Closed => {
                info!(target = "stream.worker", "control channel closed; shutting down");
                self.control_open = false;
                self.shutting_down = true;
            }
            Polled::Batch(commands) => {
                for command in commands {
                    self.apply(command);
                }
            }
        }
    }

    fn apply(&mut self, command: ControlCommand) {
        counter!("track_mux_control_commands_total", 1, "kind" => command.kind());
        match command {
            ControlCommand::RegisterFilter {
                session_id,
                keyword,
            } => {
                let changed = self.registry.register(&session_id, &keyword);
                if self.suppressed {
                    info!(
                        target = "stream.worker",
                        session_id = %session_id,
                        "new registration lifts rate-limit suppression"
                    );
                    self.suppressed = false;
                    self.publish_status();
                }
                debug!(
                    target = "stream.worker",
                    session_id = %session_id,
                    keyword = %keyword,
                    changed,
                    "filter registered"
                );
            }
            ControlCommand::UnregisterSession { session_id } => {
                let changed = self.registry.unregister(&session_id);
                debug!(
                    target = "stream.worker",
                    session_id = %session_id,
                    changed,
                    "session unregistered"
                );
            }
            ControlCommand::SyncSessions { live, taken_at } => {
                let before = self.registry.len();
                let changed = self.registry.retain(&live, taken_at);
                let pruned = before.saturating_sub(self.registry.len());
                if pruned > 0 {
                    info!(
                        target = "stream.worker",
                        pruned, changed, "pruned sessions without a live socket"
                    );
                }
            }
            ControlCommand::Shutdown => {
                info!(target = "stream.worker", "shutdown requested");
                self.shutting_down = true;
            }
        }
        gauge!("track_mux_sessions", self.registry.len() as f64);
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected { generation, result } => {
                if generation != self.generation || self.state != StreamState::Starting {
                    warn!(
                        target = "stream.worker",
                        generation, "ignoring completion for a stale connect"
                    );
                    return;
                }
                match result {
                    Ok(connection) => {
                        info!(
                            target = "stream.worker",
                            generation,
                            filters = ?self.active_filters,
                            "upstream connected"
                        );
                        self.connection = Some(connection);
                        self.set_state(StreamState::Running);
                        if self.failed_while_starting {
                            self.stop("upstream failed while connecting");
                        }
                    }
                    Err(err) => {
                        counter!(
                            "track_mux_upstream_errors_total",
                            1,
                            "kind" => err.metric_label()
                        );
                        warn!(
                            target = "stream.worker",
                            generation,
                            error = %err,
                            "upstream connect failed"
                        );
                        self.note_failure(err);
                        self.set_state(StreamState::Idle);
                    }
                }
            }
            Completion::Disconnected { generation } => {
                if generation != self.generation || self.state != StreamState::Stopping {
                    warn!(
                        target = "stream.worker",
                        generation, "ignoring completion for a stale disconnect"
                    );
                    return;
                }
                counter!("track_mux_upstream_disconnects_total", 1);
                info!(target = "stream.worker", generation, "upstream disconnected");
                self.set_state(StreamState::Idle);
            }
            Completion::Crashed {
                generation,
                phase,
                reason,
            } => {
                counter!("track_mux_task_crashes_total", 1, "phase" => phase);
                error!(
                    target = "stream.worker",
                    generation,
                    phase,
                    reason = %reason,
                    "upstream task crashed"
                );
                self.connection = None;
                self.fatal = Some(WorkerError::Panicked(format!(
                    "upstream {phase} task: {reason}"
                )));
                if generation == self.generation
                    && matches!(self.state, StreamState::Starting | StreamState::Stopping)
                {
                    self.set_state(StreamState::Idle);
                }
            }
        }
    }

    fn on_signal(&mut self, generation: u64, signal: UpstreamSignal) {
        let current = generation == self.generation
            && matches!(self.state, StreamState::Starting | StreamState::Running);
        if !current {
            trace!(
                target = "stream.worker",
                generation,
                current = self.generation,
                "discarding signal from a retired connection"
            );
            return;
        }
        match signal {
            UpstreamSignal::Event(event) => {
                if let Some(message) = self.pipeline.process(&event) {
                    let metrics = self.dispatcher.dispatch(&message);
                    trace!(
                        target = "stream.dispatch",
                        delivered = metrics.delivered,
                        closed = metrics.closed,
                        dropped = metrics.dropped,
                        missing = metrics.missing,
                        "message dispatched"
                    );
                }
            }
            UpstreamSignal::Error(err) => {
                counter!(
                    "track_mux_upstream_errors_total",
                    1,
                    "kind" => err.metric_label()
                );
                warn!(
                    target = "stream.worker",
                    generation,
                    error = %err,
                    "upstream reported an error"
                );
                self.note_failure(err);
                self.fail_connection("upstream error");
            }
            UpstreamSignal::Closed => {
                warn!(target = "stream.worker", generation, "upstream closed the stream");
                self.note_failure(UpstreamError::Transient("stream ended".into()));
                self.fail_connection("upstream closed");
            }
        }
    }

    fn note_failure(&mut self, err: UpstreamError) {
        match err {
            UpstreamError::RateLimited => {
                warn!(
                    target = "stream.worker",
                    "rate limited; waiting for a new registration before reconnecting"
                );
                self.suppressed = true;
            }
            UpstreamError::Unauthorized(_) => {
                error!(target = "stream.worker", error = %err, "upstream refused credentials");
                self.fatal = Some(err.into());
            }
            UpstreamError::Transient(_) => {
                self.retry_at = Some(Instant::now() + self.config.reconnect_backoff);
            }
        }
    }

    fn fail_connection(&mut self, reason: &'static str) {
        match self.state {
            StreamState::Running => self.stop(reason),
            StreamState::Starting => self.failed_while_starting = true,
            StreamState::Idle | StreamState::Stopping => {}
        }
    }

    /// Brings the connection in line with the registry. Only `Idle` may open a connection and
    /// only `Running` may begin a teardown; `Starting` and `Stopping` wait for their completion.
    fn evaluate(&mut self) {
        match self.state {
            StreamState::Idle => {
                if self.shutting_down || self.fatal.is_some() || self.suppressed {
                    return;
                }
                if let Some(at) = self.retry_at {
                    if Instant::now() < at {
                        return;
                    }
                    self.retry_at = None;
                }
                let desired = self.registry.snapshot_filters();
                if !desired.is_empty() {
                    self.start(desired);
                }
            }
            StreamState::Running => {
                if self.shutting_down || self.fatal.is_some() {
                    self.stop("shutdown");
                    return;
                }
                let desired = self.registry.snapshot_filters();
                if desired.is_empty() {
                    self.stop("no filters left");
                } else if desired != self.active_filters {
                    self.stop("filter set changed");
                }
            }
            StreamState::Starting | StreamState::Stopping => {}
        }
    }

    fn start(&mut self, filters: BTreeSet<String>) {
        self.generation += 1;
        self.connects += 1;
        let generation = self.generation;
        if self.connects > 1 {
            counter!("track_mux_upstream_restarts_total", 1);
        }
        counter!("track_mux_upstream_connects_total", 1);
        info!(
            target = "stream.worker",
            generation,
            filters = ?filters,
            "connecting upstream"
        );

        self.active_filters = filters.clone();
        self.failed_while_starting = false;
        self.set_state(StreamState::Starting);

        let upstream = self.upstream.clone();
        let sink = EventSink::new(generation, self.signals_tx.clone());
        let done = self.completions_tx.clone();
        let task = tokio::spawn(async move { upstream.connect(filters, sink).await });
        tokio::spawn(async move {
            let completion = match task.await {
                Ok(result) => Completion::Connected { generation, result },
                Err(err) => Completion::Crashed {
                    generation,
                    phase: "connect",
                    reason: join_failure(err),
                },
            };
            let _ = done.send(completion);
        });
    }

    fn stop(&mut self, reason: &'static str) {
        if self.state != StreamState::Running {
            return;
        }
        let generation = self.generation;
        let Some(mut connection) = self.connection.take() else {
            self.set_state(StreamState::Idle);
            return;
        };
        info!(target = "stream.worker", generation, reason, "disconnecting upstream");
        self.set_state(StreamState::Stopping);

        let done = self.completions_tx.clone();
        let task = tokio::spawn(async move {
            connection.disconnect().await;
            drop(connection);
        });
        tokio::spawn(async move {
            let completion = match task.await {
                Ok(()) => Completion::Disconnected { generation },
                Err(err) => Completion::Crashed {
                    generation,
                    phase: "disconnect",
                    reason: join_failure(err),
                },
            };
            let _ = done.send(completion);
        });
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            debug!(
                target = "stream.worker",
                from = %self.state,
                to = %state,
                "stream state changed"
            );
        }
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        let running = if self.state == StreamState::Running {
            1.0
        } else {
            0.0
        };
        gauge!("track_mux_stream_running", running);
        self.status.send_replace(StreamStatus {
            state: self.state,
            generation: self.generation,
            filters: self.active_filters.clone(),
            restarts: self.connects.saturating_sub(1),
            suppressed: self.suppressed,
            terminated: false,
        });
    }
}

/// Owner-side view of a spawned worker.
pub struct StreamWorkerHandle {
    thread: thread::JoinHandle<()>,
    done: oneshot::Receiver<Result<(), WorkerError>>,
    status: watch::Receiver<StreamStatus>,
    outcome: Option<Result<(), String>>,
}

impl StreamWorkerHandle {
    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Resolves when the worker exits, with its result. Later calls report the same outcome,
    /// with errors carried as [`WorkerError::Exited`].
    pub async fn wait(&mut self) -> Result<(), WorkerError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone().map_err(WorkerError::Exited);
        }
        let result = match (&mut self.done).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Panicked(
                "worker exited without reporting a result".to_string(),
            )),
        };
        self.outcome = Some(result.as_ref().map(|_| ()).map_err(ToString::to_string));
        result
    }
}

fn join_failure(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "task cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
