#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_bus::LocalBus;
use tokio::sync::{mpsc, watch, Semaphore};
use track_mux::{
    Aggregator, EventSink, IncomingEvent, Multiplexer, Polarity, Scorer, SessionId,
    SessionTransport, StreamStatus, StreamWorkerHandle, TransportError, Upstream,
    UpstreamConnection, UpstreamError, UpstreamSignal, WorkerConfig,
};

pub const SETTLE: Duration = Duration::from_secs(5);

/// Upstream double that counts connections and lets a test hold connects or disconnects open.
#[derive(Clone, Default)]
pub struct FakeUpstream {
    state: Arc<FakeState>,
}

#[derive(Default)]
struct FakeState {
    connects: Mutex<Vec<BTreeSet<String>>>,
    sinks: Mutex<Vec<EventSink>>,
    scripted: Mutex<VecDeque<UpstreamError>>,
    early_errors: Mutex<VecDeque<UpstreamError>>,
    panic_on_connect: AtomicBool,
    panic_on_disconnect: AtomicBool,
    open: AtomicUsize,
    max_open: AtomicUsize,
    disconnects: AtomicUsize,
    connect_gate: Mutex<Option<Arc<Semaphore>>>,
    disconnect_gate: Mutex<Option<Arc<Semaphore>>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next connect attempt fail with `err`.
    pub fn fail_next_connect(&self, err: UpstreamError) {
        self.state.scripted.lock().push_back(err);
    }

    /// Makes the next successful connect push `err` through its sink before returning.
    pub fn fail_right_after_connect(&self, err: UpstreamError) {
        self.state.early_errors.lock().push_back(err);
    }

    /// Makes every later connect attempt panic.
    pub fn panic_on_connect(&self) {
        self.state.panic_on_connect.store(true, Ordering::SeqCst);
    }

    /// Makes every later disconnect panic before the connection is released.
    pub fn panic_on_disconnect(&self) {
        self.state.panic_on_disconnect.store(true, Ordering::SeqCst);
    }

    /// Blocks every disconnect until the returned semaphore receives permits.
    pub fn hold_disconnects(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.disconnect_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn hold_connects(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.connect_gate.lock() = Some(gate.clone());
        gate
    }

    /// Adds a delay to both connect and disconnect.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = Some(latency);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.lock().len()
    }

    pub fn connected_filters(&self) -> Vec<BTreeSet<String>> {
        self.state.connects.lock().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn max_open_connections(&self) -> usize {
        self.state.max_open.load(Ordering::SeqCst)
    }

    /// Sink of the connection with the given generation.
    pub fn sink(&self, generation: u64) -> Option<EventSink> {
        self.state
            .sinks
            .lock()
            .iter()
            .find(|sink| sink.generation() == generation)
            .cloned()
    }

    pub fn latest_sink(&self) -> EventSink {
        self.state
            .sinks
            .lock()
            .last()
            .cloned()
            .expect("no connection has been opened")
    }

    pub async fn emit(&self, text: &str) {
        let sink = self.latest_sink();
        assert!(sink.send(UpstreamSignal::Event(IncomingEvent::new(text))).await);
    }

    pub async fn emit_error(&self, err: UpstreamError) {
        let sink = self.latest_sink();
        assert!(sink.send(UpstreamSignal::Error(err)).await);
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn connect(
        &self,
        filters: BTreeSet<String>,
        sink: EventSink,
    ) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let gate = self.state.connect_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        self.state.connects.lock().push(filters);
        if self.state.panic_on_connect.load(Ordering::SeqCst) {
            panic!("upstream connect exploded");
        }
        if let Some(err) = self.state.scripted.lock().pop_front() {
            return Err(err);
        }

        let open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(open, Ordering::SeqCst);
        self.state.sinks.lock().push(sink.clone());
        let early = self.state.early_errors.lock().pop_front();
        if let Some(err) = early {
            sink.send(UpstreamSignal::Error(err)).await;
        }
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
}

#[async_trait]
impl UpstreamConnection for FakeConnection {
    async fn disconnect(&mut self) {
        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let gate = self.state.disconnect_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.state.panic_on_disconnect.load(Ordering::SeqCst) {
            panic!("upstream disconnect exploded");
        }
        self.state.open.fetch_sub(1, Ordering::SeqCst);
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that forwards every frame to a channel the test can await.
pub struct RecordingTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl RecordingTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SessionTransport for RecordingTransport {
    fn send(&self, payload: &str) -> Result<(), TransportError> {
        self.tx
            .send(payload.to_string())
            .map_err(|_| TransportError::Closed)
    }
}

pub struct NeutralScorer;

impl Scorer for NeutralScorer {
    fn score(&self, _text: &str) -> Polarity {
        Polarity {
            neu: 1.0,
            ..Polarity::default()
        }
    }
}

pub struct HashtagCounter;

impl Aggregator for HashtagCounter {
    fn frequencies(&self, tokens: &[&str]) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        for token in tokens.iter().filter(|token| token.starts_with('#')) {
            *counts.entry(token.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

pub fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        reconnect_backoff: Duration::from_millis(50),
        max_batch: 16,
        event_buffer: 64,
    }
}

pub struct Harness {
    pub mux: Multiplexer,
    pub worker: StreamWorkerHandle,
    pub upstream: FakeUpstream,
    pub bus: Arc<LocalBus>,
}

impl Harness {
    pub fn start(upstream: FakeUpstream) -> Self {
        Self::start_with(upstream, fast_config())
    }

    pub fn start_with(upstream: FakeUpstream, config: WorkerConfig) -> Self {
        let bus = Arc::new(LocalBus::new());
        let (mux, worker) = Multiplexer::start(
            config,
            Arc::new(upstream.clone()),
            Arc::new(NeutralScorer),
            Arc::new(HashtagCounter),
            bus.clone(),
        )
        .expect("worker starts");
        Self {
            mux,
            worker,
            upstream,
            bus,
        }
    }

    /// Connects a session with a recording transport.
    pub fn connect(&self, id: &str) -> (SessionId, mpsc::UnboundedReceiver<String>) {
        let session_id = SessionId::from(id);
        let (transport, frames) = RecordingTransport::new();
        self.mux.on_connect(session_id.clone(), transport);
        (session_id, frames)
    }

    pub fn track(&self, session_id: &SessionId, keyword: &str) {
        let frame = serde_json::json!({ "track": keyword }).to_string();
        self.mux
            .on_message(session_id, &frame)
            .expect("track frame accepted");
    }

    pub async fn wait_for(&self, check: impl FnMut(&StreamStatus) -> bool) -> StreamStatus {
        wait_for_status(self.mux.watch_status(), check).await
    }

    pub async fn wait_running_with(&self, filters: &[&str]) -> StreamStatus {
        let expected = set(filters);
        self.wait_for(|status| {
            status.state == track_mux::StreamState::Running && status.filters == expected
        })
        .await
    }
}

pub async fn wait_for_status(
    mut status: watch::Receiver<StreamStatus>,
    check: impl FnMut(&StreamStatus) -> bool,
) -> StreamStatus {
    let observed = tokio::time::timeout(SETTLE, status.wait_for(check))
        .await
        .expect("status condition reached in time")
        .expect("worker status channel open");
    observed.clone()
}

pub async fn next_frame(frames: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let frame = tokio::time::timeout(SETTLE, frames.recv())
        .await
        .expect("frame arrives in time")
        .expect("transport channel open");
    serde_json::from_str(&frame).expect("frame is JSON")
}

pub fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}
