use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Raw status delivered by the upstream feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingEvent {
    pub text: String,
    pub extended_text: Option<String>,
    pub is_retweet: bool,
}

impl IncomingEvent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// The feed asked us to back off; reconnecting right away makes it worse.
    #[error("upstream rate limit exceeded")]
    RateLimited,
    #[error("upstream rejected credentials: {0}")]
    Unauthorized(String),
    #[error("upstream failure: {0}")]
    Transient(String),
}

impl UpstreamError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            UpstreamError::RateLimited => "rate_limited",
            UpstreamError::Unauthorized(_) => "unauthorized",
            UpstreamError::Transient(_) => "transient",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSignal {
    Event(IncomingEvent),
    Error(UpstreamError),
    /// The feed ended without being asked to.
    Closed,
}

/// Channel an open connection pushes its signals through. Every signal is tagged with the
/// generation of the connection that produced it so the worker can discard stragglers.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<(u64, UpstreamSignal)>,
}

impl EventSink {
    /// The worker builds one per connection attempt. Building one directly is mostly useful for
    /// exercising an [`Upstream`] implementation against a plain channel.
    pub fn new(generation: u64, tx: mpsc::Sender<(u64, UpstreamSignal)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hands a signal to the worker, waiting for buffer space. Returns `false` once the worker
    /// is gone.
    pub async fn send(&self, signal: UpstreamSignal) -> bool {
        self.tx.send((self.generation, signal)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The shared filtered feed. Only one connection is ever open at a time; the stream worker
/// guarantees it.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Opens a connection tracking `filters` and returns once it is established.
    async fn connect(
        &self,
        filters: BTreeSet<String>,
        sink: EventSink,
    ) -> Result<Box<dyn UpstreamConnection>, UpstreamError>;
}

#[async_trait]
pub trait UpstreamConnection: Send {
    /// Tears the connection down. Resolves only once no further signals will be sent.
    async fn disconnect(&mut self);
}
