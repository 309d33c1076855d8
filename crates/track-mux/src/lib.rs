//! Session multiplexer for a single keyword-filtered upstream feed.
//!
//! Many clients each track one keyword, but the upstream accepts a single filter set per
//! connection. [`Multiplexer`] merges the per-session keywords, restarts the upstream connection
//! whenever the merged set changes (never holding two connections at once), and fans each
//! status out to the sessions whose keyword it contains.
//!
//! Network transports, scoring and the relay broker are supplied by the caller through
//! [`Upstream`], [`Scorer`], [`Aggregator`], [`SessionTransport`] and [`relay_bus::Bus`].

pub mod client;
pub mod control;
pub mod dispatch;
pub mod multiplexer;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod stopwords;
pub mod upstream;
pub mod worker;

pub use client::{ClientMessage, MalformedMessage};
pub use control::{control_channel, ControlCommand, ControlError, ControlReceiver, ControlSender};
pub use dispatch::{DispatchMetrics, Dispatcher};
pub use multiplexer::{ClientAction, Multiplexer, MuxError};
pub use pipeline::{Aggregator, MessagePipeline, Polarity, ProcessedMessage, Scorer};
pub use registry::SessionRegistry;
pub use session::{SessionId, SessionTransport, TransportError};
pub use upstream::{
    EventSink, IncomingEvent, Upstream, UpstreamConnection, UpstreamError, UpstreamSignal,
};
pub use worker::{
    StreamState, StreamStatus, StreamWorker, StreamWorkerHandle, WorkerConfig, WorkerError,
};
