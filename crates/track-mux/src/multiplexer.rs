use std::{collections::HashSet, sync::Arc, time::Instant};

use bytes::Bytes;
use metrics::counter;
use relay_bus::{inbound_topic, Bus, BusError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    client::{ClientMessage, MalformedMessage},
    control::{control_channel, ControlError, ControlSender},
    pipeline::{Aggregator, MessagePipeline, Scorer},
    registry::SessionRegistry,
    session::{SessionId, SessionTransport},
    upstream::Upstream,
    worker::{StreamStatus, StreamWorker, StreamWorkerHandle, WorkerConfig, WorkerError},
};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("relay publish failed: {0}")]
    Relay(#[from] BusError),
}

/// What a client frame turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Tracked { keyword: String },
    Relayed { subscribers: usize },
}

/// Connection-side entry point. Cheap to clone; every clone feeds the same stream worker.
#[derive(Clone)]
pub struct Multiplexer {
    registry: Arc<SessionRegistry>,
    control: ControlSender,
    bus: Arc<dyn Bus>,
    status: watch::Receiver<StreamStatus>,
}

impl Multiplexer {
    /// Builds the registry and pipeline and spawns the stream worker thread.
    pub fn start(
        config: WorkerConfig,
        upstream: Arc<dyn Upstream>,
        scorer: Arc<dyn Scorer>,
        aggregator: Arc<dyn Aggregator>,
        bus: Arc<dyn Bus>,
    ) -> Result<(Self, StreamWorkerHandle), WorkerError> {
        let registry = Arc::new(SessionRegistry::new());
        let (control, control_rx) = control_channel();
        let pipeline = MessagePipeline::new(registry.clone(), scorer, aggregator);
        let worker = StreamWorker::new(config, registry.clone(), upstream, pipeline, control_rx);
        let handle = worker.spawn()?;
        let mux = Self {
            registry,
            control,
            bus,
            status: handle.status(),
        };
        Ok((mux, handle))
    }

    /// Registers a freshly connected session. It receives nothing until it tracks a keyword.
    pub fn on_connect(&self, session_id: SessionId, transport: Arc<dyn SessionTransport>) {
        counter!("track_mux_sessions_connected_total", 1);
        self.registry.attach(session_id, transport);
    }

    pub fn on_message(&self, session_id: &SessionId, text: &str) -> Result<ClientAction, MuxError> {
        let message = ClientMessage::parse(text).map_err(|err| {
            counter!(
                "track_mux_malformed_messages_total",
                1,
                "reason" => err.metric_label()
            );
            err
        })?;
        match message {
            ClientMessage::Track { keyword } => {
                self.control
                    .register_filter(session_id.clone(), keyword.clone())?;
                Ok(ClientAction::Tracked { keyword })
            }
            ClientMessage::Relay { raw } => {
                let subscribers = self
                    .bus
                    .publish(&inbound_topic(session_id.as_str()), Bytes::from(raw))?;
                debug!(
                    target = "relay.bus",
                    session_id = %session_id,
                    subscribers,
                    "relayed client message"
                );
                Ok(ClientAction::Relayed { subscribers })
            }
        }
    }

    pub fn on_disconnect(&self, session_id: &SessionId) -> Result<(), ControlError> {
        counter!("track_mux_sessions_disconnected_total", 1);
        self.control.unregister(session_id.clone())
    }

    /// Reconciles the registry with the sockets open at `taken_at`. Sessions connected after
    /// that instant are kept even when absent from `live`.
    pub fn sync_sessions(
        &self,
        live: HashSet<SessionId>,
        taken_at: Instant,
    ) -> Result<(), ControlError> {
        self.control.sync_sessions(live, taken_at)
    }

    pub fn shutdown(&self) -> Result<(), ControlError> {
        self.control.shutdown()
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
