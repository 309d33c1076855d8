use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::{
    pipeline::ProcessedMessage,
    registry::SessionRegistry,
    session::TransportError,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub delivered: usize,
    pub closed: usize,
    pub dropped: usize,
    pub missing: usize,
}

/// Hands processed messages to the transports of the sessions they matched. Each message is
/// offered once per session; failures are counted and skipped.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn dispatch(&self, message: &ProcessedMessage) -> DispatchMetrics {
        let mut metrics = DispatchMetrics::default();
        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target = "stream.dispatch", error = %err, "failed to encode client payload");
                return metrics;
            }
        };

        for session_id in &message.matched {
            let Some(transport) = self.registry.transport(session_id) else {
                metrics.missing += 1;
                continue;
            };
            match transport.send(&payload) {
                Ok(()) => metrics.delivered += 1,
                Err(err) => {
                    match err {
                        TransportError::Closed => metrics.closed += 1,
                        TransportError::Full => metrics.dropped += 1,
                    }
                    counter!(
                        "track_mux_sends_skipped_total",
                        1,
                        "reason" => err.metric_label()
                    );
                    debug!(
                        target = "stream.dispatch",
                        session_id = %session_id,
                        error = %err,
                        "skipping session"
                    );
                }
            }
        }

        counter!("track_mux_deliveries_total", metrics.delivered as u64);
        metrics
    }
}
