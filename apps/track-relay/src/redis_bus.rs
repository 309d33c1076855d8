//! Redis pub/sub implementation of the relay bus.
//!
//! Publishes go out through a `ConnectionManager` on a background task so callers never wait on
//! Redis. A single pattern subscription on the outbound prefix feeds an in-process `LocalBus`
//! that session sockets subscribe to.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use metrics::counter;
use redis::{aio::ConnectionManager, AsyncCommands};
use relay_bus::{outbound_session, Bus, BusError, BusMessage, BusResult, LocalBus, OUTBOUND_PREFIX};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub struct RedisBus {
    local: Arc<LocalBus>,
    outgoing: mpsc::UnboundedSender<(String, Bytes)>,
    tasks: Vec<JoinHandle<()>>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("failed to create redis client")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to redis")?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("failed to open redis pub/sub connection")?;
        let pattern = format!("{OUTBOUND_PREFIX}*");
        pubsub
            .psubscribe(&pattern)
            .await
            .with_context(|| format!("failed to subscribe to {pattern}"))?;
        info!(target = "relay.bus", pattern = %pattern, "redis relay subscribed");

        let local = Arc::new(LocalBus::new());
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(publish_loop(manager, outgoing_rx)),
            tokio::spawn(subscribe_loop(pubsub, local.clone())),
        ];
        Ok(Self {
            local,
            outgoing,
            tasks,
        })
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Bus for RedisBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.local.subscribe(topic)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        self.outgoing
            .send((topic.to_string(), payload))
            .map_err(|_| BusError::Closed)?;
        Ok(0)
    }

    fn prune(&self) -> usize {
        self.local.prune()
    }
}

async fn publish_loop(
    mut manager: ConnectionManager,
    mut outgoing: mpsc::UnboundedReceiver<(String, Bytes)>,
) {
    while let Some((topic, payload)) = outgoing.recv().await {
        match manager.publish::<_, _, i64>(&topic, payload.to_vec()).await {
            Ok(receivers) => {
                counter!("track_relay_bus_published_total", 1);
                debug!(target = "relay.bus", topic = %topic, receivers, "published to redis");
            }
            Err(err) => {
                counter!("track_relay_bus_publish_errors_total", 1);
                warn!(target = "relay.bus", topic = %topic, error = %err, "redis publish failed");
            }
        }
    }
}

async fn subscribe_loop(pubsub: redis::aio::PubSub, local: Arc<LocalBus>) {
    let mut messages = pubsub.into_on_message();
    while let Some(message) = messages.next().await {
        let topic = message.get_channel_name().to_string();
        if outbound_session(&topic).is_none() {
            continue;
        }
        let payload: Vec<u8> = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target = "relay.bus", topic = %topic, error = %err, "unreadable relay payload");
                continue;
            }
        };
        match local.publish(&topic, Bytes::from(payload)) {
            Ok(0) => {
                counter!("track_relay_bus_rejected_total", 1);
                debug!(target = "relay.bus", topic = %topic, "no live session for relayed message");
            }
            Ok(_) => counter!("track_relay_bus_delivered_total", 1),
            Err(err) => warn!(target = "relay.bus", topic = %topic, error = %err, "local fan-out failed"),
        }
    }
    warn!(target = "relay.bus", "redis subscription ended");
}
