use std::{sync::Arc, time::Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_bus::{outbound_topic, Bus};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};
use track_mux::{ClientAction, Multiplexer, MuxError, SessionId, SessionTransport, TransportError};
use uuid::Uuid;

pub struct AppState {
    pub mux: Multiplexer,
    pub bus: Arc<dyn Bus>,
    /// Sockets currently open, keyed by session id, with their connect time.
    pub sockets: DashMap<SessionId, Instant>,
    pub session_buffer: usize,
    pub metrics: PrometheusHandle,
}

/// Hands frames to a socket's writer task without blocking the caller.
pub struct WsTransport {
    tx: mpsc::Sender<Message>,
}

impl WsTransport {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }
}

impl SessionTransport for WsTransport {
    fn send(&self, payload: &str) -> Result<(), TransportError> {
        self.tx
            .try_send(Message::Text(payload.to_owned()))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => TransportError::Full,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }
}

pub async fn track_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = SessionId::new(Uuid::new_v4().simple().to_string());
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.session_buffer);
    let mut relayed = state.bus.subscribe(&outbound_topic(session_id.as_str()));

    state.sockets.insert(session_id.clone(), Instant::now());
    state
        .mux
        .on_connect(session_id.clone(), Arc::new(WsTransport::new(tx)));
    gauge!("track_relay_sockets", state.sockets.len() as f64);
    info!(target = "server.ws", session_id = %session_id, "client connected");

    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        let mut relay_open = true;
        loop {
            let outbound = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                relayed = relayed.recv(), if relay_open => match relayed {
                    Ok(message) => {
                        Message::Text(String::from_utf8_lossy(&message.payload).into_owned())
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            target = "server.ws",
                            session_id = %writer_session,
                            skipped,
                            "relay subscriber lagged"
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        relay_open = false;
                        continue;
                    }
                },
            };
            if sink.send(outbound).await.is_err() {
                break;
            }
        }
        debug!(target = "server.ws", session_id = %writer_session, "writer task ended");
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target = "server.ws", session_id = %session_id, error = %err, "socket error");
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    counter!("track_relay_frames_rejected_total", 1, "reason" => "binary");
                    warn!(target = "server.ws", session_id = %session_id, "dropping non-UTF-8 frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        handle_frame(&state, &session_id, &text);
    }

    state.sockets.remove(&session_id);
    gauge!("track_relay_sockets", state.sockets.len() as f64);
    if let Err(err) = state.mux.on_disconnect(&session_id) {
        warn!(target = "server.ws", session_id = %session_id, error = %err, "failed to unregister session");
    }
    writer.abort();
    info!(target = "server.ws", session_id = %session_id, "client disconnected");
}

fn handle_frame(state: &AppState, session_id: &SessionId, text: &str) {
    match state.mux.on_message(session_id, text) {
        Ok(ClientAction::Tracked { keyword }) => {
            info!(target = "server.ws", session_id = %session_id, keyword = %keyword, "tracking keyword");
        }
        Ok(ClientAction::Relayed { .. }) => {
            counter!("track_relay_frames_relayed_total", 1);
        }
        Err(MuxError::Malformed(err)) => {
            warn!(target = "server.ws", session_id = %session_id, error = %err, "dropping malformed frame");
        }
        Err(err) => {
            warn!(target = "server.ws", session_id = %session_id, error = %err, "failed to handle frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(5)]
    async fn transport_reports_full_and_closed_buffers() {
        let (tx, mut rx) = mpsc::channel(1);
        let transport = WsTransport::new(tx);

        assert_eq!(transport.send("one"), Ok(()));
        assert_eq!(transport.send("two"), Err(TransportError::Full));
        match rx.recv().await {
            Some(Message::Text(text)) => assert_eq!(text, "one"),
            other => panic!("unexpected frame: {other:?}"),
        }

        drop(rx);
        assert_eq!(transport.send("three"), Err(TransportError::Closed));
    }
}
