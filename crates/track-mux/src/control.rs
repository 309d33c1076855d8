use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::SessionId;

/// Requests from the connection-handling side, applied by the stream worker in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    RegisterFilter {
        session_id: SessionId,
        keyword: String,
    },
    UnregisterSession {
        session_id: SessionId,
    },
    /// Drops registry entries older than `taken_at` for sessions missing from `live`.
    SyncSessions {
        live: HashSet<SessionId>,
        taken_at: Instant,
    },
    Shutdown,
}

impl ControlCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlCommand::RegisterFilter { .. } => "register_filter",
            ControlCommand::UnregisterSession { .. } => "unregister_session",
            ControlCommand::SyncSessions { .. } => "sync_sessions",
            ControlCommand::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("stream worker is no longer accepting commands")]
    Closed,
}

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlSender { tx }, ControlReceiver { rx })
}

/// Producer half. Cloneable and never blocks.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ControlSender {
    pub fn send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.tx.send(command).map_err(|_| ControlError::Closed)
    }

    pub fn register_filter(
        &self,
        session_id: SessionId,
        keyword: impl Into<String>,
    ) -> Result<(), ControlError> {
        self.send(ControlCommand::RegisterFilter {
            session_id,
            keyword: keyword.into(),
        })
    }

    pub fn unregister(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.send(ControlCommand::UnregisterSession { session_id })
    }

    pub fn sync_sessions(
        &self,
        live: HashSet<SessionId>,
        taken_at: Instant,
    ) -> Result<(), ControlError> {
        self.send(ControlCommand::SyncSessions { live, taken_at })
    }

    pub fn shutdown(&self) -> Result<(), ControlError> {
        self.send(ControlCommand::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Polled {
    /// Nothing arrived within the poll window.
    Idle,
    Batch(Vec<ControlCommand>),
    /// Every producer is gone.
    Closed,
}

#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<ControlCommand>,
}

impl ControlReceiver {
    /// Waits up to `wait` for a command, then drains whatever else is already queued, up to
    /// `max_batch` commands in total. Cancel safe.
    pub async fn poll(&mut self, wait: Duration, max_batch: usize) -> Polled {
        let first = match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_) => return Polled::Idle,
            Ok(None) => return Polled::Closed,
            Ok(Some(command)) => command,
        };
        let mut batch = vec![first];
        while batch.len() < max_batch.max(1) {
            match self.rx.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }
        Polled::Batch(batch)
    }
}
