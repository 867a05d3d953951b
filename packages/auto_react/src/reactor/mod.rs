//! Per-session auto-reactor.
//!
//! Each reactor runs as a single actor task that owns its connection, its
//! [`ReactorMachine`] and both of its timers. Callers talk to it through a
//! [`ReactorHandle`].

mod actor;
mod machine;

pub(crate) use actor::spawn;
pub use machine::{
    CloseOutcome, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RATE_LIMIT_BACKOFF, MessageDecision, ReactorMachine, ReactorPhase, ReactorSettings,
    backoff_delay,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Commands that can be sent to a reactor actor
#[derive(Debug)]
pub(crate) enum ReactorCommand {
    Snapshot {
        respond_to: oneshot::Sender<ReactorSnapshot>,
    },
    Stop {
        respond_to: oneshot::Sender<()>,
    },
}

/// Point-in-time view of a reactor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactorSnapshot {
    pub session_id: String,
    pub channel_id: String,
    pub emoji: String,
    pub phase: ReactorPhase,
    pub reconnect_attempts: u32,
    pub rate_limited: bool,
    pub reacted_count: usize,
}

/// Handle to communicate with a reactor actor
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    session_id: String,
    sender: mpsc::Sender<ReactorCommand>,
    cancel: CancellationToken,
}

impl ReactorHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once the actor task has exited.
    pub fn is_finished(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn snapshot(&self) -> Option<ReactorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReactorCommand::Snapshot { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Stop the reactor and wait for it to wind down. Safe to call on a
    /// reactor that already stopped.
    pub async fn stop(&self) {
        // Interrupts any in-flight connect, backoff or send
        self.cancel.cancel();
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ReactorCommand::Stop { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
