//! Interface to the messaging gateway.
//!
//! The engine never speaks a gateway protocol itself. A [`Connector`] opens a
//! [`Connection`] for a session's credentials and hands back the receiving end
//! of its event stream in the same [`Link`], so no event emitted between
//! "connected" and "subscribed" can be lost.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::credentials::CredentialHandle;
use crate::error::{GatewayError, SendError};

/// Status code a gateway reports when the account was logged out remotely.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Status code a gateway reports when the provider throttles us.
pub const RATE_LIMIT_STATUS: u16 = 429;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    #[serde(rename = "close")]
    Closed,
}

/// Why a connection closed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnect {
    pub status_code: Option<u16>,
    pub reason: Option<String>,
}

impl Disconnect {
    pub fn new(status_code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: Some(reason.into()),
        }
    }

    pub fn logged_out() -> Self {
        Self::new(Some(LOGGED_OUT_STATUS), "logged out")
    }

    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(LOGGED_OUT_STATUS)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code == Some(RATE_LIMIT_STATUS)
    }
}

/// A connection-state report. Any combination of fields may be present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub phase: Option<ConnectionPhase>,
    pub pairing_code: Option<String>,
    pub disconnect: Option<Disconnect>,
}

impl ConnectionUpdate {
    pub fn connecting() -> Self {
        Self {
            phase: Some(ConnectionPhase::Connecting),
            ..Default::default()
        }
    }

    pub fn open() -> Self {
        Self {
            phase: Some(ConnectionPhase::Open),
            ..Default::default()
        }
    }

    pub fn closed(disconnect: Disconnect) -> Self {
        Self {
            phase: Some(ConnectionPhase::Closed),
            disconnect: Some(disconnect),
            ..Default::default()
        }
    }

    pub fn pairing_code(code: impl Into<String>) -> Self {
        Self {
            pairing_code: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Some(ConnectionPhase::Closed)
    }
}

/// Addresses one message on the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Chat the message lives in.
    pub remote_jid: String,
    pub id: String,
    /// True when the message was sent by the paired account itself.
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub key: MessageKey,
    /// False for protocol stubs (receipts, deletions) that carry no body.
    #[serde(default = "default_has_content")]
    pub has_content: bool,
}

fn default_has_content() -> bool {
    true
}

impl InboundMessage {
    pub fn new(remote_jid: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            key: MessageKey {
                remote_jid: remote_jid.into(),
                id: id.into(),
                from_me: false,
            },
            has_content: true,
        }
    }

    pub fn from_me(mut self) -> Self {
        self.key.from_me = true;
        self
    }

    pub fn without_content(mut self) -> Self {
        self.has_content = false;
        self
    }
}

/// Whether a batch is a live notification or a backlog replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    /// New messages delivered as they arrive.
    Notify,
    /// History synced on (re)connect. Never reacted to.
    Append,
}

impl BatchKind {
    pub fn is_live(self) -> bool {
        matches!(self, BatchKind::Notify)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageBatch {
    pub kind: BatchKind,
    pub messages: Vec<InboundMessage>,
}

impl MessageBatch {
    pub fn live(messages: Vec<InboundMessage>) -> Self {
        Self {
            kind: BatchKind::Notify,
            messages,
        }
    }

    pub fn backlog(messages: Vec<InboundMessage>) -> Self {
        Self {
            kind: BatchKind::Append,
            messages,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    Connection(ConnectionUpdate),
    Messages(MessageBatch),
}

/// A live channel to the gateway for one session.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn phase(&self) -> ConnectionPhase;

    fn last_disconnect(&self) -> Option<Disconnect>;

    /// React to `key` in chat `target_id` with `emoji`.
    async fn send_reaction(
        &self,
        target_id: &str,
        key: &MessageKey,
        emoji: &str,
    ) -> Result<(), SendError>;

    /// Close the connection. Calling it on a closed connection is a no-op.
    async fn close(&self);
}

/// A freshly opened connection together with its event stream.
pub struct Link {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<GatewayEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, credentials: &CredentialHandle) -> Result<Link, GatewayError>;
}

/// Handle on a connection's event stream.
///
/// Dropping the stream is the only way handlers get detached, and
/// [`Subscription::detach`] may be called any number of times. If the gateway
/// drops its end without reporting a close, one synthetic close update is
/// delivered so consumers see every connection end the same way.
pub struct Subscription {
    events: Option<mpsc::Receiver<GatewayEvent>>,
    saw_close: bool,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<GatewayEvent>) -> Self {
        Self {
            events: Some(events),
            saw_close: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.events.is_some()
    }

    /// Detach from the stream. Returns whether it was still attached.
    pub fn detach(&mut self) -> bool {
        self.events.take().is_some()
    }

    /// Next event, or `None` once the stream is over or detached.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        let events = self.events.as_mut()?;
        match events.recv().await {
            Some(event) => {
                if let GatewayEvent::Connection(update) = &event {
                    if update.is_closed() {
                        self.saw_close = true;
                    }
                }
                Some(event)
            }
            None => {
                self.events = None;
                if self.saw_close {
                    None
                } else {
                    self.saw_close = true;
                    Some(GatewayEvent::Connection(ConnectionUpdate::closed(
                        Disconnect::default(),
                    )))
                }
            }
        }
    }

    /// Like [`Subscription::recv`], but never resolves while detached.
    /// Meant for `tokio::select!` loops.
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        if !self.is_attached() {
            return std::future::pending().await;
        }
        self.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classification() {
        assert!(Disconnect::logged_out().is_logged_out());
        assert!(!Disconnect::default().is_logged_out());
        assert!(Disconnect::new(Some(429), "rate-overlimit").is_rate_limited());
        assert!(!Disconnect::new(Some(428), "closed").is_rate_limited());
    }

    #[test]
    fn batch_kind_liveness() {
        assert!(BatchKind::Notify.is_live());
        assert!(!BatchKind::Append.is_live());
    }

    #[test]
    fn phase_serializes_like_gateway() {
        assert_eq!(
            serde_json::to_value(ConnectionPhase::Closed).unwrap(),
            "close"
        );
        assert_eq!(serde_json::to_value(ConnectionPhase::Open).unwrap(), "open");
    }

    #[test]
    fn inbound_message_defaults() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"key":{"remoteJid":"123@g.us","id":"ABC"}}"#).unwrap();
        assert!(msg.has_content);
        assert!(!msg.key.from_me);
    }

    #[tokio::test]
    async fn subscription_synthesizes_close_when_stream_ends() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        tx.send(GatewayEvent::Connection(ConnectionUpdate::open()))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(
            sub.recv().await,
            Some(GatewayEvent::Connection(ConnectionUpdate::open()))
        );
        match sub.recv().await {
            Some(GatewayEvent::Connection(update)) => assert!(update.is_closed()),
            other => panic!("expected synthetic close, got {:?}", other),
        }
        assert_eq!(sub.recv().await, None);
        assert!(!sub.is_attached());
    }

    #[tokio::test]
    async fn subscription_does_not_duplicate_reported_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        tx.send(GatewayEvent::Connection(ConnectionUpdate::closed(
            Disconnect::logged_out(),
        )))
        .await
        .unwrap();
        drop(tx);

        assert!(matches!(sub.recv().await, Some(GatewayEvent::Connection(_))));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        assert!(sub.detach());
        assert!(!sub.detach());
        assert!(!sub.is_attached());
        assert!(tx.is_closed());
        assert_eq!(sub.recv().await, None);
    }
}
