//! Wire frames exchanged with the gateway bridge sidecar.

use serde::{Deserialize, Serialize};

use auto_react::{
    BatchKind, ConnectionPhase, ConnectionUpdate, Disconnect, GatewayEvent, InboundMessage,
    MessageBatch, MessageKey, SendError,
};

/// Frames sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Start a gateway session from the credentials in `credentials_dir`
    Open {
        session_id: String,
        credentials_dir: String,
    },
    React {
        request_id: String,
        target_id: String,
        key: MessageKey,
        emoji: String,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastDisconnect {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<LastDisconnect> for Disconnect {
    fn from(last: LastDisconnect) -> Self {
        Disconnect {
            status_code: last.status_code,
            reason: last.message,
        }
    }
}

/// Frames received from the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BridgeFrame {
    #[serde(rename = "connection.update", rename_all = "camelCase")]
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<ConnectionPhase>,
        #[serde(default)]
        qr: Option<String>,
        #[serde(default)]
        last_disconnect: Option<LastDisconnect>,
    },
    #[serde(rename = "messages.upsert")]
    MessagesUpsert {
        #[serde(rename = "type")]
        kind: BatchKind,
        messages: Vec<InboundMessage>,
    },
    #[serde(rename = "react.result", rename_all = "camelCase")]
    ReactResult {
        request_id: String,
        ok: bool,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        message: Option<String>,
    },
}

/// What a decoded bridge frame means to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Event(GatewayEvent),
    ReactResult {
        request_id: String,
        result: Result<(), SendError>,
    },
}

impl From<BridgeFrame> for Inbound {
    fn from(frame: BridgeFrame) -> Self {
        match frame {
            BridgeFrame::ConnectionUpdate {
                connection,
                qr,
                last_disconnect,
            } => {
                let mut disconnect = last_disconnect.map(Disconnect::from);
                // A close always carries a cause, even an empty one
                if connection == Some(ConnectionPhase::Closed) && disconnect.is_none() {
                    disconnect = Some(Disconnect::default());
                }
                Inbound::Event(GatewayEvent::Connection(ConnectionUpdate {
                    phase: connection,
                    pairing_code: qr,
                    disconnect,
                }))
            }
            BridgeFrame::MessagesUpsert { kind, messages } => {
                Inbound::Event(GatewayEvent::Messages(MessageBatch { kind, messages }))
            }
            BridgeFrame::ReactResult {
                request_id,
                ok,
                status_code,
                message,
            } => {
                let result = if ok {
                    Ok(())
                } else {
                    Err(SendError::new(
                        status_code,
                        message.unwrap_or_else(|| "reaction rejected by gateway".to_string()),
                    ))
                };
                Inbound::ReactResult { request_id, result }
            }
        }
    }
}
