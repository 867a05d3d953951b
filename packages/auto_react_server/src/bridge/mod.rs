//! Gateway connector that talks to a WebSocket bridge sidecar.
//!
//! Each session connection is one WebSocket. A reader task turns bridge
//! frames into [`GatewayEvent`]s and settles pending reaction requests; a
//! writer task owns the sink so sends from the reactor never contend with it.
//! Events pass through a forwarding task so a consumer that is busy awaiting
//! a reaction result never holds up the frame that settles it.

mod protocol;

use protocol::{BridgeFrame, ClientFrame, Inbound};

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use auto_react::{
    Connection, ConnectionPhase, ConnectionUpdate, Connector, CredentialHandle, Disconnect,
    GatewayError, GatewayEvent, Link, MessageKey, SendError,
};

use crate::config::GatewayConfig;

const EVENT_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 32;

type PendingSends = HashMap<String, oneshot::Sender<Result<(), SendError>>>;

fn closed_error() -> SendError {
    SendError::new(None, "gateway connection closed")
}

/// Opens bridge connections for session credentials.
pub struct BridgeConnector {
    url: String,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            url: config.bridge_url.clone(),
            connect_timeout: config.connect_timeout,
            send_timeout: config.send_timeout,
        }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, credentials: &CredentialHandle) -> Result<Link, GatewayError> {
        let (ws_stream, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(|e| GatewayError::ConnectFailed(e.to_string()))?;

        let (mut ws_write, ws_read) = ws_stream.split();

        let open = ClientFrame::Open {
            session_id: credentials.session_id.clone(),
            credentials_dir: credentials.location.display().to_string(),
        };
        send_frame(&mut ws_write, &open)
            .await
            .map_err(GatewayError::ConnectFailed)?;
        info!(
            "Opened bridge connection for session {} at {}",
            credentials.session_id, self.url
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared::new(credentials.session_id.clone()));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(ws_write, outbound_rx, cancel.clone()));
        tokio::spawn(forward_loop(inbound_rx, events_tx));
        tokio::spawn(read_loop(ws_read, inbound_tx, shared.clone(), cancel.clone()));

        Ok(Link {
            connection: Arc::new(BridgeConnection {
                shared,
                outbound: outbound_tx,
                cancel,
                send_timeout: self.send_timeout,
            }),
            events: events_rx,
        })
    }
}

struct ConnectionState {
    phase: ConnectionPhase,
    last_disconnect: Option<Disconnect>,
    pending: PendingSends,
    closed_by_client: bool,
}

struct Shared {
    session_id: String,
    state: Mutex<ConnectionState>,
}

impl Shared {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Connecting,
                last_disconnect: None,
                pending: HashMap::new(),
                closed_by_client: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, update: &ConnectionUpdate) {
        let mut state = self.lock();
        if let Some(phase) = update.phase {
            state.phase = phase;
        }
        if let Some(disconnect) = &update.disconnect {
            state.last_disconnect = Some(disconnect.clone());
        }
    }

    fn settle(&self, request_id: &str, result: Result<(), SendError>) {
        match self.lock().pending.remove(request_id) {
            Some(respond_to) => {
                let _ = respond_to.send(result);
            }
            None => debug!(
                "Dropping result for unknown or expired request {} on session {}",
                request_id, self.session_id
            ),
        }
    }

    /// Mark the socket gone. Returns the close to report, if nobody has
    /// reported one yet.
    fn finish(&self) -> Option<Disconnect> {
        let mut state = self.lock();
        for (_, respond_to) in state.pending.drain() {
            let _ = respond_to.send(Err(closed_error()));
        }
        let report = state.phase != ConnectionPhase::Closed && !state.closed_by_client;
        state.phase = ConnectionPhase::Closed;
        if report {
            let disconnect = Disconnect::default();
            state.last_disconnect = Some(disconnect.clone());
            Some(disconnect)
        } else {
            None
        }
    }
}

/// One session's live bridge socket.
pub struct BridgeConnection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<ClientFrame>,
    cancel: CancellationToken,
    send_timeout: Duration,
}

#[async_trait]
impl Connection for BridgeConnection {
    fn phase(&self) -> ConnectionPhase {
        self.shared.lock().phase
    }

    fn last_disconnect(&self) -> Option<Disconnect> {
        self.shared.lock().last_disconnect.clone()
    }

    async fn send_reaction(
        &self,
        target_id: &str,
        key: &MessageKey,
        emoji: &str,
    ) -> Result<(), SendError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if state.phase == ConnectionPhase::Closed {
                return Err(closed_error());
            }
            state.pending.insert(request_id.clone(), tx);
        }

        let frame = ClientFrame::React {
            request_id: request_id.clone(),
            target_id: target_id.to_string(),
            key: key.clone(),
            emoji: emoji.to_string(),
        };
        if self.outbound.send(frame).await.is_err() {
            self.shared.lock().pending.remove(&request_id);
            return Err(closed_error());
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(closed_error()),
            Err(_) => {
                self.shared.lock().pending.remove(&request_id);
                Err(SendError::new(None, "reaction send timed out"))
            }
        }
    }

    async fn close(&self) {
        {
            let mut state = self.shared.lock();
            if state.closed_by_client {
                return;
            }
            state.closed_by_client = true;
            state.phase = ConnectionPhase::Closed;
        }
        debug!("Closing bridge connection for session {}", self.shared.session_id);
        // Queued ahead of the cancel so the writer flushes it first
        let _ = self.outbound.try_send(ClientFrame::Close);
        self.cancel.cancel();
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let json = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<ClientFrame>,
    cancel: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    warn!("Bridge write failed: {}", e);
                    break;
                }
            }

            _ = cancel.cancelled() => break,
        }
    }
    let _ = sink.close().await;
    cancel.cancel();
}

/// Hand decoded events to the session at the pace it consumes them.
async fn forward_loop(
    mut inbound: mpsc::UnboundedReceiver<GatewayEvent>,
    events: mpsc::Sender<GatewayEvent>,
) {
    while let Some(event) = inbound.recv().await {
        // The receiver goes away once the session detaches
        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn read_loop<S>(
    mut stream: S,
    events: mpsc::UnboundedSender<GatewayEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!("Bridge read failed for session {}: {}", shared.session_id, e);
                break;
            }
            Some(Ok(_)) => continue,
        };

        let frame: BridgeFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring bridge frame: {}", e);
                continue;
            }
        };

        match Inbound::from(frame) {
            Inbound::Event(event) => {
                let closed = match &event {
                    GatewayEvent::Connection(update) => {
                        shared.apply(update);
                        update.is_closed()
                    }
                    GatewayEvent::Messages(_) => false,
                };
                let _ = events.send(event);
                if closed {
                    break;
                }
            }
            Inbound::ReactResult { request_id, result } => shared.settle(&request_id, result),
        }
    }

    if let Some(disconnect) = shared.finish() {
        info!("Bridge socket for session {} dropped", shared.session_id);
        let _ = events.send(GatewayEvent::Connection(ConnectionUpdate::closed(
            disconnect,
        )));
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use auto_react::{InboundMessage, MessageBatch, Subscription};
    use serde_json::json;
    use std::path::PathBuf;
    use tokio::net::TcpListener;
    use tokio_tungstenite::WebSocketStream;

    type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

    async fn bridge<F, Fut>(script: F) -> (BridgeConnector, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        let connector = BridgeConnector::new(&GatewayConfig {
            bridge_url: format!("ws://{}/", addr),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
        });
        (connector, server)
    }

    fn credentials() -> CredentialHandle {
        CredentialHandle {
            session_id: "s1".to_string(),
            location: PathBuf::from("/data/sessions/s1"),
        }
    }

    async fn next_frame(ws: &mut ServerSocket) -> Option<ClientFrame> {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    async fn push(ws: &mut ServerSocket, value: serde_json::Value) {
        ws.send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_frame_and_events() {
        let (connector, server) = bridge(|mut ws| async move {
            assert_eq!(
                next_frame(&mut ws).await,
                Some(ClientFrame::Open {
                    session_id: "s1".into(),
                    credentials_dir: "/data/sessions/s1".into(),
                })
            );
            push(&mut ws, json!({"event": "connection.update", "qr": "2@abc"})).await;
            push(&mut ws, json!({"event": "connection.update", "connection": "open"})).await;
            push(
                &mut ws,
                json!({
                    "event": "messages.upsert",
                    "type": "notify",
                    "messages": [{"key": {"remoteJid": "c@newsletter", "id": "m1"}}],
                }),
            )
            .await;
            // Hold the socket until the client closes it
            while next_frame(&mut ws).await.is_some() {}
        })
        .await;

        let link = connector.connect(&credentials()).await.unwrap();
        let mut subscription = Subscription::new(link.events);

        assert_eq!(
            subscription.recv().await,
            Some(GatewayEvent::Connection(ConnectionUpdate::pairing_code(
                "2@abc"
            )))
        );
        assert_eq!(
            subscription.recv().await,
            Some(GatewayEvent::Connection(ConnectionUpdate::open()))
        );
        assert_eq!(link.connection.phase(), ConnectionPhase::Open);
        assert_eq!(
            subscription.recv().await,
            Some(GatewayEvent::Messages(MessageBatch::live(vec![
                InboundMessage::new("c@newsletter", "m1")
            ])))
        );

        link.connection.close().await;
        link.connection.close().await;
        assert_eq!(link.connection.phase(), ConnectionPhase::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_react_round_trip() {
        let (connector, server) = bridge(|mut ws| async move {
            next_frame(&mut ws).await;
            let Some(ClientFrame::React {
                request_id,
                target_id,
                emoji,
                ..
            }) = next_frame(&mut ws).await
            else {
                panic!("expected a react frame");
            };
            assert_eq!(target_id, "c@newsletter");
            assert_eq!(emoji, "🔥");
            push(&mut ws, json!({"event": "react.result", "requestId": request_id, "ok": true}))
                .await;

            let Some(ClientFrame::React { request_id, .. }) = next_frame(&mut ws).await else {
                panic!("expected a react frame");
            };
            push(
                &mut ws,
                json!({
                    "event": "react.result",
                    "requestId": request_id,
                    "ok": false,
                    "statusCode": 429,
                    "message": "rate-overlimit",
                }),
            )
            .await;
            while next_frame(&mut ws).await.is_some() {}
        })
        .await;

        let link = connector.connect(&credentials()).await.unwrap();
        let key = InboundMessage::new("c@newsletter", "m1").key;

        link.connection
            .send_reaction("c@newsletter", &key, "🔥")
            .await
            .unwrap();
        let err = link
            .connection
            .send_reaction("c@newsletter", &key, "🔥")
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());

        link.connection.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_react_result_not_blocked_by_undrained_events() {
        let (mut connector, server) = bridge(|mut ws| async move {
            next_frame(&mut ws).await;
            for i in 0..(EVENT_BUFFER * 2) {
                let key = json!({"remoteJid": "c@newsletter", "id": format!("m{}", i)});
                let frame = json!({
                    "event": "messages.upsert",
                    "type": "notify",
                    "messages": [{"key": key}],
                });
                push(&mut ws, frame).await;
            }
            let Some(ClientFrame::React { request_id, .. }) = next_frame(&mut ws).await else {
                panic!("expected a react frame");
            };
            push(&mut ws, json!({"event": "react.result", "requestId": request_id, "ok": true}))
                .await;
            while next_frame(&mut ws).await.is_some() {}
        })
        .await;
        connector.send_timeout = Duration::from_secs(2);

        let link = connector.connect(&credentials()).await.unwrap();
        let key = InboundMessage::new("c@newsletter", "m0").key;

        // Nobody reads the event stream while the reaction is in flight
        link.connection
            .send_reaction("c@newsletter", &key, "🔥")
            .await
            .unwrap();

        let mut subscription = Subscription::new(link.events);
        for i in 0..(EVENT_BUFFER * 2) {
            let Some(GatewayEvent::Messages(batch)) = subscription.recv().await else {
                panic!("expected a message batch");
            };
            assert_eq!(batch.messages[0].key.id, format!("m{}", i));
        }

        link.connection.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_socket_reports_close_and_fails_sends() {
        let (connector, server) = bridge(|mut ws| async move {
            next_frame(&mut ws).await;
            // Wait for the react request, then vanish without answering
            next_frame(&mut ws).await;
            drop(ws);
        })
        .await;

        let link = connector.connect(&credentials()).await.unwrap();
        let mut subscription = Subscription::new(link.events);
        let key = InboundMessage::new("c@newsletter", "m1").key;

        let err = link
            .connection
            .send_reaction("c@newsletter", &key, "🔥")
            .await
            .unwrap_err();
        assert_eq!(err.status_code, None);

        assert_eq!(
            subscription.recv().await,
            Some(GatewayEvent::Connection(ConnectionUpdate::closed(
                Disconnect::default()
            )))
        );
        assert_eq!(subscription.recv().await, None);
        assert_eq!(link.connection.phase(), ConnectionPhase::Closed);
        assert_eq!(link.connection.last_disconnect(), Some(Disconnect::default()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let (mut connector, server) = bridge(|mut ws| async move {
            while next_frame(&mut ws).await.is_some() {}
        })
        .await;
        connector.send_timeout = Duration::from_millis(50);

        let link = connector.connect(&credentials()).await.unwrap();
        let key = InboundMessage::new("c@newsletter", "m1").key;
        let err = link
            .connection
            .send_reaction("c@newsletter", &key, "🔥")
            .await
            .unwrap_err();
        assert!(err.message.contains("timed out"));

        link.connection.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = BridgeConnector::new(&GatewayConfig {
            bridge_url: format!("ws://{}/", addr),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
        });
        let err = connector.connect(&credentials()).await.err().unwrap();
        assert!(matches!(err, GatewayError::ConnectFailed(_)));
    }
}
