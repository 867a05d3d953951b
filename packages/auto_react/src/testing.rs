//! In-memory gateway and feed helpers for tests.
//!
//! Enabled inside this crate's tests and, for downstream crates, through the
//! `test-support` feature.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::credentials::{CredentialHandle, FsCredentialStore};
use crate::error::{GatewayError, SendError};
use crate::events::{Event, EventBroadcaster, FeedMessage, Observer};
use crate::gateway::{
    Connection, ConnectionPhase, ConnectionUpdate, Connector, Disconnect, GatewayEvent, Link,
    MessageBatch, MessageKey,
};
use crate::pairing::{PairingConfig, PairingFlow};
use crate::reactor::ReactorSettings;
use crate::registry::ReactorRegistry;
use crate::session::{SessionManager, SessionStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A reaction the fake gateway was asked to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentReaction {
    pub target_id: String,
    pub key: MessageKey,
    pub emoji: String,
}

struct FakeState {
    phase: ConnectionPhase,
    last_disconnect: Option<Disconnect>,
    events: Option<mpsc::Sender<GatewayEvent>>,
    sent: Vec<SentReaction>,
    send_results: VecDeque<Result<(), SendError>>,
    closed_by_client: bool,
}

/// Scripted connection. Tests drive its event stream by hand.
pub struct FakeConnection {
    session_id: String,
    state: Mutex<FakeState>,
}

impl FakeConnection {
    fn new(session_id: String, events: mpsc::Sender<GatewayEvent>) -> Self {
        Self {
            session_id,
            state: Mutex::new(FakeState {
                phase: ConnectionPhase::Connecting,
                last_disconnect: None,
                events: Some(events),
                sent: Vec::new(),
                send_results: VecDeque::new(),
                closed_by_client: false,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn push(&self, event: GatewayEvent) {
        let sender = lock(&self.state).events.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    pub async fn pairing_code(&self, code: &str) {
        self.push(GatewayEvent::Connection(ConnectionUpdate::pairing_code(code)))
            .await;
    }

    pub async fn open(&self) {
        lock(&self.state).phase = ConnectionPhase::Open;
        self.push(GatewayEvent::Connection(ConnectionUpdate::open()))
            .await;
    }

    /// Report a close from the gateway side, then end the stream.
    pub async fn close_with(&self, disconnect: Disconnect) {
        {
            let mut state = lock(&self.state);
            state.phase = ConnectionPhase::Closed;
            state.last_disconnect = Some(disconnect.clone());
        }
        self.push(GatewayEvent::Connection(ConnectionUpdate::closed(disconnect)))
            .await;
        lock(&self.state).events = None;
    }

    pub async fn deliver(&self, batch: MessageBatch) {
        self.push(GatewayEvent::Messages(batch)).await;
    }

    /// Make the next `send_reaction` call fail with `error`.
    pub fn fail_next_send(&self, error: SendError) {
        lock(&self.state).send_results.push_back(Err(error));
    }

    /// Every reaction attempted, failed ones included.
    pub fn sent(&self) -> Vec<SentReaction> {
        lock(&self.state).sent.clone()
    }

    /// True if `close()` was called on this connection.
    pub fn was_closed(&self) -> bool {
        lock(&self.state).closed_by_client
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn phase(&self) -> ConnectionPhase {
        lock(&self.state).phase
    }

    fn last_disconnect(&self) -> Option<Disconnect> {
        lock(&self.state).last_disconnect.clone()
    }

    async fn send_reaction(
        &self,
        target_id: &str,
        key: &MessageKey,
        emoji: &str,
    ) -> Result<(), SendError> {
        let mut state = lock(&self.state);
        state.sent.push(SentReaction {
            target_id: target_id.to_string(),
            key: key.clone(),
            emoji: emoji.to_string(),
        });
        state.send_results.pop_front().unwrap_or(Ok(()))
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        state.phase = ConnectionPhase::Closed;
        state.closed_by_client = true;
        state.events = None;
    }
}

#[derive(Default)]
struct ConnectorState {
    connections: Vec<Arc<FakeConnection>>,
    failures: VecDeque<GatewayError>,
    connect_delay: Option<Duration>,
}

/// Connector handing out [`FakeConnection`]s.
#[derive(Default)]
pub struct FakeConnector {
    state: Mutex<ConnectorState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_connect(&self, error: GatewayError) {
        lock(&self.state).failures.push_back(error);
    }

    /// Make the next `connect` call take `delay` before it answers.
    pub fn delay_next_connect(&self, delay: Duration) {
        lock(&self.state).connect_delay = Some(delay);
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        lock(&self.state).connections.clone()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        lock(&self.state).connections.last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// Wait until at least `count` connections were opened, returning the
    /// `count`-th one.
    pub async fn wait_for_connection(&self, count: usize) -> Arc<FakeConnection> {
        loop {
            let found = lock(&self.state)
                .connections
                .get(count.saturating_sub(1))
                .cloned();
            if let Some(conn) = found {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, credentials: &CredentialHandle) -> Result<Link, GatewayError> {
        let delay = lock(&self.state).connect_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(64);
        let connection = Arc::new(FakeConnection::new(credentials.session_id.clone(), tx));
        state.connections.push(connection.clone());
        Ok(Link {
            connection,
            events: rx,
        })
    }
}

/// Reads events off the feed, flattening the initial history batch.
pub struct EventProbe {
    observer: Observer,
    pending: VecDeque<Event>,
    timeout: Duration,
}

impl EventProbe {
    pub async fn attach(events: &EventBroadcaster) -> Self {
        Self {
            observer: events.attach().await,
            pending: VecDeque::new(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn absorb(&mut self, message: FeedMessage) {
        match message {
            FeedMessage::History { events } => self.pending.extend(events),
            FeedMessage::Event { event } => self.pending.push_back(event),
        }
    }

    /// Next event, or `None` if nothing arrives within the timeout.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let message = tokio::time::timeout(self.timeout, self.observer.recv())
                .await
                .ok()??;
            self.absorb(message);
        }
    }

    /// Skip events until one satisfies `predicate`.
    pub async fn next_matching(&mut self, predicate: impl Fn(&Event) -> bool) -> Option<Event> {
        while let Some(event) = self.next().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Everything already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        while let Some(message) = self.observer.try_recv() {
            self.absorb(message);
        }
        self.pending.drain(..).collect()
    }
}

/// A registry wired to a [`FakeConnector`] and a temporary credential store
/// that already holds session `s1`.
pub struct ReactorFixture {
    _dir: TempDir,
    pub connector: Arc<FakeConnector>,
    pub sessions: Arc<SessionManager>,
    pub pairing: PairingFlow,
    pub registry: ReactorRegistry,
}

impl ReactorFixture {
    pub async fn new() -> Self {
        Self::with_settings(ReactorSettings::default()).await
    }

    pub async fn with_settings(settings: ReactorSettings) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let connector = Arc::new(FakeConnector::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(FsCredentialStore::new(dir.path())),
            connector.clone(),
            Arc::new(SessionStore::new()),
            Arc::new(EventBroadcaster::default()),
        ));
        let fixture = Self {
            _dir: dir,
            connector,
            pairing: PairingFlow::new(sessions.clone(), PairingConfig::default()),
            registry: ReactorRegistry::new(sessions.clone(), settings),
            sessions,
        };
        fixture.create_session("s1").await;
        fixture
    }

    pub async fn create_session(&self, session_id: &str) -> CredentialHandle {
        self.sessions
            .credentials()
            .create(session_id)
            .await
            .expect("create session credentials")
    }

    pub async fn probe(&self) -> EventProbe {
        EventProbe::attach(self.sessions.events()).await
    }
}
