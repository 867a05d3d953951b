use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialHandle, CredentialStore};
use crate::error::GatewayError;
use crate::events::{EventBroadcaster, EventKind};
use crate::gateway::{Connection, ConnectionPhase, Connector, GatewayEvent, Link, Subscription};

struct SessionRecord {
    credentials: CredentialHandle,
    connection: Option<Arc<dyn Connection>>,
}

/// Live sessions: credential handle plus the currently bound connection.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session without a connection. Existing bindings are kept.
    pub async fn register(&self, credentials: CredentialHandle) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(credentials.session_id.clone())
            .or_insert(SessionRecord {
                credentials,
                connection: None,
            });
    }

    /// Forget a session. Returns the connection that was bound to it.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<dyn Connection>> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .and_then(|record| record.connection)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn credentials(&self, session_id: &str) -> Option<CredentialHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|record| record.credentials.clone())
    }

    pub async fn connection(&self, session_id: &str) -> Option<Arc<dyn Connection>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|record| record.connection.clone())
    }

    pub async fn connection_phase(&self, session_id: &str) -> Option<ConnectionPhase> {
        self.connection(session_id).await.map(|conn| conn.phase())
    }

    /// Bind `connection` to the session, registering it if needed.
    ///
    /// Returns the previously bound connection if it was a different one. The
    /// caller is responsible for closing it.
    pub async fn bind(
        &self,
        credentials: CredentialHandle,
        connection: Arc<dyn Connection>,
    ) -> Option<Arc<dyn Connection>> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .entry(credentials.session_id.clone())
            .or_insert(SessionRecord {
                credentials,
                connection: None,
            });
        let previous = record.connection.replace(connection.clone());
        previous.filter(|prev| !Arc::ptr_eq(prev, &connection))
    }

    /// Clear the binding, but only if `connection` is still the bound one.
    pub async fn unbind(&self, session_id: &str, connection: &Arc<dyn Connection>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(record)
                if record
                    .connection
                    .as_ref()
                    .is_some_and(|bound| Arc::ptr_eq(bound, connection)) =>
            {
                record.connection = None;
                true
            }
            _ => false,
        }
    }

    /// True if `connection` is the one currently bound to the session.
    pub async fn is_bound(&self, session_id: &str, connection: &Arc<dyn Connection>) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|record| record.connection.as_ref())
            .is_some_and(|bound| Arc::ptr_eq(bound, connection))
    }

    /// Forget the session if no connection is bound to it.
    pub async fn forget_idle(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|record| record.connection.is_none())
        {
            sessions.remove(session_id);
            true
        } else {
            false
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Reports a connection's state changes on the event feed and keeps the
/// session store binding in step with it.
#[derive(Clone)]
pub struct ConnectionObserver {
    session_id: String,
    connection: Arc<dyn Connection>,
    store: Arc<SessionStore>,
    events: Arc<EventBroadcaster>,
}

impl ConnectionObserver {
    pub fn new(
        session_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        store: Arc<SessionStore>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            connection,
            store,
            events,
        }
    }

    pub async fn observe(&self, event: &GatewayEvent) {
        let GatewayEvent::Connection(update) = event else {
            return;
        };

        if update.pairing_code.is_some() {
            self.events.emit(&self.session_id, EventKind::Qr).await;
        }

        let Some(phase) = update.phase else {
            return;
        };
        // A replaced connection closing says nothing about the session
        if phase == ConnectionPhase::Closed
            && !self.store.is_bound(&self.session_id, &self.connection).await
        {
            debug!(
                "Ignoring close of replaced connection for session {}",
                self.session_id
            );
            return;
        }
        self.events
            .emit(&self.session_id, EventKind::Connection { status: phase })
            .await;

        if phase == ConnectionPhase::Closed {
            let disconnect = update
                .disconnect
                .clone()
                .or_else(|| self.connection.last_disconnect())
                .unwrap_or_default();
            self.events
                .emit(
                    &self.session_id,
                    EventKind::Disconnected {
                        status_code: disconnect.status_code,
                        reason: disconnect.reason.clone(),
                    },
                )
                .await;
            if disconnect.is_rate_limited() {
                self.events
                    .emit(&self.session_id, EventKind::RateLimit { backoff: true })
                    .await;
            }
            if self.store.unbind(&self.session_id, &self.connection).await {
                debug!("Unbound closed connection for session {}", self.session_id);
            }
        }
    }

    /// Keep observing on a background task until the connection closes.
    ///
    /// A session whose connection closes before it ever opened is dropped
    /// from the store, unless another connection has taken over.
    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut linked = false;
            while let Some(event) = subscription.recv().await {
                self.observe(&event).await;
                let GatewayEvent::Connection(update) = &event else {
                    continue;
                };
                linked |= update.phase == Some(ConnectionPhase::Open);
                if update.is_closed() {
                    if !linked && self.store.forget_idle(&self.session_id).await {
                        info!("Dropped unlinked session {}", self.session_id);
                    }
                    break;
                }
            }
            subscription.detach();
            debug!("Stopped observing connection for session {}", self.session_id);
        })
    }
}

/// A connection just opened and bound for a session.
pub struct OpenedConnection {
    pub connection: Arc<dyn Connection>,
    pub subscription: Subscription,
    pub observer: ConnectionObserver,
}

/// Opens gateway connections for sessions and keeps the store in step.
pub struct SessionManager {
    credentials: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    store: Arc<SessionStore>,
    events: Arc<EventBroadcaster>,
}

impl SessionManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        store: Arc<SessionStore>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            credentials,
            connector,
            store,
            events,
        }
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    /// Open a gateway connection for `credentials` and bind it to the session.
    ///
    /// A connection previously bound to the session is closed.
    pub async fn open(
        &self,
        credentials: &CredentialHandle,
    ) -> Result<OpenedConnection, GatewayError> {
        let session_id = credentials.session_id.clone();
        let Link { connection, events } = self.connector.connect(credentials).await?;

        if let Some(previous) = self.store.bind(credentials.clone(), connection.clone()).await {
            info!("Replacing live connection for session {}", session_id);
            previous.close().await;
        }

        let observer = ConnectionObserver::new(
            session_id,
            connection.clone(),
            self.store.clone(),
            self.events.clone(),
        );
        Ok(OpenedConnection {
            connection,
            subscription: Subscription::new(events),
            observer,
        })
    }

    /// Drop a session from the store and close its connection, if any.
    /// Persisted credentials are left in place.
    pub async fn discard(&self, session_id: &str) {
        if let Some(connection) = self.store.remove(session_id).await {
            connection.close().await;
        }
        debug!("Discarded session {}", session_id);
    }

    /// Close every bound connection. Used at shutdown.
    pub async fn close_all(&self) {
        for session_id in self.store.session_ids().await {
            if let Some(connection) = self.store.connection(&session_id).await {
                if connection.phase() != ConnectionPhase::Closed {
                    warn!("Closing leftover connection for session {}", session_id);
                }
                connection.close().await;
            }
        }
    }
}
