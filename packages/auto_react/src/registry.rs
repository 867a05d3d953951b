use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{CredentialError, ReactorError};
use crate::reactor::{self, ReactorHandle, ReactorSettings, ReactorSnapshot};
use crate::session::SessionManager;

struct RegisteredReactor {
    generation: u64,
    handle: ReactorHandle,
}

type Reactors = Arc<RwLock<HashMap<String, RegisteredReactor>>>;

/// A reactor's claim on its registry entry. Releasing only removes the entry
/// if it still belongs to the same reactor.
pub(crate) struct RegistrySlot {
    reactors: Reactors,
    session_id: String,
    generation: u64,
}

impl RegistrySlot {
    pub(crate) async fn release(&self) -> bool {
        let mut reactors = self.reactors.write().await;
        match reactors.get(&self.session_id) {
            Some(entry) if entry.generation == self.generation => {
                reactors.remove(&self.session_id);
                debug!("Released reactor slot for session {}", self.session_id);
                true
            }
            _ => false,
        }
    }
}

/// At most one running auto-reactor per session.
pub struct ReactorRegistry {
    reactors: Reactors,
    next_generation: AtomicU64,
    sessions: Arc<SessionManager>,
    settings: ReactorSettings,
}

impl ReactorRegistry {
    pub fn new(sessions: Arc<SessionManager>, settings: ReactorSettings) -> Self {
        Self {
            reactors: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            sessions,
            settings,
        }
    }

    pub fn settings(&self) -> &ReactorSettings {
        &self.settings
    }

    /// Start reacting with `emoji` to new messages in `channel_id`.
    ///
    /// Returns once the reactor has a connection. Fails with
    /// [`ReactorError::AlreadyRunning`] without touching the running reactor.
    pub async fn start_reactor(
        &self,
        session_id: &str,
        channel_id: &str,
        emoji: &str,
    ) -> Result<ReactorHandle, ReactorError> {
        let (handle, ready) = {
            let mut reactors = self.reactors.write().await;
            if reactors.contains_key(session_id) {
                return Err(ReactorError::AlreadyRunning(session_id.to_string()));
            }

            let credentials = match self.sessions.credentials().open(session_id).await {
                Ok(Some(credentials)) => credentials,
                Ok(None) | Err(CredentialError::InvalidSessionId(_)) => {
                    return Err(ReactorError::SessionNotFound(session_id.to_string()));
                }
                Err(e) => return Err(e.into()),
            };

            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
            let slot = RegistrySlot {
                reactors: self.reactors.clone(),
                session_id: session_id.to_string(),
                generation,
            };
            let (handle, ready) = reactor::spawn(
                self.sessions.clone(),
                credentials,
                channel_id.to_string(),
                emoji.to_string(),
                self.settings.clone(),
                slot,
            );
            reactors.insert(
                session_id.to_string(),
                RegisteredReactor {
                    generation,
                    handle: handle.clone(),
                },
            );
            (handle, ready)
        };

        match ready.await {
            Ok(Ok(())) => {
                info!(
                    "Reactor started for session {} ({} on {})",
                    session_id, emoji, channel_id
                );
                Ok(handle)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReactorError::Aborted(session_id.to_string())),
        }
    }

    /// Stop the session's reactor and wait until it has wound down.
    pub async fn stop_reactor(&self, session_id: &str) -> Result<(), ReactorError> {
        let (generation, handle) = self
            .reactors
            .read()
            .await
            .get(session_id)
            .map(|entry| (entry.generation, entry.handle.clone()))
            .ok_or_else(|| ReactorError::NoActiveReactor(session_id.to_string()))?;

        handle.stop().await;

        let mut reactors = self.reactors.write().await;
        if reactors
            .get(session_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            reactors.remove(session_id);
        }
        Ok(())
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.reactors.read().await.contains_key(session_id)
    }

    pub async fn handle(&self, session_id: &str) -> Option<ReactorHandle> {
        self.reactors
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.handle.clone())
    }

    /// Snapshots of every registered reactor, ordered by session id.
    pub async fn list(&self) -> Vec<ReactorSnapshot> {
        let handles: Vec<ReactorHandle> = self
            .reactors
            .read()
            .await
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.reactors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.reactors.read().await.is_empty()
    }

    /// Stop every reactor. Used at shutdown.
    pub async fn stop_all(&self) {
        let session_ids: Vec<String> = self.reactors.read().await.keys().cloned().collect();
        if !session_ids.is_empty() {
            info!("Stopping {} reactor(s)", session_ids.len());
        }
        for session_id in session_ids {
            // Reactors that ended on their own in the meantime are fine
            let _ = self.stop_reactor(&session_id).await;
        }
    }
}
