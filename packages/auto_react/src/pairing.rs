use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PairingError;
use crate::gateway::{GatewayEvent, Subscription};
use crate::session::{ConnectionObserver, OpenedConnection, SessionManager};

/// Default time to wait for the gateway to issue a pairing code.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PairingConfig {
    pub timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PAIRING_TIMEOUT,
        }
    }
}

/// A session waiting for its pairing code to be scanned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pairing {
    pub session_id: String,
    pub code: String,
}

/// Creates new sessions and obtains their pairing codes.
pub struct PairingFlow {
    sessions: Arc<SessionManager>,
    config: PairingConfig,
}

impl PairingFlow {
    pub fn new(sessions: Arc<SessionManager>, config: PairingConfig) -> Self {
        Self { sessions, config }
    }

    /// Start pairing a fresh session.
    ///
    /// On success the connection stays open and observed until the device is
    /// linked or the gateway closes it. On failure or timeout the connection
    /// is closed and the session is dropped from the store.
    pub async fn begin(&self) -> Result<Pairing, PairingError> {
        let session_id = Uuid::new_v4().to_string();
        let credentials = self.sessions.credentials().create(&session_id).await?;
        info!("Pairing session {}", session_id);

        let OpenedConnection {
            connection,
            mut subscription,
            observer,
        } = match self.sessions.open(&credentials).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Pairing connection for {} failed: {}", session_id, e);
                self.sessions.discard(&session_id).await;
                return Err(e.into());
            }
        };

        let outcome = tokio::time::timeout(
            self.config.timeout,
            wait_for_code(&observer, &mut subscription),
        )
        .await
        .unwrap_or(Err(PairingError::Timeout));

        match outcome {
            Ok(code) => {
                info!("Pairing code issued for session {}", session_id);
                observer.spawn(subscription);
                Ok(Pairing { session_id, code })
            }
            Err(e) => {
                warn!("Pairing session {} abandoned: {}", session_id, e);
                subscription.detach();
                connection.close().await;
                self.sessions.discard(&session_id).await;
                Err(e)
            }
        }
    }
}

async fn wait_for_code(
    observer: &ConnectionObserver,
    subscription: &mut Subscription,
) -> Result<String, PairingError> {
    while let Some(event) = subscription.recv().await {
        observer.observe(&event).await;
        let GatewayEvent::Connection(update) = &event else {
            continue;
        };
        if let Some(code) = &update.pairing_code {
            return Ok(code.clone());
        }
        if update.is_closed() {
            let disconnect = update.disconnect.clone().unwrap_or_default();
            return Err(PairingError::Failed {
                status_code: disconnect.status_code,
                reason: disconnect.reason,
            });
        }
    }
    Err(PairingError::Failed {
        status_code: None,
        reason: None,
    })
}
