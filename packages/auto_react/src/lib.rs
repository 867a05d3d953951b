//! auto_react - Session lifecycle and auto-reaction engine
//!
//! This crate pairs accounts against a messaging gateway, then watches one
//! channel per session and applies a single reaction to every new message
//! exactly once. It has no HTTP dependencies and knows nothing about the wire
//! protocol of any particular gateway: connections come from a [`Connector`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use auto_react::{
//!     Connector, EventBroadcaster, FsCredentialStore, PairingConfig, PairingFlow,
//!     ReactorRegistry, ReactorSettings, SessionManager, SessionStore,
//! };
//!
//! async fn run(connector: Arc<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
//!     let events = Arc::new(EventBroadcaster::default());
//!     let sessions = Arc::new(SessionManager::new(
//!         Arc::new(FsCredentialStore::new("/var/lib/auto-react/sessions")),
//!         connector,
//!         Arc::new(SessionStore::new()),
//!         events.clone(),
//!     ));
//!
//!     let pairing = PairingFlow::new(sessions.clone(), PairingConfig::default());
//!     let paired = pairing.begin().await?;
//!     println!("scan this: {}", paired.code);
//!
//!     let registry = ReactorRegistry::new(sessions, ReactorSettings::default());
//!     registry
//!         .start_reactor(&paired.session_id, "120363000000000000@newsletter", "🔥")
//!         .await?;
//!
//!     let mut feed = events.attach().await;
//!     while let Some(message) = feed.recv().await {
//!         println!("{}", serde_json::to_string(&message)?);
//!     }
//!     Ok(())
//! }
//! ```

mod credentials;
mod error;
pub mod events;
pub mod gateway;
mod pairing;
pub mod reactor;
mod registry;
mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use credentials::{CredentialHandle, CredentialStore, FsCredentialStore};
pub use error::{CredentialError, GatewayError, PairingError, ReactorError, SendError};
pub use events::{
    DisconnectReason, Event, EventBroadcaster, EventHistory, EventKind, FeedMessage, Observer,
    ObserverId, SkipReason, StatusChange,
};
pub use gateway::{
    BatchKind, Connection, ConnectionPhase, ConnectionUpdate, Connector, Disconnect, GatewayEvent,
    InboundMessage, Link, MessageBatch, MessageKey, Subscription,
};
pub use pairing::{Pairing, PairingConfig, PairingFlow};
pub use reactor::{ReactorHandle, ReactorPhase, ReactorSettings, ReactorSnapshot};
pub use registry::ReactorRegistry;
pub use session::{ConnectionObserver, OpenedConnection, SessionManager, SessionStore};
