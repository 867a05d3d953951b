//! Per-session credential persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CredentialError;

/// Location of one session's persisted credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialHandle {
    pub session_id: String,
    pub location: PathBuf,
}

#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn exists(&self, session_id: &str) -> Result<bool, CredentialError>;

    /// Create (or reuse) storage for `session_id`.
    async fn create(&self, session_id: &str) -> Result<CredentialHandle, CredentialError>;

    /// Open existing storage, `None` if the session was never created.
    async fn open(&self, session_id: &str) -> Result<Option<CredentialHandle>, CredentialError>;

    async fn delete(&self, session_id: &str) -> Result<(), CredentialError>;
}

/// One directory per session under a common root.
#[derive(Clone, Debug)]
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, CredentialError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    fn io_error(session_id: &str, source: std::io::Error) -> CredentialError {
        CredentialError::Io {
            session_id: session_id.to_string(),
            source,
        }
    }
}

/// Session ids become directory names, so only `[A-Za-z0-9_-]` is accepted.
pub(crate) fn validate_session_id(session_id: &str) -> Result<(), CredentialError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CredentialError::InvalidSessionId(session_id.to_string()))
    }
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn exists(&self, session_id: &str) -> Result<bool, CredentialError> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| Self::io_error(session_id, e))
    }

    async fn create(&self, session_id: &str) -> Result<CredentialHandle, CredentialError> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::io_error(session_id, e))?;
        debug!("Created credential directory {}", dir.display());
        Ok(CredentialHandle {
            session_id: session_id.to_string(),
            location: dir,
        })
    }

    async fn open(&self, session_id: &str) -> Result<Option<CredentialHandle>, CredentialError> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(Some(CredentialHandle {
                session_id: session_id.to_string(),
                location: dir,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(session_id, e)),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<(), CredentialError> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Deleted credential directory {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(session_id, e)),
        }
    }
}
