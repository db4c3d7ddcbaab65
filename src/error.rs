//! Engine error types.
//!
//! Environmental failures (no session, offline, a cycle already running) are
//! distinct variants so drains can abort without consuming retry counters.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Terminal has no stored admin URL / API key / terminal id.
    #[error("terminal is not configured")]
    NotConfigured,

    /// Connectivity monitor reports offline.
    #[error("network is offline")]
    Offline,

    /// Another sync cycle holds the in-flight guard.
    #[error("a sync cycle is already in progress")]
    SyncInProgress,

    /// Transport-level failure (connect, timeout, TLS).
    #[error("{0}")]
    Network(String),

    /// The remote accepted the connection but rejected the request.
    #[error("{0}")]
    Remote(String),

    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("{0}")]
    InvalidInput(String),
}

impl SyncError {
    /// Environmental failures abort a whole drain; they must never be
    /// charged against a queue item's retry counter.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            SyncError::NotConfigured | SyncError::Offline | SyncError::SyncInProgress
        )
    }
}
