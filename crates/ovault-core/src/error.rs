//! Error types for the OVault engine

use thiserror::Error;

/// Errors that can occur in the OVault engine
#[derive(Debug, Error)]
pub enum OvaultError {
    #[error("no usable persistence backend available")]
    StorageUnavailable,

    #[error("storage quota exceeded")]
    StorageFull,

    #[error("stored record failed validation: {0}")]
    StorageCorrupt(String),

    #[error("key system not supported: {0}")]
    LicenseUnsupported(String),

    #[error("license acquisition failed: {0}")]
    LicenseAcquisitionFailed(String),

    #[error("could not resolve manifest for {0}")]
    ManifestUnresolvable(String),

    #[error("segment fetch failed after {attempts} attempt(s): {locator}")]
    SegmentFetchFailed { locator: String, attempts: u32 },

    #[error("a store session is already active for {0}")]
    SessionAlreadyActive(String),

    #[error("content is busy with an uncommitted store session: {0}")]
    ContentBusy(String),

    #[error("content not found: {0}")]
    NotFound(String),

    #[error("partial removal of {offline_uri}: {detail}")]
    PartialRemoval { offline_uri: String, detail: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server error: {status} for {locator}")]
    ServerError { status: u16, locator: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OvaultError {
    /// Check if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            OvaultError::Network(_) => true,
            OvaultError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Map an I/O error to the storage taxonomy, preserving quota exhaustion.
pub(crate) fn map_blob_io(error: std::io::Error) -> OvaultError {
    match error.kind() {
        std::io::ErrorKind::StorageFull => OvaultError::StorageFull,
        _ => OvaultError::Io(error),
    }
}

/// Map a database error to the storage taxonomy, preserving quota exhaustion.
pub(crate) fn map_db_err(error: sqlx::Error) -> OvaultError {
    if let sqlx::Error::Database(ref db) = error {
        // SQLITE_FULL
        if db.code().as_deref() == Some("13") {
            return OvaultError::StorageFull;
        }
    }
    OvaultError::Database(error)
}
