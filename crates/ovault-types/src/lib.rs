//! Shared types for OVault
//!
//! This crate contains all the shared data structures used across
//! the CLI and the core engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Stored Content Types
// ============================================================================

/// Build the opaque offline URI for a record identifier.
///
/// Offline URIs are generated by the content store at record creation and
/// never reused after deletion.
pub fn format_offline_uri(id: Uuid) -> String {
    format!("offline://{}", id)
}

/// Extract the record identifier from an offline URI, if well-formed.
pub fn parse_offline_uri(uri: &str) -> Option<Uuid> {
    uri.strip_prefix("offline://")
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// A streaming presentation persisted locally under a stable identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredContentRecord {
    /// Opaque stable identifier, usable for playback resolution or removal
    pub offline_uri: String,
    /// The source identifier the content was stored from
    pub source: String,
    /// Snapshot of the resolved manifest at store time
    pub manifest: String,
    /// Ordered segment inventory
    pub segments: Vec<StoredSegment>,
    /// Persistent license referenced by this record, if any
    pub license_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub status: RecordStatus,
}

impl StoredContentRecord {
    /// The record identifier embedded in the offline URI.
    pub fn record_id(&self) -> Option<Uuid> {
        parse_offline_uri(&self.offline_uri)
    }
}

/// Lifecycle status of a stored content record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Complete,
    Corrupt,
}

/// One persisted media segment of a stored presentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSegment {
    pub index: u32,
    /// The locator the segment bytes were fetched from
    pub locator: String,
    pub size_bytes: u64,
    /// Key of the persisted blob holding the segment bytes
    pub blob_key: String,
}

// ============================================================================
// License Types
// ============================================================================

/// A DRM license session tracked by the license manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub id: Uuid,
    pub key_system: String,
    /// Platform session key (persistent session id or ephemeral handle)
    pub session_key: String,
    pub persistent: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Capability report for one key system, as answered by the platform oracle
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KeySystemSupport {
    /// Whether license state survives process restart on this platform
    pub persistent_state: bool,
}

// ============================================================================
// Manifest Types
// ============================================================================

/// A resolved presentation: addressable segments plus protection info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationManifest {
    /// Raw manifest document, snapshotted onto the stored record
    pub raw: String,
    pub segments: Vec<SegmentRef>,
    pub protection: Option<ProtectionInfo>,
}

/// Reference to one addressable media segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRef {
    pub index: u32,
    pub locator: String,
    /// Advertised size, when the manifest declares one
    pub size_hint: Option<u64>,
}

/// Content protection metadata carried by a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionInfo {
    pub key_system: String,
    #[serde(default)]
    pub init_data: Vec<u8>,
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Engine configuration governing subsequent store operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Request a persistent license for protected content
    pub use_persistent_license: bool,
    /// Bounded worker pool budget for segment fetches within one session
    pub max_concurrent_fetches: u32,
    /// Maximum retries per segment before the session aborts
    pub max_retries: u32,
    /// Delay in seconds between retry attempts
    pub retry_delay_secs: u32,
    /// Download speed limit in bytes per second (None = unlimited)
    pub speed_limit: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            use_persistent_license: false,
            max_concurrent_fetches: 4,
            max_retries: 3,
            retry_delay_secs: 1,
            speed_limit: None,
        }
    }
}

/// Options overlay for updating the engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureOptions {
    pub use_persistent_license: Option<bool>,
    pub max_concurrent_fetches: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u32>,
    pub speed_limit: Option<Option<u64>>,
}

impl StoreConfig {
    /// Apply an options overlay, leaving unset fields untouched.
    pub fn apply(&mut self, options: ConfigureOptions) {
        if let Some(persistent) = options.use_persistent_license {
            self.use_persistent_license = persistent;
        }
        if let Some(budget) = options.max_concurrent_fetches {
            self.max_concurrent_fetches = budget.max(1);
        }
        if let Some(retries) = options.max_retries {
            self.max_retries = retries;
        }
        if let Some(delay) = options.retry_delay_secs {
            self.retry_delay_secs = delay;
        }
        if let Some(limit) = options.speed_limit {
            self.speed_limit = limit;
        }
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// States of a download session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    FetchingManifest,
    AcquiringLicense,
    FetchingSegments,
    Committing,
    Complete,
    Aborting,
    Aborted,
}

impl SessionState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Aborted)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    StoreStateChanged {
        source: String,
        state: SessionState,
    },
    StoreProgress {
        source: String,
        fetched_segments: u64,
        total_segments: u64,
        bytes_downloaded: u64,
        speed: u64,
        eta: Option<u64>, // seconds
    },
    ContentStored {
        record: StoredContentRecord,
    },
    ContentRemoved {
        offline_uri: String,
    },
    StoreFailed {
        source: String,
        error: String,
    },
}

// ============================================================================
// Bulk Operation Types
// ============================================================================

/// Aggregate outcome of a delete-all sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteAllReport {
    /// Offline URIs successfully removed
    pub removed: Vec<String>,
    /// Per-identifier failures; the sweep continues past each
    pub failed: Vec<RemovalFailure>,
}

impl DeleteAllReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One failed removal inside a delete-all sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalFailure {
    pub offline_uri: String,
    pub error: String,
}
