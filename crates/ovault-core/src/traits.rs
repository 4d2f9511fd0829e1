//! Collaborator seams of the engine.
//!
//! The engine treats manifest resolution, DRM, and segment transport as
//! injected capabilities so instances stay fully isolated and testable.

use crate::error::OvaultError;
use async_trait::async_trait;
use bytes::Bytes;
use ovault_types::{KeySystemSupport, PresentationManifest};
use std::collections::HashMap;

/// Resolves a source identifier into a sequence of addressable segments.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Errors surface as [`OvaultError::ManifestUnresolvable`].
    async fn resolve(&self, source: &str) -> Result<PresentationManifest, OvaultError>;
}

/// Platform DRM capability oracle and license session broker.
#[async_trait]
pub trait DrmClient: Send + Sync {
    /// Report which key systems the platform supports.
    async fn probe_support(&self) -> HashMap<String, KeySystemSupport>;

    /// Open a license session and return its platform session key.
    async fn acquire(
        &self,
        key_system: &str,
        init_data: &[u8],
        persistent: bool,
    ) -> Result<String, OvaultError>;

    /// Block until the platform confirms durable storage of a persistent
    /// session.
    async fn confirm_persisted(&self, session_key: &str) -> Result<(), OvaultError>;

    /// Release a license session.
    async fn release(&self, session_key: &str) -> Result<(), OvaultError>;
}

/// Retrieves raw bytes for a segment locator.
///
/// Implementations must be idempotent and must not retry internally; retry
/// policy belongs to the session coordinator.
#[async_trait]
pub trait SegmentFetch: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Bytes, OvaultError>;
}
