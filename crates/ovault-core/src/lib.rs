//! OVault Core - Offline Content Storage Engine
//!
//! This crate downloads streaming presentations (manifest + media segments,
//! optionally DRM-protected), persists them locally under stable offline
//! URIs, tracks license lifecycle, and exposes store/remove/delete-all
//! operations that stay consistent under concurrent use.

mod drm;
mod error;
mod resolver;
mod traits;

pub mod engine;

pub use drm::*;
pub use engine::*;
pub use error::*;
pub use resolver::*;
pub use traits::*;

use ovault_types::{
    ConfigureOptions, DeleteAllReport, EngineEvent, RemovalFailure, StoreConfig,
    StoredContentRecord,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// The main OVault engine instance
///
/// Owns the content registry and all lifecycle guarantees. Instances are
/// fully isolated; nothing is process-wide.
#[derive(Clone)]
pub struct OvaultCore {
    /// Durable store, absent when the host provides no usable backend
    store: Option<ContentStore>,
    /// Configuration for subsequent store calls
    config: Arc<RwLock<StoreConfig>>,
    /// Active download sessions
    sessions: Arc<SessionManager>,
    /// License broker
    licenses: LicenseManager,
    resolver: Arc<dyn ManifestResolver>,
    fetcher: Arc<dyn SegmentFetch>,
    /// Event broadcaster
    event_tx: broadcast::Sender<EngineEvent>,
}

impl OvaultCore {
    /// Create an engine with the default HTTP segment fetcher
    pub async fn new(
        data_dir: PathBuf,
        resolver: Arc<dyn ManifestResolver>,
        drm: Arc<dyn DrmClient>,
    ) -> Result<Self, OvaultError> {
        let client = reqwest::Client::builder()
            .user_agent("OVault/0.1.0")
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| OvaultError::Internal(e.to_string()))?;

        let fetcher = Arc::new(HttpSegmentFetcher::new(client));
        Self::with_fetcher(data_dir, resolver, drm, fetcher).await
    }

    /// Create an engine with an injected segment fetch capability
    pub async fn with_fetcher(
        data_dir: PathBuf,
        resolver: Arc<dyn ManifestResolver>,
        drm: Arc<dyn DrmClient>,
        fetcher: Arc<dyn SegmentFetch>,
    ) -> Result<Self, OvaultError> {
        // A missing backend is not an error; callers check support() before
        // using the other operations.
        let store = match ContentStore::open(&data_dir).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("Persistence backend unavailable: {}", e);
                None
            }
        };

        let (event_tx, _) = broadcast::channel(1024);

        Ok(Self {
            store,
            config: Arc::new(RwLock::new(StoreConfig::default())),
            sessions: Arc::new(SessionManager::new()),
            licenses: LicenseManager::new(drm),
            resolver,
            fetcher,
            event_tx,
        })
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn backend(&self) -> Result<&ContentStore, OvaultError> {
        self.store.as_ref().ok_or(OvaultError::StorageUnavailable)
    }

    // ========================================================================
    // Public Operations
    // ========================================================================

    /// Whether the host environment provides a usable persistence backend
    pub fn support(&self) -> bool {
        self.store.is_some()
    }

    /// Get the configuration governing subsequent store calls
    pub async fn config(&self) -> StoreConfig {
        self.config.read().await.clone()
    }

    /// Update configuration for subsequent store calls only; sessions
    /// already running keep their snapshot.
    pub async fn configure(&self, options: ConfigureOptions) {
        self.config.write().await.apply(options);
    }

    /// Download and persist a presentation, returning its record.
    ///
    /// Fails with the first unrecoverable error from any stage, leaving no
    /// partial record visible. At most one session per source may be active;
    /// a concurrent call for the same source fails fast with
    /// `SessionAlreadyActive`.
    pub async fn store(&self, source: &str) -> Result<StoredContentRecord, OvaultError> {
        let store = self.backend()?.clone();
        let config = self.config.read().await.clone();

        let session = DownloadSession::new(
            source.to_string(),
            config,
            store,
            self.resolver.clone(),
            self.fetcher.clone(),
            self.licenses.clone(),
            self.event_tx.clone(),
        );

        self.sessions.run(session).await
    }

    /// Cancel an in-flight store for a source.
    ///
    /// Returns only after the session has finished aborting: license
    /// released, staged data rolled back, nothing half-written observable.
    pub async fn cancel_store(&self, source: &str) -> Result<(), OvaultError> {
        self.sessions.cancel(source).await
    }

    /// Resolve an offline URI back to its record
    pub async fn resolve(&self, offline_uri: &str) -> Result<StoredContentRecord, OvaultError> {
        self.backend()?
            .get(offline_uri)
            .await?
            .ok_or_else(|| OvaultError::NotFound(offline_uri.to_string()))
    }

    /// List every stored record
    pub async fn list_all(&self) -> Result<Vec<StoredContentRecord>, OvaultError> {
        self.backend()?.list_all().await
    }

    /// Remove stored content: release its license, then delete its blobs
    /// and registry rows.
    ///
    /// Rejected with `ContentBusy` while a store session for the record's
    /// source is still uncommitted. If one half of the removal fails the
    /// record is marked corrupt and `PartialRemoval` is surfaced; the call
    /// may be retried.
    pub async fn remove(&self, offline_uri: &str) -> Result<(), OvaultError> {
        let store = self.backend()?.clone();

        let record = store
            .get(offline_uri)
            .await?
            .ok_or_else(|| OvaultError::NotFound(offline_uri.to_string()))?;

        if self.sessions.is_active(&record.source).await {
            return Err(OvaultError::ContentBusy(offline_uri.to_string()));
        }

        // License release comes first; a license must never outlive the
        // records that reference it.
        if let Some(license_id) = record.license_id {
            if let Some(license) = store.get_license(license_id).await? {
                if let Err(e) = self.licenses.release(&license).await {
                    store.mark_corrupt(offline_uri).await?;
                    return Err(OvaultError::PartialRemoval {
                        offline_uri: offline_uri.to_string(),
                        detail: format!("license release failed: {}", e),
                    });
                }
                store.delete_license(license_id).await?;
            }
            store.clear_license_ref(offline_uri).await?;
        }

        let record_id = record.record_id().ok_or_else(|| {
            OvaultError::StorageCorrupt(format!("{}: malformed offline uri", offline_uri))
        })?;

        if let Err(e) = store.remove_blobs(record_id).await {
            store.mark_corrupt(offline_uri).await?;
            return Err(OvaultError::PartialRemoval {
                offline_uri: offline_uri.to_string(),
                detail: format!("blob deletion failed: {}", e),
            });
        }

        store.delete(offline_uri).await?;

        info!("Removed {}", offline_uri);
        self.emit(EngineEvent::ContentRemoved {
            offline_uri: offline_uri.to_string(),
        });

        Ok(())
    }

    /// Remove every stored record, continuing past individual failures.
    ///
    /// Returns an aggregate report naming which identifiers failed; partial
    /// progress is preserved and the sweep can be rerun.
    pub async fn delete_all(&self) -> Result<DeleteAllReport, OvaultError> {
        let records = self.list_all().await?;

        let mut report = DeleteAllReport::default();
        for record in records {
            match self.remove(&record.offline_uri).await {
                Ok(()) => report.removed.push(record.offline_uri),
                Err(e) => {
                    warn!("Failed to remove {}: {}", record.offline_uri, e);
                    report.failed.push(RemovalFailure {
                        offline_uri: record.offline_uri,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}
