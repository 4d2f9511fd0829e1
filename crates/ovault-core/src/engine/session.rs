//! Download session - drives one store operation end to end
//!
//! This is the orchestrator for a single presentation: it resolves the
//! manifest, acquires a license when the content is protected, fans segment
//! fetches out over a bounded worker pool, and commits everything through
//! the content store in one transaction. Abort from any non-terminal state
//! releases the license and discards staged data before reporting the
//! originating error.

use crate::engine::license::LicenseManager;
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::store::{ContentStore, StagedSegment};
use crate::error::{map_blob_io, OvaultError};
use crate::traits::{ManifestResolver, SegmentFetch};
use ovault_types::{
    EngineEvent, LicenseRecord, PresentationManifest, SegmentRef, SessionState, StoreConfig,
    StoredContentRecord,
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A download session for one source identifier
pub struct DownloadSession {
    session_id: Uuid,
    source: String,
    config: StoreConfig,
    store: ContentStore,
    resolver: Arc<dyn ManifestResolver>,
    fetcher: Arc<dyn SegmentFetch>,
    licenses: LicenseManager,
    event_tx: broadcast::Sender<EngineEvent>,
    cancelled: Arc<AtomicBool>,
    state: SessionState,
    bytes_downloaded: Arc<AtomicU64>,
    fetched_segments: Arc<AtomicU64>,
}

impl DownloadSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: String,
        config: StoreConfig,
        store: ContentStore,
        resolver: Arc<dyn ManifestResolver>,
        fetcher: Arc<dyn SegmentFetch>,
        licenses: LicenseManager,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            source,
            config,
            store,
            resolver,
            fetcher,
            licenses,
            event_tx,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: SessionState::Created,
            bytes_downloaded: Arc::new(AtomicU64::new(0)),
            fetched_segments: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Shared flag for external cancellation
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn transition(&mut self, state: SessionState) {
        debug_assert!(!self.state.is_terminal());
        self.state = state;
        let _ = self.event_tx.send(EngineEvent::StoreStateChanged {
            source: self.source.clone(),
            state,
        });
    }

    fn check_cancelled(&self) -> Result<(), OvaultError> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(OvaultError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run the session to completion
    pub async fn run(mut self) -> Result<StoredContentRecord, OvaultError> {
        info!(
            "Starting store session {} for {}",
            self.session_id, self.source
        );

        if let Err(e) = self.check_cancelled() {
            return self.abort(None, e).await;
        }

        self.transition(SessionState::FetchingManifest);
        let manifest = match self.resolver.resolve(&self.source).await {
            Ok(m) => m,
            Err(e) => return self.abort(None, e).await,
        };
        if manifest.segments.is_empty() {
            let e = OvaultError::ManifestUnresolvable(format!(
                "{}: manifest declares no segments",
                self.source
            ));
            return self.abort(None, e).await;
        }
        if manifest
            .segments
            .iter()
            .enumerate()
            .any(|(i, seg)| seg.index != i as u32)
        {
            let e = OvaultError::ManifestUnresolvable(format!(
                "{}: segment indices not contiguous",
                self.source
            ));
            return self.abort(None, e).await;
        }
        if let Err(e) = self.check_cancelled() {
            return self.abort(None, e).await;
        }

        // Support is verified before any segment bytes move, so an
        // unsupported key system never leaves a partial download behind.
        let license = if let Some(protection) = manifest.protection.clone() {
            self.transition(SessionState::AcquiringLicense);
            let persistent = self.config.use_persistent_license;
            if let Err(e) = self.licenses.ensure_supported(&protection, persistent).await {
                return self.abort(None, e).await;
            }
            match self.licenses.acquire(&protection, persistent).await {
                Ok(license) => Some(license),
                Err(e) => return self.abort(None, e).await,
            }
        } else {
            None
        };

        if let Err(e) = self.check_cancelled() {
            return self.abort(license.as_ref(), e).await;
        }

        self.transition(SessionState::FetchingSegments);
        let staged = match self.fetch_segments(&manifest).await {
            Ok(staged) => staged,
            Err(e) => return self.abort(license.as_ref(), e).await,
        };

        self.transition(SessionState::Committing);
        let persistent_license = license.as_ref().filter(|l| l.persistent);
        let record = match self
            .store
            .commit_content(&self.source, &manifest.raw, &staged, persistent_license)
            .await
        {
            Ok(record) => record,
            Err(e) => return self.abort(license.as_ref(), e).await,
        };

        // Temporary licenses are scoped to this session; the stored record
        // keeps no reference to them.
        if let Some(lic) = license.as_ref().filter(|l| !l.persistent) {
            if let Err(e) = self.licenses.release(lic).await {
                warn!(
                    "Failed to release temporary license for {}: {}",
                    self.source, e
                );
            }
        }

        if let Err(e) = self.store.discard_staging(self.session_id).await {
            warn!("Failed to clean staging for {}: {}", self.source, e);
        }

        self.transition(SessionState::Complete);
        let _ = self.event_tx.send(EngineEvent::ContentStored {
            record: record.clone(),
        });
        info!("Stored {} as {}", self.source, record.offline_uri);

        Ok(record)
    }

    /// Abort path reachable from any non-terminal state: release any
    /// acquired license, discard staged data, report the originating error.
    async fn abort(
        mut self,
        license: Option<&LicenseRecord>,
        cause: OvaultError,
    ) -> Result<StoredContentRecord, OvaultError> {
        self.transition(SessionState::Aborting);

        if let Some(lic) = license {
            if let Err(e) = self.licenses.release(lic).await {
                warn!(
                    "Failed to release license while aborting {}: {}",
                    self.source, e
                );
            }
        }

        if let Err(e) = self.store.discard_staging(self.session_id).await {
            warn!("Failed to discard staging for {}: {}", self.source, e);
        }

        self.transition(SessionState::Aborted);
        let _ = self.event_tx.send(EngineEvent::StoreFailed {
            source: self.source.clone(),
            error: cause.to_string(),
        });

        Err(cause)
    }

    /// Fetch all segments through a bounded worker pool with per-segment
    /// bounded retries. Fetches are unordered; the commit is strictly after
    /// every one of them.
    async fn fetch_segments(
        &mut self,
        manifest: &PresentationManifest,
    ) -> Result<Vec<StagedSegment>, OvaultError> {
        let staging = self.store.staging_path(self.session_id);
        tokio::fs::create_dir_all(&staging).await.map_err(map_blob_io)?;

        let limiter = match self.config.speed_limit {
            Some(limit) if limit > 0 => RateLimiter::new(limit),
            _ => RateLimiter::unlimited(),
        };

        let total_segments = manifest.segments.len() as u64;
        let total_bytes_hint: Option<u64> = manifest.segments.iter().map(|s| s.size_hint).sum();
        let reporter_stop = Arc::new(AtomicBool::new(false));
        let reporter =
            self.spawn_progress_reporter(total_segments, total_bytes_hint, reporter_stop.clone());

        let retry_delay = Duration::from_secs(self.config.retry_delay_secs as u64);
        let budget = self.config.max_concurrent_fetches.max(1) as usize;

        let mut pending: VecDeque<SegmentRef> = manifest.segments.iter().cloned().collect();
        let mut retry_counts: HashMap<u32, u32> = HashMap::new();
        let mut sizes: HashMap<u32, u64> = HashMap::new();
        let mut join_set: JoinSet<(SegmentRef, Result<u64, OvaultError>)> = JoinSet::new();

        let result = loop {
            while join_set.len() < budget {
                let Some(seg) = pending.pop_front() else { break };
                let attempt = retry_counts.get(&seg.index).copied().unwrap_or(0);
                join_set.spawn(fetch_one(
                    seg,
                    attempt,
                    retry_delay,
                    self.fetcher.clone(),
                    limiter.clone(),
                    staging.clone(),
                    self.cancelled.clone(),
                    self.bytes_downloaded.clone(),
                ));
            }

            let Some(joined) = join_set.join_next().await else {
                break Ok(());
            };

            match joined {
                Ok((seg, Ok(size))) => {
                    sizes.insert(seg.index, size);
                    self.fetched_segments.fetch_add(1, Ordering::AcqRel);
                }
                Ok((_, Err(OvaultError::Cancelled))) => {
                    info!("Store session for {} cancelled", self.source);
                    break Err(OvaultError::Cancelled);
                }
                Ok((seg, Err(e))) => {
                    let count = retry_counts.entry(seg.index).or_insert(0);
                    if e.is_retryable() && *count < self.config.max_retries {
                        *count += 1;
                        warn!(
                            "Segment {} failed (attempt {}/{}): {}. Will retry.",
                            seg.index, count, self.config.max_retries, e
                        );
                        pending.push_back(seg);
                    } else {
                        error!("Segment {} failed: {}", seg.index, e);
                        break Err(OvaultError::SegmentFetchFailed {
                            locator: seg.locator.clone(),
                            attempts: *count + 1,
                        });
                    }
                }
                Err(e) => {
                    break Err(OvaultError::Internal(format!(
                        "segment task panicked: {}",
                        e
                    )));
                }
            }

            if self.cancelled.load(Ordering::Acquire) {
                break Err(OvaultError::Cancelled);
            }
        };

        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        reporter_stop.store(true, Ordering::Release);
        let _ = reporter.await;

        result?;

        Ok(manifest
            .segments
            .iter()
            .map(|seg| StagedSegment {
                index: seg.index,
                locator: seg.locator.clone(),
                size_bytes: sizes.get(&seg.index).copied().unwrap_or(0),
                path: staging.join(format!("{}.seg", seg.index)),
            })
            .collect())
    }

    /// Periodic progress reporter with smoothed speed
    fn spawn_progress_reporter(
        &self,
        total_segments: u64,
        total_bytes: Option<u64>,
        stop: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let source = self.source.clone();
        let bytes_downloaded = self.bytes_downloaded.clone();
        let fetched_segments = self.fetched_segments.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut last_bytes = bytes_downloaded.load(Ordering::Acquire);
            let mut last_time = std::time::Instant::now();
            let mut smoothed_speed: f64 = 0.0;
            let alpha = 0.2;

            while !stop.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(500)).await;

                let now = std::time::Instant::now();
                let bytes = bytes_downloaded.load(Ordering::Acquire);
                let elapsed = now.duration_since(last_time).as_secs_f64();
                let instant_speed = if elapsed > 0.0 {
                    bytes.saturating_sub(last_bytes) as f64 / elapsed
                } else {
                    0.0
                };
                smoothed_speed = alpha * instant_speed + (1.0 - alpha) * smoothed_speed;
                let speed = smoothed_speed as u64;

                let eta = match total_bytes {
                    Some(total) if speed > 0 => Some(total.saturating_sub(bytes) / speed),
                    _ => None,
                };

                let _ = event_tx.send(EngineEvent::StoreProgress {
                    source: source.clone(),
                    fetched_segments: fetched_segments.load(Ordering::Acquire),
                    total_segments,
                    bytes_downloaded: bytes,
                    speed,
                    eta,
                });

                last_bytes = bytes;
                last_time = now;
            }
        })
    }
}

/// Fetch one segment into the staging area.
///
/// Workers check the cancellation flag around every suspension point so an
/// abort never blocks on a slow transfer longer than one chunk.
#[allow(clippy::too_many_arguments)]
async fn fetch_one(
    seg: SegmentRef,
    attempt: u32,
    retry_delay: Duration,
    fetcher: Arc<dyn SegmentFetch>,
    limiter: RateLimiter,
    staging: PathBuf,
    cancelled: Arc<AtomicBool>,
    bytes_downloaded: Arc<AtomicU64>,
) -> (SegmentRef, Result<u64, OvaultError>) {
    if attempt > 0 {
        tokio::time::sleep(retry_delay).await;
    }
    if cancelled.load(Ordering::Acquire) {
        return (seg, Err(OvaultError::Cancelled));
    }

    // Keep watching the cancel flag while the transfer is in flight so an
    // abort never waits on a slow fetch.
    let locator = seg.locator.clone();
    let fetch = fetcher.fetch(&locator);
    tokio::pin!(fetch);
    let data = loop {
        tokio::select! {
            result = &mut fetch => match result {
                Ok(data) => break data,
                Err(e) => return (seg, Err(e)),
            },
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                if cancelled.load(Ordering::Acquire) {
                    return (seg, Err(OvaultError::Cancelled));
                }
            }
        }
    };

    let len = data.len() as u64;
    limiter.throttle(len).await;

    let path = staging.join(format!("{}.seg", seg.index));
    if let Err(e) = tokio::fs::write(&path, &data).await {
        return (seg, Err(map_blob_io(e)));
    }

    bytes_downloaded.fetch_add(len, Ordering::AcqRel);
    (seg, Ok(len))
}
