//! End-to-end engine tests with fake collaborators
//!
//! Every collaborator (manifest resolver, segment fetch, DRM client) is
//! injected, so each test runs against a fully isolated engine instance in
//! its own temp directory.

use async_trait::async_trait;
use bytes::Bytes;
use ovault_core::{DrmClient, ManifestResolver, OvaultCore, OvaultError, SegmentFetch};
use ovault_types::{
    ConfigureOptions, KeySystemSupport, PresentationManifest, ProtectionInfo, RecordStatus,
    SegmentRef,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Fakes
// ============================================================================

struct FakeResolver {
    manifests: HashMap<String, PresentationManifest>,
}

#[async_trait]
impl ManifestResolver for FakeResolver {
    async fn resolve(&self, source: &str) -> Result<PresentationManifest, OvaultError> {
        self.manifests
            .get(source)
            .cloned()
            .ok_or_else(|| OvaultError::ManifestUnresolvable(source.to_string()))
    }
}

#[derive(Default)]
struct FakeFetcher {
    payloads: HashMap<String, Vec<u8>>,
    /// locator -> remaining failures before success
    failures: Mutex<HashMap<String, u32>>,
    delays: HashMap<String, Duration>,
    fetch_count: AtomicUsize,
}

impl FakeFetcher {
    fn new() -> Self {
        Self::default()
    }

    fn with_payload(mut self, locator: &str, payload: &[u8]) -> Self {
        self.payloads.insert(locator.to_string(), payload.to_vec());
        self
    }

    fn with_failures(self, locator: &str, count: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(locator.to_string(), count);
        self
    }

    fn with_delay(mut self, locator: &str, delay: Duration) -> Self {
        self.delays.insert(locator.to_string(), delay);
        self
    }

    fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentFetch for FakeFetcher {
    async fn fetch(&self, locator: &str) -> Result<Bytes, OvaultError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(locator) {
            tokio::time::sleep(*delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(locator) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(OvaultError::ServerError {
                        status: 503,
                        locator: locator.to_string(),
                    });
                }
            }
        }

        self.payloads
            .get(locator)
            .map(|p| Bytes::from(p.clone()))
            .ok_or_else(|| OvaultError::ServerError {
                status: 404,
                locator: locator.to_string(),
            })
    }
}

#[derive(Default)]
struct FakeDrm {
    support: HashMap<String, KeySystemSupport>,
    acquired: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl FakeDrm {
    fn with_support(key_system: &str, persistent_state: bool) -> Self {
        let mut support = HashMap::new();
        support.insert(key_system.to_string(), KeySystemSupport { persistent_state });
        Self {
            support,
            ..Default::default()
        }
    }

    fn acquired(&self) -> Vec<String> {
        self.acquired.lock().unwrap().clone()
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl DrmClient for FakeDrm {
    async fn probe_support(&self) -> HashMap<String, KeySystemSupport> {
        self.support.clone()
    }

    async fn acquire(
        &self,
        key_system: &str,
        _init_data: &[u8],
        _persistent: bool,
    ) -> Result<String, OvaultError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let session_key = format!("{}-session-{}", key_system, n);
        self.acquired.lock().unwrap().push(session_key.clone());
        Ok(session_key)
    }

    async fn confirm_persisted(&self, _session_key: &str) -> Result<(), OvaultError> {
        Ok(())
    }

    async fn release(&self, session_key: &str) -> Result<(), OvaultError> {
        self.released
            .lock()
            .unwrap()
            .push(session_key.to_string());
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

const KEY_SYSTEM: &str = "com.widevine.alpha";

fn manifest(locators: &[&str], protection: Option<ProtectionInfo>) -> PresentationManifest {
    PresentationManifest {
        raw: "{\"fixture\":true}".to_string(),
        segments: locators
            .iter()
            .enumerate()
            .map(|(i, locator)| SegmentRef {
                index: i as u32,
                locator: locator.to_string(),
                size_hint: None,
            })
            .collect(),
        protection,
    }
}

fn protection() -> Option<ProtectionInfo> {
    Some(ProtectionInfo {
        key_system: KEY_SYSTEM.to_string(),
        init_data: vec![1, 2, 3],
    })
}

async fn build_engine(
    dir: &tempfile::TempDir,
    manifests: Vec<(&str, PresentationManifest)>,
    fetcher: Arc<FakeFetcher>,
    drm: Arc<FakeDrm>,
) -> OvaultCore {
    let resolver = Arc::new(FakeResolver {
        manifests: manifests
            .into_iter()
            .map(|(source, m)| (source.to_string(), m))
            .collect(),
    });

    OvaultCore::with_fetcher(dir.path().to_path_buf(), resolver, drm, fetcher)
        .await
        .unwrap()
}

/// Cancel once the session shows up in the registry.
async fn cancel_when_active(core: &OvaultCore, source: &str) {
    for _ in 0..100 {
        match core.cancel_store(source).await {
            Ok(()) => return,
            Err(OvaultError::NotFound(_)) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("unexpected cancel error: {}", e),
        }
    }
    panic!("session for {} never became active", source);
}

// ============================================================================
// Store / resolve
// ============================================================================

#[tokio::test]
async fn store_then_resolve_returns_complete_record() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("seg/0.ts", &[0u8; 100])
            .with_payload("seg/1.ts", &[1u8; 200]),
    );
    let drm = Arc::new(FakeDrm::default());
    let core = build_engine(
        &dir,
        vec![("src://show", manifest(&["seg/0.ts", "seg/1.ts"], None))],
        fetcher.clone(),
        drm,
    )
    .await;

    assert!(core.support());

    let record = core.store("src://show").await.unwrap();
    assert_eq!(record.status, RecordStatus::Complete);
    assert_eq!(record.segments.len(), 2);
    assert_eq!(record.size_bytes, 300);
    assert_eq!(record.source, "src://show");
    assert!(record.license_id.is_none());

    let resolved = core.resolve(&record.offline_uri).await.unwrap();
    assert_eq!(resolved.status, RecordStatus::Complete);
    assert_eq!(resolved.segments.len(), 2);

    let all = core.list_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].offline_uri, record.offline_uri);
}

#[tokio::test]
async fn failed_store_leaves_no_partial_record() {
    let dir = tempfile::tempdir().unwrap();
    // second segment has no payload -> 404, not retryable
    let fetcher = Arc::new(FakeFetcher::new().with_payload("seg/0.ts", &[0u8; 64]));
    let drm = Arc::new(FakeDrm::default());
    let core = build_engine(
        &dir,
        vec![("src://show", manifest(&["seg/0.ts", "seg/1.ts"], None))],
        fetcher,
        drm,
    )
    .await;

    let err = core.store("src://show").await.unwrap_err();
    assert!(matches!(err, OvaultError::SegmentFetchFailed { .. }));

    assert!(core.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn unresolvable_manifest_surfaces_untranslated() {
    let dir = tempfile::tempdir().unwrap();
    let core = build_engine(
        &dir,
        vec![],
        Arc::new(FakeFetcher::new()),
        Arc::new(FakeDrm::default()),
    )
    .await;

    let err = core.store("src://missing").await.unwrap_err();
    assert!(matches!(err, OvaultError::ManifestUnresolvable(_)));
}

// ============================================================================
// Retry policy
// ============================================================================

#[tokio::test]
async fn transient_fetch_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("seg/0.ts", &[7u8; 32])
            .with_failures("seg/0.ts", 2),
    );
    let drm = Arc::new(FakeDrm::default());
    let core = build_engine(
        &dir,
        vec![("src://flaky", manifest(&["seg/0.ts"], None))],
        fetcher.clone(),
        drm,
    )
    .await;

    core.configure(ConfigureOptions {
        max_retries: Some(3),
        retry_delay_secs: Some(0),
        ..Default::default()
    })
    .await;

    let record = core.store("src://flaky").await.unwrap();
    assert_eq!(record.status, RecordStatus::Complete);
    assert_eq!(fetcher.fetches(), 3); // two 503s, then success
}

#[tokio::test]
async fn retry_exhaustion_fails_the_session_only() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("seg/0.ts", &[7u8; 32])
            .with_failures("seg/0.ts", 10)
            .with_payload("fine/0.ts", &[1u8; 32]),
    );
    let drm = Arc::new(FakeDrm::default());
    let core = build_engine(
        &dir,
        vec![
            ("src://flaky", manifest(&["seg/0.ts"], None)),
            ("src://fine", manifest(&["fine/0.ts"], None)),
        ],
        fetcher,
        drm,
    )
    .await;

    core.configure(ConfigureOptions {
        max_retries: Some(2),
        retry_delay_secs: Some(0),
        ..Default::default()
    })
    .await;

    let err = core.store("src://flaky").await.unwrap_err();
    match err {
        OvaultError::SegmentFetchFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected SegmentFetchFailed, got {}", other),
    }
    assert!(core.list_all().await.unwrap().is_empty());

    // the engine itself is still usable after a failed session
    let record = core.store("src://fine").await.unwrap();
    assert_eq!(record.status, RecordStatus::Complete);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn concurrent_same_source_stores_yield_one_success() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("seg/0.ts", &[0u8; 16])
            .with_delay("seg/0.ts", Duration::from_millis(300)),
    );
    let drm = Arc::new(FakeDrm::default());
    let core = build_engine(
        &dir,
        vec![("src://dup", manifest(&["seg/0.ts"], None))],
        fetcher,
        drm,
    )
    .await;

    let a = {
        let core = core.clone();
        tokio::spawn(async move { core.store("src://dup").await })
    };
    let b = {
        let core = core.clone();
        tokio::spawn(async move { core.store("src://dup").await })
    };

    let results = vec![a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let already_active = results
        .iter()
        .filter(|r| matches!(r, Err(OvaultError::SessionAlreadyActive(_))))
        .count();

    assert_eq!(successes, 1);
    assert_eq!(already_active, 1);
    assert_eq!(core.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn distinct_sources_store_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("a/0.ts", &[0u8; 16])
            .with_payload("b/0.ts", &[1u8; 16]),
    );
    let drm = Arc::new(FakeDrm::default());
    let core = build_engine(
        &dir,
        vec![
            ("src://a", manifest(&["a/0.ts"], None)),
            ("src://b", manifest(&["b/0.ts"], None)),
        ],
        fetcher,
        drm,
    )
    .await;

    let a = {
        let core = core.clone();
        tokio::spawn(async move { core.store("src://a").await })
    };
    let b = {
        let core = core.clone();
        tokio::spawn(async move { core.store("src://b").await })
    };

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert_eq!(core.list_all().await.unwrap().len(), 2);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancelling_mid_fetch_leaves_registry_unchanged_and_releases_license() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("seg/0.ts", &[0u8; 16])
            .with_delay("seg/0.ts", Duration::from_secs(30)),
    );
    let drm = Arc::new(FakeDrm::with_support(KEY_SYSTEM, false));
    let core = build_engine(
        &dir,
        vec![("src://slow", manifest(&["seg/0.ts"], protection()))],
        fetcher.clone(),
        drm.clone(),
    )
    .await;

    let store_task = {
        let core = core.clone();
        tokio::spawn(async move { core.store("src://slow").await })
    };

    // cancel once the session is provably mid-FetchingSegments
    for _ in 0..200 {
        if fetcher.fetches() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(fetcher.fetches() > 0);
    core.cancel_store("src://slow").await.unwrap();

    let result = store_task.await.unwrap();
    assert!(matches!(result, Err(OvaultError::Cancelled)));

    // no partial record appears, and the temporary license was released
    assert!(core.list_all().await.unwrap().is_empty());
    assert_eq!(drm.acquired().len(), 1);
    assert_eq!(drm.released(), drm.acquired());
}

// ============================================================================
// Licenses
// ============================================================================

#[tokio::test]
async fn persistent_license_without_platform_support_fetches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new().with_payload("seg/0.ts", &[0u8; 16]));
    let drm = Arc::new(FakeDrm::with_support(KEY_SYSTEM, false));
    let core = build_engine(
        &dir,
        vec![("src://a", manifest(&["seg/0.ts"], protection()))],
        fetcher.clone(),
        drm.clone(),
    )
    .await;

    core.configure(ConfigureOptions {
        use_persistent_license: Some(true),
        ..Default::default()
    })
    .await;

    let err = core.store("src://a").await.unwrap_err();
    assert!(matches!(err, OvaultError::LicenseUnsupported(_)));
    assert_eq!(fetcher.fetches(), 0);
    assert!(drm.acquired().is_empty());
}

#[tokio::test]
async fn unknown_key_system_fetches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new().with_payload("seg/0.ts", &[0u8; 16]));
    let drm = Arc::new(FakeDrm::default()); // no key systems at all
    let core = build_engine(
        &dir,
        vec![("src://a", manifest(&["seg/0.ts"], protection()))],
        fetcher.clone(),
        drm,
    )
    .await;

    let err = core.store("src://a").await.unwrap_err();
    assert!(matches!(err, OvaultError::LicenseUnsupported(_)));
    assert_eq!(fetcher.fetches(), 0);
}

#[tokio::test]
async fn temporary_license_is_released_after_commit_and_not_referenced() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new().with_payload("seg/0.ts", &[0u8; 16]));
    let drm = Arc::new(FakeDrm::with_support(KEY_SYSTEM, false));
    let core = build_engine(
        &dir,
        vec![("src://a", manifest(&["seg/0.ts"], protection()))],
        fetcher,
        drm.clone(),
    )
    .await;

    let record = core.store("src://a").await.unwrap();
    assert!(record.license_id.is_none());
    assert_eq!(drm.acquired().len(), 1);
    assert_eq!(drm.released(), drm.acquired());
}

#[tokio::test]
async fn persistent_license_survives_store_and_dies_with_remove() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new().with_payload("seg/0.ts", &[0u8; 16]));
    let drm = Arc::new(FakeDrm::with_support(KEY_SYSTEM, true));
    let core = build_engine(
        &dir,
        vec![("src://a", manifest(&["seg/0.ts"], protection()))],
        fetcher,
        drm.clone(),
    )
    .await;

    core.configure(ConfigureOptions {
        use_persistent_license: Some(true),
        ..Default::default()
    })
    .await;

    let record = core.store("src://a").await.unwrap();
    assert!(record.license_id.is_some());
    assert_eq!(drm.acquired().len(), 1);
    assert!(drm.released().is_empty());

    core.remove(&record.offline_uri).await.unwrap();

    // license released as part of removal, record gone
    assert_eq!(drm.released(), drm.acquired());
    let err = core.resolve(&record.offline_uri).await.unwrap_err();
    assert!(matches!(err, OvaultError::NotFound(_)));
}

#[tokio::test]
async fn unprotected_content_never_touches_drm() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new().with_payload("seg/0.ts", &[0u8; 16]));
    let drm = Arc::new(FakeDrm::with_support(KEY_SYSTEM, true));
    let core = build_engine(
        &dir,
        vec![("src://plain", manifest(&["seg/0.ts"], None))],
        fetcher,
        drm.clone(),
    )
    .await;

    core.store("src://plain").await.unwrap();
    assert!(drm.acquired().is_empty());
}

// ============================================================================
// Remove / delete-all
// ============================================================================

#[tokio::test]
async fn remove_twice_yields_success_then_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new().with_payload("seg/0.ts", &[0u8; 16]));
    let core = build_engine(
        &dir,
        vec![("src://a", manifest(&["seg/0.ts"], None))],
        fetcher,
        Arc::new(FakeDrm::default()),
    )
    .await;

    let record = core.store("src://a").await.unwrap();

    core.remove(&record.offline_uri).await.unwrap();
    let err = core.remove(&record.offline_uri).await.unwrap_err();
    assert!(matches!(err, OvaultError::NotFound(_)));
}

#[tokio::test]
async fn remove_is_rejected_while_a_session_is_uncommitted() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("fast/0.ts", &[0u8; 16])
            .with_payload("slow/0.ts", &[0u8; 16])
            .with_delay("slow/0.ts", Duration::from_secs(30)),
    );
    let drm = Arc::new(FakeDrm::default());
    let core = build_engine(
        &dir,
        vec![("src://a", manifest(&["fast/0.ts"], None))],
        fetcher,
        drm,
    )
    .await;

    let record = core.store("src://a").await.unwrap();

    // second store for the same source, now slow and uncommitted
    let slow_fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("slow/0.ts", &[0u8; 16])
            .with_delay("slow/0.ts", Duration::from_secs(30)),
    );
    let slow_core = build_engine(
        &dir,
        vec![("src://a", manifest(&["slow/0.ts"], None))],
        slow_fetcher.clone(),
        Arc::new(FakeDrm::default()),
    )
    .await;
    let store_task = {
        let core = slow_core.clone();
        tokio::spawn(async move { core.store("src://a").await })
    };

    // wait until the slow session is provably mid-fetch
    for _ in 0..200 {
        if slow_fetcher.fetches() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(slow_fetcher.fetches() > 0);

    let err = slow_core.remove(&record.offline_uri).await.unwrap_err();
    match err {
        OvaultError::ContentBusy(uri) => assert_eq!(uri, record.offline_uri),
        other => panic!("expected ContentBusy, got {}", other),
    }

    cancel_when_active(&slow_core, "src://a").await;
    let _ = store_task.await.unwrap();

    // once the session is gone, removal proceeds
    slow_core.remove(&record.offline_uri).await.unwrap();
}

#[tokio::test]
async fn delete_all_continues_past_failures_and_reports_them() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        FakeFetcher::new()
            .with_payload("a/0.ts", &[0u8; 16])
            .with_payload("b/0.ts", &[1u8; 16])
            .with_payload("c/0.ts", &[2u8; 16]),
    );
    let core = build_engine(
        &dir,
        vec![
            ("src://a", manifest(&["a/0.ts"], None)),
            ("src://b", manifest(&["b/0.ts"], None)),
            ("src://c", manifest(&["c/0.ts"], None)),
        ],
        fetcher,
        Arc::new(FakeDrm::default()),
    )
    .await;

    let a = core.store("src://a").await.unwrap();
    let b = core.store("src://b").await.unwrap();
    let c = core.store("src://c").await.unwrap();

    // sabotage b's blob directory: replace it with a plain file so blob
    // deletion fails
    let b_blobs = dir
        .path()
        .join("blobs")
        .join(b.record_id().unwrap().to_string());
    tokio::fs::remove_dir_all(&b_blobs).await.unwrap();
    tokio::fs::write(&b_blobs, b"not a directory").await.unwrap();

    let report = core.delete_all().await.unwrap();
    assert_eq!(report.removed.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].offline_uri, b.offline_uri);
    assert!(!report.is_clean());

    // the two successes are gone; the failure remains, recorded as corrupt
    let remaining = core.list_all().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].offline_uri, b.offline_uri);
    assert_eq!(remaining[0].status, RecordStatus::Corrupt);

    assert!(core.resolve(&a.offline_uri).await.is_err());
    assert!(core.resolve(&c.offline_uri).await.is_err());
}

#[tokio::test]
async fn partial_removal_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new().with_payload("a/0.ts", &[0u8; 16]));
    let core = build_engine(
        &dir,
        vec![("src://a", manifest(&["a/0.ts"], None))],
        fetcher,
        Arc::new(FakeDrm::default()),
    )
    .await;

    let record = core.store("src://a").await.unwrap();

    let blobs = dir
        .path()
        .join("blobs")
        .join(record.record_id().unwrap().to_string());
    tokio::fs::remove_dir_all(&blobs).await.unwrap();
    tokio::fs::write(&blobs, b"in the way").await.unwrap();

    let err = core.remove(&record.offline_uri).await.unwrap_err();
    assert!(matches!(err, OvaultError::PartialRemoval { .. }));

    // clear the obstruction and retry; removal completes
    tokio::fs::remove_file(&blobs).await.unwrap();
    core.remove(&record.offline_uri).await.unwrap();
    assert!(core.list_all().await.unwrap().is_empty());
}

// ============================================================================
// Backend availability
// ============================================================================

#[tokio::test]
async fn missing_backend_reports_unsupported_instead_of_erroring() {
    let dir = tempfile::tempdir().unwrap();
    // a plain file where the data dir should be makes the backend unusable
    let blocked = dir.path().join("data");
    tokio::fs::write(&blocked, b"occupied").await.unwrap();

    let resolver = Arc::new(FakeResolver {
        manifests: HashMap::new(),
    });
    let core = OvaultCore::with_fetcher(
        blocked,
        resolver,
        Arc::new(FakeDrm::default()),
        Arc::new(FakeFetcher::new()),
    )
    .await
    .unwrap();

    assert!(!core.support());
    assert!(matches!(
        core.store("src://a").await.unwrap_err(),
        OvaultError::StorageUnavailable
    ));
    assert!(matches!(
        core.list_all().await.unwrap_err(),
        OvaultError::StorageUnavailable
    ));
}
