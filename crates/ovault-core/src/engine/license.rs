//! License manager - requests, confirms, and releases DRM licenses
//!
//! Persistent-license acquisition blocks until the platform confirms durable
//! storage of the session. Temporary licenses are scoped to the download
//! session that created them; segments are stored still encrypted, so a
//! license is only needed again at playback time if persistent.

use crate::error::OvaultError;
use crate::traits::DrmClient;
use ovault_types::{LicenseRecord, ProtectionInfo};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Broker between the engine and the platform DRM client
#[derive(Clone)]
pub struct LicenseManager {
    drm: Arc<dyn DrmClient>,
}

impl LicenseManager {
    pub fn new(drm: Arc<dyn DrmClient>) -> Self {
        Self { drm }
    }

    /// Check the capability oracle before any bytes move.
    ///
    /// A missing key system, or a missing persistent-state capability when a
    /// persistent license is requested, short-circuits the whole store
    /// operation so a partial download that could never play back is never
    /// started.
    pub async fn ensure_supported(
        &self,
        protection: &ProtectionInfo,
        persistent: bool,
    ) -> Result<(), OvaultError> {
        let support = self.drm.probe_support().await;
        match support.get(&protection.key_system) {
            None => Err(OvaultError::LicenseUnsupported(
                protection.key_system.clone(),
            )),
            Some(caps) if persistent && !caps.persistent_state => {
                Err(OvaultError::LicenseUnsupported(format!(
                    "{} (persistent state unavailable)",
                    protection.key_system
                )))
            }
            Some(_) => Ok(()),
        }
    }

    /// Open a license session for the given protection info
    pub async fn acquire(
        &self,
        protection: &ProtectionInfo,
        persistent: bool,
    ) -> Result<LicenseRecord, OvaultError> {
        let session_key = self
            .drm
            .acquire(&protection.key_system, &protection.init_data, persistent)
            .await
            .map_err(|e| match e {
                e @ (OvaultError::LicenseUnsupported(_) | OvaultError::Cancelled) => e,
                other => OvaultError::LicenseAcquisitionFailed(other.to_string()),
            })?;

        if persistent {
            // The platform must confirm durable storage before the session
            // counts as acquired.
            if let Err(e) = self.drm.confirm_persisted(&session_key).await {
                let _ = self.drm.release(&session_key).await;
                return Err(OvaultError::LicenseAcquisitionFailed(e.to_string()));
            }
        }

        info!(
            "Acquired {} license for {}",
            if persistent { "persistent" } else { "temporary" },
            protection.key_system
        );

        Ok(LicenseRecord {
            id: Uuid::new_v4(),
            key_system: protection.key_system.clone(),
            session_key,
            persistent,
            expires_at: None,
        })
    }

    /// Release a license session
    pub async fn release(&self, record: &LicenseRecord) -> Result<(), OvaultError> {
        self.drm.release(&record.session_key).await
    }
}
