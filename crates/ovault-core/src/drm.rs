//! Default DRM client for platforms without content protection
//!
//! Reports no supported key systems, so any protected store fails fast with
//! `LicenseUnsupported` before fetching bytes. Unprotected content is
//! unaffected.

use crate::error::OvaultError;
use crate::traits::DrmClient;
use async_trait::async_trait;
use ovault_types::KeySystemSupport;
use std::collections::HashMap;

/// A DRM client that supports nothing
#[derive(Debug, Default)]
pub struct NoopDrmClient;

#[async_trait]
impl DrmClient for NoopDrmClient {
    async fn probe_support(&self) -> HashMap<String, KeySystemSupport> {
        HashMap::new()
    }

    async fn acquire(
        &self,
        key_system: &str,
        _init_data: &[u8],
        _persistent: bool,
    ) -> Result<String, OvaultError> {
        Err(OvaultError::LicenseUnsupported(key_system.to_string()))
    }

    async fn confirm_persisted(&self, _session_key: &str) -> Result<(), OvaultError> {
        Ok(())
    }

    async fn release(&self, _session_key: &str) -> Result<(), OvaultError> {
        Ok(())
    }
}
