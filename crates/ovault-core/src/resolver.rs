//! Default manifest resolver over HTTP
//!
//! Resolves a source URL into a small JSON manifest document listing segment
//! locators and an optional protection block:
//!
//! ```json
//! {
//!   "segments": ["seg/0.ts", {"locator": "seg/1.ts", "size": 4096}],
//!   "protection": {"key_system": "com.widevine.alpha", "init_data": [1, 2]}
//! }
//! ```
//!
//! Relative locators are resolved against the manifest URL. Anything that
//! goes wrong here surfaces as [`OvaultError::ManifestUnresolvable`].

use crate::error::OvaultError;
use crate::traits::ManifestResolver;
use async_trait::async_trait;
use ovault_types::{PresentationManifest, ProtectionInfo, SegmentRef};
use reqwest::Client;
use serde::Deserialize;
use tracing::info;
use url::Url;

#[derive(Deserialize)]
struct ManifestDoc {
    segments: Vec<SegmentDoc>,
    #[serde(default)]
    protection: Option<ProtectionDoc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SegmentDoc {
    Plain(String),
    Detailed {
        locator: String,
        #[serde(default)]
        size: Option<u64>,
    },
}

#[derive(Deserialize)]
struct ProtectionDoc {
    key_system: String,
    #[serde(default)]
    init_data: Vec<u8>,
}

/// Resolves JSON manifests over the shared HTTP client
pub struct HttpManifestResolver {
    client: Client,
}

impl HttpManifestResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestResolver for HttpManifestResolver {
    async fn resolve(&self, source: &str) -> Result<PresentationManifest, OvaultError> {
        let base = Url::parse(source)
            .map_err(|e| OvaultError::ManifestUnresolvable(format!("{}: {}", source, e)))?;

        info!("Resolving manifest: {}", base);

        let response = self
            .client
            .get(base.clone())
            .send()
            .await
            .map_err(|e| OvaultError::ManifestUnresolvable(format!("{}: {}", source, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OvaultError::ManifestUnresolvable(format!(
                "{}: HTTP {}",
                source, status
            )));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| OvaultError::ManifestUnresolvable(format!("{}: {}", source, e)))?;

        let doc: ManifestDoc = serde_json::from_str(&raw)
            .map_err(|e| OvaultError::ManifestUnresolvable(format!("{}: {}", source, e)))?;

        let mut segments = Vec::with_capacity(doc.segments.len());
        for (index, seg) in doc.segments.into_iter().enumerate() {
            let (locator, size_hint) = match seg {
                SegmentDoc::Plain(locator) => (locator, None),
                SegmentDoc::Detailed { locator, size } => (locator, size),
            };
            let absolute = base.join(&locator).map_err(|e| {
                OvaultError::ManifestUnresolvable(format!("{}: bad locator {}: {}", source, locator, e))
            })?;
            segments.push(SegmentRef {
                index: index as u32,
                locator: absolute.to_string(),
                size_hint,
            });
        }

        Ok(PresentationManifest {
            raw,
            segments,
            protection: doc.protection.map(|p| ProtectionInfo {
                key_system: p.key_system,
                init_data: p.init_data,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_doc_accepts_both_segment_forms() {
        let doc: ManifestDoc = serde_json::from_str(
            r#"{
                "segments": ["a.ts", {"locator": "b.ts", "size": 4096}],
                "protection": {"key_system": "com.widevine.alpha"}
            }"#,
        )
        .unwrap();

        assert_eq!(doc.segments.len(), 2);
        let protection = doc.protection.unwrap();
        assert_eq!(protection.key_system, "com.widevine.alpha");
        assert!(protection.init_data.is_empty());
    }
}
