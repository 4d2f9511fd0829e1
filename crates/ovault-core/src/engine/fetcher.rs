//! HTTP segment fetcher
//!
//! One GET per segment locator. The fetcher never retries; the session
//! coordinator owns retry policy.

use crate::error::OvaultError;
use crate::traits::SegmentFetch;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tracing::debug;

/// Fetches segment bytes over HTTP using a shared client
pub struct HttpSegmentFetcher {
    client: Client,
}

impl HttpSegmentFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SegmentFetch for HttpSegmentFetcher {
    async fn fetch(&self, locator: &str) -> Result<Bytes, OvaultError> {
        let url = url::Url::parse(locator)
            .map_err(|_| OvaultError::InvalidUrl(locator.to_string()))?;

        debug!("Fetching segment: {}", url);

        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OvaultError::ServerError {
                status: status.as_u16(),
                locator: locator.to_string(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }

        Ok(buf.freeze())
    }
}
