use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::IF_NONE_MATCH;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use super::traits::{BundleRequest, BundleSource, ByteProgress, FetchResponse, SourceError};
use crate::config::{EngineConfig, PlatformTarget};

/// Content-delivery client: one GET per manifest or bundle.
pub struct HttpSource {
    client: Client,
    config: EngineConfig,
}

impl HttpSource {
    pub fn new(config: EngineConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: EngineConfig) -> Self {
        Self { client, config }
    }

    fn entry_url(&self, target: &PlatformTarget, path: &str) -> Result<Url, SourceError> {
        self.config
            .entry_url(target, path)
            .map_err(|e| SourceError::Connection(e.to_string()))
    }

    async fn get(
        &self,
        url: Url,
        if_none_match: Option<String>,
        on_bytes: ByteProgress<'_>,
    ) -> Result<FetchResponse, SourceError> {
        let mut req = self.client.get(url.clone());
        if let Some(tag) = if_none_match {
            req = req.header(IF_NONE_MATCH, tag);
        }

        let mut resp = req
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let status = resp.status();
        debug!("http get status={} url={}", status.as_u16(), url);
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse::NotModified);
        }
        if !status.is_success() {
            warn!("http get failed status={} url={}", status.as_u16(), url);
            return Err(SourceError::Status(status.as_u16()));
        }

        let limit = self.config.max_bundle_bytes;
        let total = resp.content_length();
        if let Some(size) = total.filter(|size| *size > limit) {
            warn!("http get rejected: declared {} bytes > limit {} url={}", size, limit, url);
            return Err(SourceError::TooLarge { size, limit });
        }

        let mut body = BytesMut::with_capacity(total.unwrap_or(0).min(limit) as usize);
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?
        {
            let size = (body.len() + chunk.len()) as u64;
            if size > limit {
                warn!("http get rejected: body passed limit {} url={}", limit, url);
                return Err(SourceError::TooLarge { size, limit });
            }
            body.extend_from_slice(&chunk);
            on_bytes(body.len() as u64, total);
        }

        Ok(FetchResponse::Content(body.freeze()))
    }
}

#[async_trait]
impl BundleSource for HttpSource {
    async fn fetch_manifest(&self, target: &PlatformTarget) -> Result<Bytes, SourceError> {
        let url = self.entry_url(target, &target.manifest_file_name())?;
        match self.get(url, None, &|_, _| {}).await? {
            FetchResponse::Content(bytes) => Ok(bytes),
            // Never sent a conditional header, so a 304 is a protocol error.
            FetchResponse::NotModified => Err(SourceError::Status(304)),
        }
    }

    async fn fetch_bundle(
        &self,
        request: &BundleRequest<'_>,
        on_bytes: ByteProgress<'_>,
    ) -> Result<FetchResponse, SourceError> {
        let url = self.entry_url(request.target, request.name)?;
        let tag = request.if_none_match.map(|hash| format!("\"{}\"", hash));
        self.get(url, tag, on_bytes).await
    }
}
