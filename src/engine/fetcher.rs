// Concurrency-limited bundle fetcher: authoring source, network with
// conditional transfer, and packaged fallback, behind one global semaphore.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{BundleCache, BundleOrigin, BundleState, Claim, DownloadClaim, LoadedBundle};
use super::progress::ProgressHandle;
use super::stats::StatsCollector;
use crate::catalog::{Catalog, CatalogEntry, ContentHash};
use crate::config::{
    EngineConfig, PlatformTarget, PROGRESS_DECODE_END, PROGRESS_TRANSFER_END, RETRY_BACKOFF_MS,
};
use crate::error::{BundleError, BundleResult};
use crate::source::decoder::BundleDecoder;
use crate::source::local_store::LocalStore;
use crate::source::traits::{BundleRequest, BundleSource, FetchResponse, SourceError};

/// Result of the network tier for one bundle.
enum Remote {
    Fetched(Bytes, BundleOrigin),
    /// Status of the last failed attempt (0 for connectivity errors).
    Failed(u16),
}

enum Decoded {
    Payload(Bytes),
    Rejected(String),
}

/// Why the network tier produced nothing usable.
enum Failure {
    Transfer(u16),
    Decode(String),
}

pub struct Fetcher {
    target: PlatformTarget,
    source: Arc<dyn BundleSource>,
    decoder: Arc<dyn BundleDecoder>,
    cache: Arc<BundleCache>,
    stats: Arc<StatsCollector>,
    semaphore: Arc<Semaphore>,
    shutdown_token: CancellationToken,
    max_retries: u32,
    authoring: Option<LocalStore>,
    local_copies: Option<LocalStore>,
    keep_local_copy: bool,
    fallback: Option<LocalStore>,
}

impl Fetcher {
    pub fn new(
        config: &EngineConfig,
        target: PlatformTarget,
        source: Arc<dyn BundleSource>,
        decoder: Arc<dyn BundleDecoder>,
        cache: Arc<BundleCache>,
        stats: Arc<StatsCollector>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let authoring = if config.use_local_authoring_source_if_available {
            config.authoring_dir.as_ref().map(LocalStore::new)
        } else {
            None
        };
        Self {
            target,
            source,
            decoder,
            cache,
            stats,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1) as usize)),
            shutdown_token,
            max_retries: config.max_retries,
            authoring,
            local_copies: config.local_copy_dir.as_ref().map(LocalStore::new),
            keep_local_copy: config.keep_local_fallback_copy,
            fallback: config.fallback_dir.as_ref().map(LocalStore::new),
        }
    }

    /// Download slots not currently held.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown_token.is_cancelled()
    }

    fn ensure_running(&self) -> BundleResult<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(BundleError::AbortedByShutdown);
        }
        Ok(())
    }

    /// Load one bundle. Callers are expected to have loaded its dependencies
    /// already; concurrent calls for the same name share one download.
    pub async fn fetch(
        &self,
        catalog: &Catalog,
        name: &str,
        progress: &ProgressHandle,
    ) -> BundleResult<Arc<LoadedBundle>> {
        let entry = catalog
            .entry(name)
            .ok_or_else(|| BundleError::UnknownBundle(name.to_string()))?;

        loop {
            self.ensure_running()?;

            let notify = match self.cache.claim_download(name, &entry.dependencies) {
                Claim::Loaded(bundle) => {
                    self.stats.record_cache_hit();
                    progress.finish();
                    return Ok(bundle);
                }
                Claim::Claimed(claim) => return self.download(entry, claim, progress).await,
                Claim::InFlight(notify) => notify,
            };

            // Register interest before re-checking so a completion between
            // the check and the await is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cache.state(name) != BundleState::Downloading {
                continue;
            }

            debug!("bundle {} already downloading, waiting", name);
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown_token.cancelled() => {
                    debug!("bundle {} wait cancelled by shutdown", name);
                    return Err(BundleError::AbortedByShutdown);
                }
            }
        }
    }

    async fn download(
        &self,
        entry: &CatalogEntry,
        claim: DownloadClaim<'_>,
        progress: &ProgressHandle,
    ) -> BundleResult<Arc<LoadedBundle>> {
        let name = entry.name.as_str();

        if let Some(raw) = self.read_authoring(name).await? {
            progress.report(PROGRESS_TRANSFER_END);
            if let Decoded::Payload(payload) = self.decode(name, raw).await? {
                self.stats.record_authoring_load();
                debug!("bundle {} loaded from authoring source", name);
                return Ok(self.store(entry, claim, payload, BundleOrigin::AuthoringSource, progress));
            }
        }

        // Held until this function returns, on every path.
        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => {
                permit.map_err(|_| BundleError::AbortedByShutdown)?
            }
            _ = self.shutdown_token.cancelled() => {
                debug!("bundle {} cancelled while waiting for a download slot", name);
                return Err(BundleError::AbortedByShutdown);
            }
        };
        debug!("bundle {} acquired download slot", name);

        let remote = self.load_remote(entry, &claim, progress).await?;
        let failure = match remote {
            Remote::Fetched(raw, origin) => match self.decode(name, raw.clone()).await? {
                Decoded::Payload(payload) => {
                    if origin == BundleOrigin::Network {
                        self.keep_copy(entry, &raw).await;
                    }
                    return Ok(self.store(entry, claim, payload, origin, progress));
                }
                Decoded::Rejected(reason) => Failure::Decode(reason),
            },
            Remote::Failed(status) => Failure::Transfer(status),
        };

        if let Some(raw) = self.read_fallback(name).await? {
            if let Decoded::Payload(payload) = self.decode(name, raw).await? {
                self.stats.record_fallback();
                match &failure {
                    Failure::Transfer(status) => info!(
                        "bundle {} loaded from packaged fallback after status {}",
                        name, status
                    ),
                    Failure::Decode(_) => info!(
                        "bundle {} loaded from packaged fallback after decode failure",
                        name
                    ),
                }
                return Ok(self.store(entry, claim, payload, BundleOrigin::LocalFallback, progress));
            }
        }

        self.stats.record_failure();
        match failure {
            Failure::Transfer(status) => {
                warn!("bundle {} retrieval failed status={}", name, status);
                claim.fail(status);
                Err(BundleError::RetrievalFailed {
                    name: name.to_string(),
                    status,
                })
            }
            Failure::Decode(reason) => {
                warn!("bundle {} could not be decoded: {}", name, reason);
                // The transfer itself succeeded; keep its status on the record.
                drop(claim);
                Err(BundleError::DecodeFailed {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }

    async fn load_remote(
        &self,
        entry: &CatalogEntry,
        claim: &DownloadClaim<'_>,
        progress: &ProgressHandle,
    ) -> BundleResult<Remote> {
        let name = entry.name.as_str();
        let mut request = BundleRequest {
            target: &self.target,
            name,
            hash: entry.hash,
            if_none_match: self.conditional_hash(entry).await,
        };
        let on_bytes = |received: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                let fraction = (received as f32 / total as f32).min(1.0);
                progress.report(PROGRESS_TRANSFER_END * fraction);
            }
        };

        let mut last_status = 0;
        let mut attempt = 0;
        loop {
            self.ensure_running()?;

            let result = {
                let _transfer = self.stats.begin_transfer();
                tokio::select! {
                    result = self.source.fetch_bundle(&request, &on_bytes) => result,
                    _ = self.shutdown_token.cancelled() => {
                        debug!("bundle {} transfer cancelled by shutdown", name);
                        return Err(BundleError::AbortedByShutdown);
                    }
                }
            };

            let error = match result {
                Ok(FetchResponse::Content(raw)) => {
                    claim.record_status(200);
                    self.stats.record_downloaded(raw.len() as u64);
                    progress.report(PROGRESS_TRANSFER_END);
                    debug!("bundle {} downloaded ({} bytes)", name, raw.len());
                    return Ok(Remote::Fetched(raw, BundleOrigin::Network));
                }
                Ok(FetchResponse::NotModified) => {
                    claim.record_status(304);
                    last_status = 304;
                    if let Some(raw) = self.read_copy(request.if_none_match, name).await {
                        self.stats.record_not_modified();
                        progress.report(PROGRESS_TRANSFER_END);
                        debug!("bundle {} not modified, using local copy", name);
                        return Ok(Remote::Fetched(raw, BundleOrigin::NotModified));
                    }
                    if request.if_none_match.take().is_some() {
                        // Not a transport failure: ask again for the full body
                        // without spending a retry.
                        warn!(
                            "bundle {} answered not-modified without a usable local copy, re-requesting",
                            name
                        );
                        continue;
                    }
                    // A 304 to an unconditional request is a protocol error.
                    SourceError::Status(304)
                }
                Err(e) => {
                    last_status = e.status_code();
                    claim.record_status(last_status);
                    e
                }
            };

            if !error.is_retryable() || attempt >= self.max_retries {
                warn!(
                    "bundle {} fetch failed after {} attempt(s): {}",
                    name,
                    attempt + 1,
                    error
                );
                break;
            }
            warn!("bundle {} fetch failed (attempt {}): {}", name, attempt, error);
            attempt += 1;
            let backoff = Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown_token.cancelled() => {
                    return Err(BundleError::AbortedByShutdown);
                }
            }
        }

        Ok(Remote::Failed(last_status))
    }

    /// Catalog hash to send as a conditional transfer, when the persistent
    /// copy for exactly that hash is on disk.
    async fn conditional_hash(&self, entry: &CatalogEntry) -> Option<ContentHash> {
        let store = self.local_copies.as_ref()?;
        if store.has_copy(entry.hash, &entry.name).await {
            Some(entry.hash)
        } else {
            None
        }
    }

    async fn decode(&self, name: &str, raw: Bytes) -> BundleResult<Decoded> {
        self.ensure_running()?;

        let decoder = Arc::clone(&self.decoder);
        let owned_name = name.to_string();
        let task = tokio::task::spawn_blocking(move || decoder.decode(&owned_name, raw));

        let joined = tokio::select! {
            joined = task => joined,
            _ = self.shutdown_token.cancelled() => {
                debug!("bundle {} decode abandoned by shutdown", name);
                return Err(BundleError::AbortedByShutdown);
            }
        };

        match joined {
            Ok(Ok(payload)) => Ok(Decoded::Payload(payload)),
            Ok(Err(e)) => {
                warn!("bundle {} decode failed: {:#}", name, e);
                Ok(Decoded::Rejected(format!("{:#}", e)))
            }
            Err(e) => {
                warn!("bundle {} decode task failed: {}", name, e);
                Ok(Decoded::Rejected(e.to_string()))
            }
        }
    }

    fn store(
        &self,
        entry: &CatalogEntry,
        claim: DownloadClaim<'_>,
        payload: Bytes,
        origin: BundleOrigin,
        progress: &ProgressHandle,
    ) -> Arc<LoadedBundle> {
        progress.report(PROGRESS_DECODE_END);
        let bundle = claim.complete(LoadedBundle {
            name: entry.name.clone(),
            hash: entry.hash,
            payload,
            origin,
        });
        progress.finish();
        bundle
    }

    async fn read_authoring(&self, name: &str) -> BundleResult<Option<Bytes>> {
        let Some(store) = &self.authoring else {
            return Ok(None);
        };
        self.ensure_running()?;
        match store.read_bundle(name).await {
            Ok(found) => Ok(found),
            Err(e) => {
                warn!("authoring source read failed for {}: {:#}", name, e);
                Ok(None)
            }
        }
    }

    async fn read_fallback(&self, name: &str) -> BundleResult<Option<Bytes>> {
        let Some(store) = &self.fallback else {
            return Ok(None);
        };
        self.ensure_running()?;
        match store.read_bundle(name).await {
            Ok(found) => Ok(found),
            Err(e) => {
                warn!("packaged fallback read failed for {}: {:#}", name, e);
                Ok(None)
            }
        }
    }

    async fn read_copy(&self, hash: Option<ContentHash>, name: &str) -> Option<Bytes> {
        let (store, hash) = (self.local_copies.as_ref()?, hash?);
        match store.read_copy(hash, name).await {
            Ok(found) => found,
            Err(e) => {
                warn!("local copy read failed for {}: {:#}", name, e);
                None
            }
        }
    }

    async fn keep_copy(&self, entry: &CatalogEntry, raw: &[u8]) {
        if !self.keep_local_copy {
            return;
        }
        let Some(store) = &self.local_copies else {
            return;
        };
        if let Err(e) = store.write_copy(entry.hash, &entry.name, raw).await {
            warn!("keeping local copy of {} failed: {:#}", entry.name, e);
        }
    }
}
