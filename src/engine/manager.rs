// Bundle manager: wires catalog, cache, fetcher, resolver and lifecycle
// together behind the consumer-facing API.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::cache::{BundleCache, BundleState, LoadedBundle, RecordSnapshot};
use super::fetcher::Fetcher;
use super::lifecycle::{ConsumerHandle, ConsumerId, LifecycleManager};
use super::progress::{ProgressAggregator, ProgressHandle};
use super::resolver::DependencyResolver;
use super::stats::{StatsCollector, StatsSnapshot};
use super::warmup;
use crate::catalog::service::CatalogService;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{BundleError, BundleResult};
use crate::source::decoder::{BundleDecoder, RawDecoder};
use crate::source::http_source::HttpSource;
use crate::source::local_store::LocalStore;
use crate::source::traits::BundleSource;

pub struct BundleManager {
    config: Arc<EngineConfig>,
    catalogs: CatalogService,
    cache: Arc<BundleCache>,
    fetcher: Arc<Fetcher>,
    resolver: DependencyResolver,
    lifecycle: LifecycleManager,
    progress: ProgressAggregator,
    stats: Arc<StatsCollector>,
    shutdown_token: CancellationToken,
}

impl BundleManager {
    /// Manager fetching over HTTP from the configured content-delivery URL.
    pub fn from_config(config: EngineConfig) -> BundleResult<Self> {
        let source = HttpSource::new(config.clone())
            .map_err(|e| BundleError::InvalidConfig(format!("http client: {}", e)))?;
        Self::new(config, Arc::new(source))
    }

    pub fn new(config: EngineConfig, source: Arc<dyn BundleSource>) -> BundleResult<Self> {
        Self::with_decoder(config, source, Arc::new(RawDecoder))
    }

    pub fn with_decoder(
        config: EngineConfig,
        source: Arc<dyn BundleSource>,
        decoder: Arc<dyn BundleDecoder>,
    ) -> BundleResult<Self> {
        config.validate()?;
        let target = config.target_for(&config.platform)?.clone();
        let config = Arc::new(config);
        let shutdown_token = CancellationToken::new();

        let authoring = if config.use_local_authoring_source_if_available {
            config.authoring_dir.as_ref().map(LocalStore::new)
        } else {
            None
        };
        let catalogs = CatalogService::new(
            Arc::clone(&config),
            Arc::clone(&source),
            authoring,
            shutdown_token.clone(),
        );

        let cache = Arc::new(BundleCache::new());
        let stats = Arc::new(StatsCollector::new());
        let fetcher = Arc::new(Fetcher::new(
            &config,
            target.clone(),
            source,
            decoder,
            Arc::clone(&cache),
            Arc::clone(&stats),
            shutdown_token.clone(),
        ));
        let resolver = DependencyResolver::new(Arc::clone(&cache), Arc::clone(&fetcher));
        let lifecycle = LifecycleManager::new(Arc::clone(&cache));

        info!(
            "bundle manager created platform={} target={} environment={} version={} max_downloads={}",
            config.platform,
            target.name,
            config.environment,
            config.version,
            config.max_concurrent_downloads
        );

        Ok(Self {
            config,
            catalogs,
            cache,
            fetcher,
            resolver,
            lifecycle,
            progress: ProgressAggregator::new(),
            stats,
            shutdown_token,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load the catalog for the configured platform. Errors here are
    /// deployment defects and should stop startup.
    pub async fn init(&self) -> BundleResult<Arc<Catalog>> {
        self.catalog().await
    }

    pub async fn catalog(&self) -> BundleResult<Arc<Catalog>> {
        self.catalogs.fetch(&self.config.platform).await
    }

    /// Catalog for any configured platform; never mixed with the active one.
    pub async fn catalog_for(&self, platform: &str) -> BundleResult<Arc<Catalog>> {
        self.catalogs.fetch(platform).await
    }

    /// Make `name` and its dependencies resident, reporting into the shared
    /// progress aggregate.
    pub async fn ensure_ready(&self, name: &str) -> BundleResult<Arc<LoadedBundle>> {
        self.ensure_ready_with_progress(name, self.progress.begin(1.0))
            .await
    }

    pub async fn ensure_ready_with_progress(
        &self,
        name: &str,
        progress: ProgressHandle,
    ) -> BundleResult<Arc<LoadedBundle>> {
        let catalog = self.catalog().await?;
        self.resolver.ensure_ready(&catalog, name, progress).await
    }

    /// Cache lookup only; never touches the network.
    pub fn try_get_loaded(&self, name: &str) -> Option<Arc<LoadedBundle>> {
        self.cache.try_get_loaded(name)
    }

    pub async fn register(
        &self,
        consumer: impl Into<ConsumerId>,
        name: &str,
    ) -> BundleResult<ConsumerHandle> {
        let catalog = self.catalog().await?;
        self.lifecycle.register(&catalog, consumer, name)
    }

    pub fn unregister(&self, handle: &ConsumerHandle) -> Vec<String> {
        self.lifecycle.unregister(handle)
    }

    pub fn unregister_consumer(&self, consumer: &ConsumerId) -> Vec<String> {
        self.lifecycle.unregister_consumer(consumer)
    }

    /// Register `consumer` on `name` and load it. A failed load rolls the
    /// registration back.
    pub async fn acquire(
        &self,
        consumer: impl Into<ConsumerId>,
        name: &str,
    ) -> BundleResult<(ConsumerHandle, Arc<LoadedBundle>)> {
        let handle = self.register(consumer, name).await?;
        match self.ensure_ready(name).await {
            Ok(bundle) => Ok((handle, bundle)),
            Err(e) => {
                if !e.is_shutdown() {
                    self.lifecycle.unregister(&handle);
                }
                Err(e)
            }
        }
    }

    /// Load `names` in the background; see [`warmup::preload`].
    pub fn preload(
        self: &Arc<Self>,
        names: Vec<String>,
    ) -> JoinHandle<Vec<(String, BundleResult<()>)>> {
        warmup::preload(self, names)
    }

    pub fn active_handles(&self) -> Vec<ConsumerHandle> {
        self.lifecycle.active_handles()
    }

    pub fn flush(&self, name: &str, force: bool) -> BundleResult<bool> {
        self.cache.flush(name, force)
    }

    /// Hard reset: drop every payload regardless of consumers.
    pub fn clear_cache(&self) -> usize {
        let freed = self.cache.flush_all(true);
        info!("cache cleared, {} payloads freed", freed);
        freed
    }

    pub fn state(&self, name: &str) -> BundleState {
        self.cache.state(name)
    }

    pub fn record(&self, name: &str) -> Option<RecordSnapshot> {
        self.cache.snapshot(name)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.lifecycle.consumer_count(name)
    }

    pub fn loaded_bundles(&self) -> Vec<String> {
        self.cache.loaded_names()
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn available_download_slots(&self) -> usize {
        self.fetcher.available_slots()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown_token.is_cancelled()
    }

    /// Abort every wait and in-flight transfer; later calls fail with
    /// `AbortedByShutdown`.
    pub fn shutdown(&self) {
        if !self.shutdown_token.is_cancelled() {
            info!("bundle manager shutting down");
        }
        self.shutdown_token.cancel();
    }
}

impl Drop for BundleManager {
    fn drop(&mut self) {
        debug!("BundleManager dropped, cancelling outstanding work");
        self.shutdown_token.cancel();
    }
}
