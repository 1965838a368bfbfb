// Catalog loading: one shared in-flight fetch per platform.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manifest::parse_manifest;
use super::Catalog;
use crate::config::{EngineConfig, PlatformTarget};
use crate::error::{BundleError, BundleResult};
use crate::source::local_store::LocalStore;
use crate::source::traits::BundleSource;

pub struct CatalogService {
    config: Arc<EngineConfig>,
    source: Arc<dyn BundleSource>,
    authoring: Option<LocalStore>,
    shutdown: CancellationToken,
    catalogs: Mutex<HashMap<String, Arc<OnceCell<Arc<Catalog>>>>>,
}

impl CatalogService {
    pub fn new(
        config: Arc<EngineConfig>,
        source: Arc<dyn BundleSource>,
        authoring: Option<LocalStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            authoring,
            shutdown,
            catalogs: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (once) the catalog for `platform`. Concurrent callers share the
    /// same in-flight fetch; a failed fetch can be retried by a later call.
    pub async fn fetch(&self, platform: &str) -> BundleResult<Arc<Catalog>> {
        let target = self.config.target_for(platform)?.clone();

        let cell = {
            let mut catalogs = self.catalogs.lock();
            Arc::clone(catalogs.entry(platform.to_string()).or_default())
        };

        cell.get_or_try_init(|| self.load(&target)).await.cloned()
    }

    /// Already-loaded catalog for `platform`, without fetching.
    pub fn get(&self, platform: &str) -> Option<Arc<Catalog>> {
        let catalogs = self.catalogs.lock();
        catalogs.get(platform).and_then(|cell| cell.get().cloned())
    }

    async fn load(&self, target: &PlatformTarget) -> BundleResult<Arc<Catalog>> {
        if let Some(store) = &self.authoring {
            match store.read_manifest(target).await {
                Ok(Some(data)) => {
                    let catalog = parse_manifest(&target.name, &data)?;
                    info!(
                        "catalog loaded from authoring source target={} bundles={}",
                        target.name,
                        catalog.len()
                    );
                    return Ok(Arc::new(catalog));
                }
                Ok(None) => debug!("no authoring manifest for target={}", target.name),
                Err(e) => warn!("authoring manifest unreadable: {:#}", e),
            }
        }

        if self.shutdown.is_cancelled() {
            return Err(BundleError::AbortedByShutdown);
        }

        let data = tokio::select! {
            result = self.source.fetch_manifest(target) => {
                result.map_err(|e| {
                    BundleError::ManifestUnavailable(format!(
                        "fetching manifest for target '{}': {}",
                        target.name, e
                    ))
                })?
            }
            _ = self.shutdown.cancelled() => {
                debug!("manifest fetch for target={} cancelled by shutdown", target.name);
                return Err(BundleError::AbortedByShutdown);
            }
        };

        let catalog = parse_manifest(&target.name, &data)?;
        info!(
            "catalog loaded target={} bundles={}",
            target.name,
            catalog.len()
        );
        Ok(Arc::new(catalog))
    }
}
