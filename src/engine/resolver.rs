// Dependency resolution: load a bundle's transitive dependencies level by
// level before the bundle itself.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use super::cache::{BundleCache, LoadedBundle};
use super::fetcher::Fetcher;
use super::progress::ProgressHandle;
use crate::catalog::Catalog;
use crate::error::{BundleError, BundleResult};

/// Keeps a resolution's bundles from being flushed until it finishes.
struct Pin<'a> {
    cache: &'a BundleCache,
    names: Vec<String>,
}

impl<'a> Pin<'a> {
    fn new(cache: &'a BundleCache, names: Vec<String>) -> Self {
        cache.pin(&names);
        Self { cache, names }
    }
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.names);
    }
}

pub struct DependencyResolver {
    cache: Arc<BundleCache>,
    fetcher: Arc<Fetcher>,
}

impl DependencyResolver {
    pub fn new(cache: Arc<BundleCache>, fetcher: Arc<Fetcher>) -> Self {
        Self { cache, fetcher }
    }

    /// Load `name` and everything it depends on. A bundle is only handed to
    /// the fetcher once all bundles in earlier levels are loaded; bundles in
    /// the same level load concurrently.
    pub async fn ensure_ready(
        &self,
        catalog: &Catalog,
        name: &str,
        progress: ProgressHandle,
    ) -> BundleResult<Arc<LoadedBundle>> {
        let levels = catalog.load_levels(name)?;
        let order: Vec<String> = levels.iter().flatten().cloned().collect();
        debug!("ensure_ready {} load order {:?}", name, order);

        let mut parts = progress.split(order.len()).into_iter();
        let _pin = Pin::new(&self.cache, order);

        let mut root = None;
        for level in &levels {
            let handles: Vec<ProgressHandle> = parts.by_ref().take(level.len()).collect();
            let loaded = try_join_all(
                level
                    .iter()
                    .zip(handles.iter())
                    .map(|(bundle, handle)| self.fetcher.fetch(catalog, bundle, handle)),
            )
            .await?;
            root = loaded.into_iter().last();
        }

        root.ok_or_else(|| BundleError::UnknownBundle(name.to_string()))
    }
}
