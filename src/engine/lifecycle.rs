// Reference-counted bundle lifecycle: consumers keep a bundle and its
// transitive dependencies loaded; the last release flushes them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::cache::BundleCache;
use crate::catalog::Catalog;
use crate::error::BundleResult;

/// Opaque identity of whoever holds a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConsumerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    id: u64,
    consumer: ConsumerId,
    root: String,
    /// Root plus its transitive dependencies, dependencies first.
    bundles: Vec<String>,
}

impl ConsumerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn bundles(&self) -> &[String] {
        &self.bundles
    }
}

pub struct LifecycleManager {
    cache: Arc<BundleCache>,
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, ConsumerHandle>>,
}

impl LifecycleManager {
    pub fn new(cache: Arc<BundleCache>) -> Self {
        Self {
            cache,
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Count `consumer` as a holder of `root` and every bundle it
    /// transitively depends on. Works before anything is loaded.
    pub fn register(
        &self,
        catalog: &Catalog,
        consumer: impl Into<ConsumerId>,
        root: &str,
    ) -> BundleResult<ConsumerHandle> {
        let bundles = catalog.load_order(root)?;
        let handle = ConsumerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            consumer: consumer.into(),
            root: root.to_string(),
            bundles,
        };

        let mut handles = self.handles.lock();
        for name in &handle.bundles {
            self.cache.retain(name);
        }
        handles.insert(handle.id, handle.clone());
        debug!(
            "consumer {} registered on {} ({} bundles)",
            handle.consumer,
            handle.root,
            handle.bundles.len()
        );
        Ok(handle)
    }

    /// Release a handle; bundles nobody holds any more are flushed. Returns
    /// the names whose payloads were freed. Releasing twice only warns.
    pub fn unregister(&self, handle: &ConsumerHandle) -> Vec<String> {
        let mut handles = self.handles.lock();
        if handles.remove(&handle.id).is_none() {
            warn!(
                "consumer {} handle {} for {} already unregistered",
                handle.consumer, handle.id, handle.root
            );
            return Vec::new();
        }

        let mut flushed = Vec::new();
        for name in &handle.bundles {
            if self.cache.release(name) > 0 {
                continue;
            }
            match self.cache.flush(name, false) {
                Ok(true) => flushed.push(name.clone()),
                Ok(false) => {}
                Err(e) => debug!("flush of {} skipped: {}", name, e),
            }
        }
        debug!(
            "consumer {} unregistered from {}, flushed {:?}",
            handle.consumer, handle.root, flushed
        );
        flushed
    }

    /// Release every handle held by `consumer` (teardown of its owner).
    pub fn unregister_consumer(&self, consumer: &ConsumerId) -> Vec<String> {
        let owned: Vec<ConsumerHandle> = {
            let handles = self.handles.lock();
            handles
                .values()
                .filter(|h| &h.consumer == consumer)
                .cloned()
                .collect()
        };
        owned.iter().flat_map(|h| self.unregister(h)).collect()
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.cache.consumer_count(name)
    }

    pub fn active_handles(&self) -> Vec<ConsumerHandle> {
        let handles = self.handles.lock();
        let mut active: Vec<ConsumerHandle> = handles.values().cloned().collect();
        active.sort_by_key(|h| h.id);
        active
    }
}
