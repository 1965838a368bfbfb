// In-memory bundle cache: one record per bundle name for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::catalog::ContentHash;
use crate::error::{BundleError, BundleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Unloaded,
    Downloading,
    Loaded,
}

/// Where a loaded payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOrigin {
    Network,
    /// Conditional transfer answered "not modified"; bytes came from the
    /// persistent local copy.
    NotModified,
    AuthoringSource,
    LocalFallback,
}

/// A decoded bundle. Owned by its cache record; callers get shared read-only
/// access through `Arc`.
#[derive(Debug)]
pub struct LoadedBundle {
    pub name: String,
    pub hash: ContentHash,
    pub payload: Bytes,
    pub origin: BundleOrigin,
}

impl LoadedBundle {
    pub fn from_local_fallback(&self) -> bool {
        self.origin == BundleOrigin::LocalFallback
    }
}

struct BundleRecord {
    dependencies: Vec<String>,
    /// Hash of the most recently loaded payload; survives a flush.
    hash: Option<ContentHash>,
    payload: Option<Arc<LoadedBundle>>,
    state: BundleState,
    download_attempted: bool,
    last_status_code: u16,
    consumers: usize,
    /// Resolutions in progress that need this bundle to stay loaded.
    pins: usize,
    /// A flush arrived while pinned or downloading; apply it once released.
    flush_pending: bool,
    notify: Arc<Notify>,
}

impl BundleRecord {
    fn new(dependencies: Vec<String>) -> Self {
        Self {
            dependencies,
            hash: None,
            payload: None,
            state: BundleState::Unloaded,
            download_attempted: false,
            last_status_code: 0,
            consumers: 0,
            pins: 0,
            flush_pending: false,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Point-in-time copy of a record for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub name: String,
    pub dependencies: Vec<String>,
    pub hash: Option<ContentHash>,
    pub state: BundleState,
    pub download_attempted: bool,
    pub last_status_code: u16,
    pub consumers: usize,
}

/// Outcome of trying to start a download.
pub enum Claim<'a> {
    Loaded(Arc<LoadedBundle>),
    /// Another task is downloading; wait on the notifier and check again.
    InFlight(Arc<Notify>),
    Claimed(DownloadClaim<'a>),
}

pub struct BundleCache {
    records: Mutex<HashMap<String, BundleRecord>>,
}

impl BundleCache {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Return the record for `name`, creating an `Unloaded` one on first use.
    pub fn get_or_create_record(&self, name: &str, dependencies: &[String]) -> RecordSnapshot {
        let mut records = self.records.lock();
        let record = records
            .entry(name.to_string())
            .or_insert_with(|| BundleRecord::new(dependencies.to_vec()));
        snapshot_of(name, record)
    }

    /// Cache-hit path: never touches the network.
    pub fn try_get_loaded(&self, name: &str) -> Option<Arc<LoadedBundle>> {
        let records = self.records.lock();
        records
            .get(name)
            .filter(|r| r.state == BundleState::Loaded)
            .and_then(|r| r.payload.clone())
    }

    pub fn state(&self, name: &str) -> BundleState {
        let records = self.records.lock();
        records
            .get(name)
            .map(|r| r.state)
            .unwrap_or(BundleState::Unloaded)
    }

    pub fn snapshot(&self, name: &str) -> Option<RecordSnapshot> {
        let records = self.records.lock();
        records.get(name).map(|r| snapshot_of(name, r))
    }

    /// Hash of the last payload loaded for `name`, if any.
    pub fn known_hash(&self, name: &str) -> Option<ContentHash> {
        let records = self.records.lock();
        records.get(name).and_then(|r| r.hash)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        let records = self.records.lock();
        records.get(name).map(|r| r.consumers).unwrap_or(0)
    }

    pub fn loaded_names(&self) -> Vec<String> {
        let records = self.records.lock();
        let mut names: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.state == BundleState::Loaded)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Loaded → payload; Downloading → notifier to wait on; Unloaded → the
    /// caller now owns the download.
    pub fn claim_download(&self, name: &str, dependencies: &[String]) -> Claim<'_> {
        let mut records = self.records.lock();
        let record = records
            .entry(name.to_string())
            .or_insert_with(|| BundleRecord::new(dependencies.to_vec()));

        match record.state {
            BundleState::Loaded => match &record.payload {
                Some(payload) => Claim::Loaded(Arc::clone(payload)),
                None => {
                    warn!("bundle {} marked loaded without payload, reloading", name);
                    record.state = BundleState::Downloading;
                    record.download_attempted = true;
                    Claim::Claimed(DownloadClaim::new(self, name))
                }
            },
            BundleState::Downloading => Claim::InFlight(Arc::clone(&record.notify)),
            BundleState::Unloaded => {
                record.state = BundleState::Downloading;
                record.download_attempted = true;
                if record.dependencies.is_empty() && !dependencies.is_empty() {
                    record.dependencies = dependencies.to_vec();
                }
                debug!("bundle {} unloaded -> downloading", name);
                Claim::Claimed(DownloadClaim::new(self, name))
            }
        }
    }

    /// Increment the consumer counter, creating the record if needed.
    pub fn retain(&self, name: &str) -> usize {
        let mut records = self.records.lock();
        let record = records
            .entry(name.to_string())
            .or_insert_with(|| BundleRecord::new(Vec::new()));
        record.consumers += 1;
        record.flush_pending = false;
        record.consumers
    }

    /// Decrement the consumer counter; saturates at zero.
    pub fn release(&self, name: &str) -> usize {
        let mut records = self.records.lock();
        match records.get_mut(name) {
            Some(record) if record.consumers > 0 => {
                record.consumers -= 1;
                record.consumers
            }
            _ => {
                warn!("release of bundle {} with no consumers", name);
                0
            }
        }
    }

    /// Keep `names` from being flushed until `unpin`.
    pub fn pin(&self, names: &[String]) {
        let mut records = self.records.lock();
        for name in names {
            let record = records
                .entry(name.clone())
                .or_insert_with(|| BundleRecord::new(Vec::new()));
            record.pins += 1;
        }
    }

    /// Release pins taken by `pin`, applying any flush deferred meanwhile.
    pub fn unpin(&self, names: &[String]) {
        let mut records = self.records.lock();
        for name in names {
            let Some(record) = records.get_mut(name) else {
                continue;
            };
            record.pins = record.pins.saturating_sub(1);
            if record.pins == 0 && record.consumers == 0 && record.flush_pending {
                flush_record(name, record);
            }
        }
    }

    /// Drop the payload of `name` and reset it to `Unloaded`. Refused while
    /// consumers remain unless `force`. Returns whether a payload was freed.
    pub fn flush(&self, name: &str, force: bool) -> BundleResult<bool> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(name) else {
            return Ok(false);
        };

        if record.consumers > 0 && !force {
            return Err(BundleError::BundleInUse {
                name: name.to_string(),
                consumers: record.consumers,
            });
        }

        Ok(flush_record(name, record))
    }

    /// Flush every record; without `force`, bundles that still have consumers
    /// are skipped. Returns the number of payloads freed.
    pub fn flush_all(&self, force: bool) -> usize {
        let mut records = self.records.lock();
        let mut freed = 0;
        for (name, record) in records.iter_mut() {
            if (force || record.consumers == 0) && flush_record(name, record) {
                freed += 1;
            }
        }
        freed
    }

    fn finish(&self, name: &str, outcome: Result<Arc<LoadedBundle>, Option<u16>>) {
        let notify = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(name) else {
                return;
            };
            match outcome {
                Ok(bundle) => {
                    record.hash = Some(bundle.hash);
                    record.payload = Some(bundle);
                    record.state = BundleState::Loaded;
                    debug!("bundle {} downloading -> loaded", name);
                    if record.flush_pending && record.pins == 0 && record.consumers == 0 {
                        flush_record(name, record);
                    }
                }
                Err(status) => {
                    record.flush_pending = false;
                    if let Some(status) = status {
                        record.last_status_code = status;
                    }
                    if record.state == BundleState::Downloading {
                        record.state = BundleState::Unloaded;
                        debug!("bundle {} downloading -> unloaded", name);
                    }
                }
            }
            Arc::clone(&record.notify)
        };
        notify.notify_waiters();
    }

    fn record_status(&self, name: &str, status: u16) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(name) {
            record.last_status_code = status;
        }
    }
}

impl Default for BundleCache {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_of(name: &str, record: &BundleRecord) -> RecordSnapshot {
    RecordSnapshot {
        name: name.to_string(),
        dependencies: record.dependencies.clone(),
        hash: record.hash,
        state: record.state,
        download_attempted: record.download_attempted,
        last_status_code: record.last_status_code,
        consumers: record.consumers,
    }
}

fn flush_record(name: &str, record: &mut BundleRecord) -> bool {
    match record.state {
        BundleState::Loaded if record.pins > 0 => {
            debug!("bundle {} flush deferred: pinned by a resolution", name);
            record.flush_pending = true;
            false
        }
        BundleState::Loaded => {
            record.payload = None;
            record.state = BundleState::Unloaded;
            record.flush_pending = false;
            debug!("bundle {} flushed", name);
            true
        }
        // The in-flight download owns the record until it finishes.
        BundleState::Downloading => {
            debug!("bundle {} flush deferred: download in flight", name);
            record.flush_pending = true;
            false
        }
        BundleState::Unloaded => {
            record.flush_pending = false;
            false
        }
    }
}

/// Exclusive right to download one bundle. Dropping it without calling
/// `complete` returns the record to `Unloaded` and wakes any waiters.
pub struct DownloadClaim<'a> {
    cache: &'a BundleCache,
    name: String,
    finished: bool,
}

impl<'a> DownloadClaim<'a> {
    fn new(cache: &'a BundleCache, name: &str) -> Self {
        Self {
            cache,
            name: name.to_string(),
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remember the status of the latest transfer attempt.
    pub fn record_status(&self, status: u16) {
        self.cache.record_status(&self.name, status);
    }

    pub fn complete(mut self, bundle: LoadedBundle) -> Arc<LoadedBundle> {
        let bundle = Arc::new(bundle);
        self.finished = true;
        self.cache.finish(&self.name, Ok(Arc::clone(&bundle)));
        bundle
    }

    pub fn fail(mut self, status: u16) {
        self.finished = true;
        self.cache.finish(&self.name, Err(Some(status)));
    }
}

impl Drop for DownloadClaim<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.finish(&self.name, Err(None));
        }
    }
}
