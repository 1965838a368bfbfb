// Shared fixtures: an in-memory bundle source that records every transfer.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use bundle_engine::config::{EngineConfig, PlatformTarget};
use bundle_engine::source::traits::{
    BundleRequest, BundleSource, ByteProgress, FetchResponse, SourceError,
};
use bundle_engine::ContentHash;

pub const PLATFORM: &str = "test";
pub const TARGET: &str = "testplat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    End(String),
}

pub fn start(name: &str) -> Event {
    Event::Start(name.to_string())
}

pub fn end(name: &str) -> Event {
    Event::End(name.to_string())
}

pub fn hash_for(name: &str) -> ContentHash {
    let mut value: u128 = 0xcbf2_9ce4_8422_2325;
    for b in name.bytes() {
        value = (value ^ b as u128).wrapping_mul(0x0100_0000_01b3);
    }
    ContentHash::from_u128(value)
}

/// Manifest JSON for `(name, dependencies)` pairs.
pub fn manifest_json(bundles: &[(&str, &[&str])]) -> String {
    let entries: Vec<String> = bundles
        .iter()
        .map(|(name, deps)| {
            let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
            format!(
                "\"{}\": {{\"hash\": \"{}\", \"dependencies\": [{}]}}",
                name,
                hash_for(name),
                deps.join(", ")
            )
        })
        .collect();
    format!("{{\"bundles\": {{{}}}}}", entries.join(", "))
}

pub fn payload_for(name: &str) -> Bytes {
    Bytes::from(format!("payload:{}", name))
}

pub fn config(max_concurrent_downloads: u32) -> EngineConfig {
    EngineConfig {
        cdn_url: "http://cdn.invalid".to_string(),
        platform: PLATFORM.to_string(),
        platforms: HashMap::from([(
            PLATFORM.to_string(),
            PlatformTarget {
                name: TARGET.to_string(),
                bucket: "bucket-1".to_string(),
            },
        )]),
        max_concurrent_downloads,
        max_retries: 0,
        ..EngineConfig::default()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory source. Every bundle in the manifest is served as
/// `payload:<name>` unless told to fail or hang.
pub struct FakeSource {
    manifest: Mutex<Option<String>>,
    delay: Duration,
    manifest_delay: Mutex<Duration>,
    failing: Mutex<HashMap<String, (u16, usize)>>,
    hanging: Mutex<HashSet<String>>,
    expiring: Mutex<HashMap<String, PathBuf>>,
    events: Mutex<Vec<Event>>,
    manifest_fetches: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeSource {
    pub fn new(bundles: &[(&str, &[&str])]) -> Arc<Self> {
        Self::with_delay(bundles, Duration::from_millis(10))
    }

    pub fn with_delay(bundles: &[(&str, &[&str])], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            manifest: Mutex::new(Some(manifest_json(bundles))),
            delay,
            manifest_delay: Mutex::new(Duration::ZERO),
            failing: Mutex::new(HashMap::new()),
            hanging: Mutex::new(HashSet::new()),
            expiring: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            manifest_fetches: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn without_manifest(&self) {
        *self.manifest.lock() = None;
    }

    pub fn set_manifest_delay(&self, delay: Duration) {
        *self.manifest_delay.lock() = delay;
    }

    /// Fail every transfer of `name` with `status`.
    pub fn fail(&self, name: &str, status: u16) {
        self.fail_times(name, status, usize::MAX);
    }

    /// Fail the next `times` transfers of `name` with `status`.
    pub fn fail_times(&self, name: &str, status: u16, times: usize) {
        self.failing.lock().insert(name.to_string(), (status, times));
    }

    pub fn hang(&self, name: &str) {
        self.hanging.lock().insert(name.to_string());
    }

    /// Answer conditional requests for `name` with not-modified after
    /// deleting `copy`, as if the local copy vanished in between.
    pub fn expire_copy_on_request(&self, name: &str, copy: PathBuf) {
        self.expiring.lock().insert(name.to_string(), copy);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn starts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Start(name) => Some(name),
                Event::End(_) => None,
            })
            .collect()
    }

    pub fn fetch_count(&self, name: &str) -> usize {
        self.starts().iter().filter(|n| n.as_str() == name).count()
    }

    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleSource for FakeSource {
    async fn fetch_manifest(&self, target: &PlatformTarget) -> Result<Bytes, SourceError> {
        assert_eq!(target.name, TARGET);
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.manifest_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let manifest = self.manifest.lock().clone();
        manifest
            .map(Bytes::from)
            .ok_or(SourceError::Status(404))
    }

    async fn fetch_bundle(
        &self,
        request: &BundleRequest<'_>,
        on_bytes: ByteProgress<'_>,
    ) -> Result<FetchResponse, SourceError> {
        let name = request.name.to_string();
        self.events.lock().push(Event::Start(name.clone()));

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let hanging = self.hanging.lock().contains(&name);
        if hanging {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;

        let failure = {
            let mut failing = self.failing.lock();
            match failing.get_mut(&name) {
                Some((status, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*status)
                }
                _ => None,
            }
        };

        self.events.lock().push(Event::End(name.clone()));
        if request.if_none_match.is_some() {
            let expired = self.expiring.lock().get(&name).cloned();
            if let Some(copy) = expired {
                let _ = std::fs::remove_file(copy);
                return Ok(FetchResponse::NotModified);
            }
        }
        if let Some(status) = failure {
            return Err(if status == 0 {
                SourceError::Connection("connection refused".to_string())
            } else {
                SourceError::Status(status)
            });
        }

        let body = payload_for(&name);
        let total = body.len() as u64;
        on_bytes(total / 2, Some(total));
        on_bytes(total, Some(total));
        Ok(FetchResponse::Content(body))
    }
}
