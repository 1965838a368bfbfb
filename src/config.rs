use std::collections::HashMap;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::Deserialize;

use crate::error::{BundleError, BundleResult};

/// Default number of simultaneous bundle transfers across the whole engine.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: u32 = 4;

/// Retries of a failed transfer before falling back to the packaged copy.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Base delay between retries; multiplied by the attempt number.
pub const RETRY_BACKOFF_MS: u64 = 250;

/// Largest bundle or manifest body accepted from the network (512 MB).
pub const MAX_BUNDLE_BYTES: u64 = 512 * 1024 * 1024;

/// Progress share of the byte transfer phase.
pub const PROGRESS_TRANSFER_END: f32 = 0.4;

/// Progress share reached once decode has finished.
pub const PROGRESS_DECODE_END: f32 = 0.9;

/// A named deployment target (one catalog per target).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PlatformTarget {
    /// Target name; the manifest document is published as `<name>.manifest.json`.
    pub name: String,
    /// Content-delivery bucket holding this target's bundles.
    pub bucket: String,
}

impl PlatformTarget {
    pub fn manifest_file_name(&self) -> String {
        format!("{}.manifest.json", self.name)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Top-level configuration for the bundle engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the content-delivery API.
    pub cdn_url: String,
    /// Content-delivery environment (e.g. "production", "staging").
    pub environment: String,
    /// Release badge number bundles are fetched from.
    pub version: u32,
    /// Platform key used to pick an entry from `platforms`.
    pub platform: String,
    /// Platform key -> deployment target.
    pub platforms: HashMap<String, PlatformTarget>,
    /// Maximum number of bundle transfers in flight at once.
    pub max_concurrent_downloads: u32,
    pub max_retries: u32,
    /// Write every network download to `local_copy_dir` so later loads can
    /// use a conditional transfer.
    pub keep_local_fallback_copy: bool,
    /// Prefer bundles found under `authoring_dir` over the network.
    pub use_local_authoring_source_if_available: bool,
    pub log_level: LogLevel,
    /// Bundles packaged with the application, keyed by name.
    pub fallback_dir: Option<PathBuf>,
    pub local_copy_dir: Option<PathBuf>,
    pub authoring_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    /// Responses declaring or delivering more bytes than this are rejected.
    pub max_bundle_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cdn_url: String::new(),
            environment: "production".to_string(),
            version: 1,
            platform: std::env::consts::OS.to_string(),
            platforms: HashMap::new(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_retries: DEFAULT_MAX_RETRIES,
            keep_local_fallback_copy: false,
            use_local_authoring_source_if_available: false,
            log_level: LogLevel::default(),
            fallback_dir: None,
            local_copy_dir: None,
            authoring_dir: None,
            request_timeout_secs: 60,
            max_bundle_bytes: MAX_BUNDLE_BYTES,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> BundleResult<Self> {
        let config: EngineConfig = serde_json::from_str(text)
            .map_err(|e| BundleError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> BundleResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BundleError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> BundleResult<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(BundleError::InvalidConfig(
                "max_concurrent_downloads must be >= 1".to_string(),
            ));
        }
        if self.max_bundle_bytes == 0 {
            return Err(BundleError::InvalidConfig(
                "max_bundle_bytes must be >= 1".to_string(),
            ));
        }
        if !self.cdn_url.is_empty() {
            Url::parse(&self.cdn_url).map_err(|e| {
                BundleError::InvalidConfig(format!("cdn_url '{}': {}", self.cdn_url, e))
            })?;
        }
        if self.keep_local_fallback_copy && self.local_copy_dir.is_none() {
            return Err(BundleError::InvalidConfig(
                "keep_local_fallback_copy requires local_copy_dir".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a platform key to its deployment target.
    pub fn target_for(&self, platform: &str) -> BundleResult<&PlatformTarget> {
        self.platforms
            .get(platform)
            .ok_or_else(|| BundleError::PlatformNotConfigured(platform.to_string()))
    }

    /// Base URL of one target's bucket in the configured environment.
    pub fn base_url(&self, target: &PlatformTarget) -> String {
        format!(
            "{}/environments/{}/buckets/{}",
            self.cdn_url.trim_end_matches('/'),
            self.environment,
            target.bucket
        )
    }

    /// URL of a single entry (bundle or manifest) in the configured release.
    /// The entry path travels form-encoded in the `path` query parameter.
    pub fn entry_url(&self, target: &PlatformTarget, path: &str) -> BundleResult<Url> {
        let base = format!(
            "{}/release_by_badge/{}/entry_by_path/content/",
            self.base_url(target),
            self.version
        );
        let mut url = Url::parse(&base)
            .map_err(|e| BundleError::InvalidConfig(format!("entry url '{}': {}", base, e)))?;
        url.query_pairs_mut().append_pair("path", path);
        Ok(url)
    }
}
