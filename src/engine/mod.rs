// Engine orchestration: cache, fetching, dependency resolution and lifecycle.

pub mod cache;
pub mod fetcher;
pub mod lifecycle;
pub mod manager;
pub mod progress;
pub mod resolver;
pub mod stats;
pub mod warmup;
