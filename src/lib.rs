//! Content bundle engine: fetches named, versioned bundles from a
//! content-delivery source, loads their dependencies first, bounds
//! concurrent transfers, and frees bundles once no consumer holds them.

pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod source;

pub use catalog::{Catalog, CatalogEntry, ContentHash};
pub use config::{EngineConfig, LogLevel, PlatformTarget};
pub use engine::cache::{BundleOrigin, BundleState, LoadedBundle};
pub use engine::lifecycle::{ConsumerHandle, ConsumerId};
pub use engine::manager::BundleManager;
pub use engine::progress::{ProgressAggregator, ProgressHandle};
pub use error::{BundleError, BundleResult};
