use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::manager::BundleManager;
use crate::error::BundleResult;

/// Load `names` in the background (e.g. right after startup). Failures are
/// logged here; the join handle yields each bundle's outcome.
pub fn preload(
    manager: &Arc<BundleManager>,
    names: Vec<String>,
) -> JoinHandle<Vec<(String, BundleResult<()>)>> {
    let manager = Arc::clone(manager);
    tokio::spawn(async move {
        let outcomes = join_all(names.iter().map(|name| manager.ensure_ready(name))).await;

        let results: Vec<(String, BundleResult<()>)> = names
            .into_iter()
            .zip(outcomes)
            .map(|(name, outcome)| {
                if let Err(e) = &outcome {
                    warn!("preload of {} failed: {}", name, e);
                }
                (name, outcome.map(|_| ()))
            })
            .collect();

        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!("preload finished: {}/{} bundles ready", ok, results.len());
        results
    })
}
