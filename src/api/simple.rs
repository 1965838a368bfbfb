use std::sync::Once;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

static INIT_TRACING: Once = Once::new();

/// Install the global tracing subscriber. `RUST_LOG` overrides `level`.
/// Safe to call more than once; only the first call has an effect.
pub fn init_tracing(level: LogLevel) {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{},hyper=warn,reqwest=warn", level.as_filter()))
        });

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("bundle engine tracing initialized");
    });
}
