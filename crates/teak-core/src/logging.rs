//! Tracing subscriber setup for host applications.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "teak_core=info,warn";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into())
}

/// Install a human-readable subscriber. Returns false if one was already set.
pub fn init(default: &str) -> bool {
    tracing_subscriber::registry().with(filter(default)).with(tracing_subscriber::fmt::layer()).try_init().is_ok()
}

/// Install a JSON subscriber. Returns false if one was already set.
pub fn init_json(default: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}
