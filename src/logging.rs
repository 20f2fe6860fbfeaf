//! Tracing initialization. The core only ever writes through the `tracing`
//! macros; formatting and draining are the subscriber's business.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber at the given base level. `RUST_LOG`
/// overrides when set. Call once at startup; a disabled log system simply
/// never installs a subscriber.
///
/// Returns false when a subscriber was already installed (tests initialize
/// logging more than once).
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
