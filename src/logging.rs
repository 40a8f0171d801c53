//! Process-wide tracing subscriber.

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate logs at `level` and
/// everything else at `warn`. Returns `false` if a subscriber was already
/// installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,srf_setup={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
