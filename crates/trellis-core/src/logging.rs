//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Default filter directive when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "trellis=info";

/// Install the global fmt subscriber.
///
/// Honours `RUST_LOG` and falls back to [`DEFAULT_DIRECTIVE`]. Calling this
/// more than once is harmless; only the first call installs a subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
