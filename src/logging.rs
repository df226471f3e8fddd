//! Logging initialisation.
//!
//! The engine emits structured events through [`tracing`]; the binary
//! installs one console subscriber here. `RUST_LOG` overrides the default
//! filter when set.

use tracing_subscriber::EnvFilter;

/// Install the global console subscriber.
///
/// Idempotent: a second call (e.g., from tests) is a no-op.
pub fn init(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
