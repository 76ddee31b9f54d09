//! Process-wide diagnostic output.

use tracing_subscriber::EnvFilter;

/// Install a `tracing` fmt subscriber at `level` (e.g. `"debug"`).
///
/// `RUST_LOG` overrides `level` when set. Returns `false` when a global
/// subscriber was already installed, in which case nothing changes.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}
