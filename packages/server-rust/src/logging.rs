//! tracing-subscriber setup.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber: human-readable output at `debug` in
/// debug mode, JSON lines at `info` otherwise. `RUST_LOG` overrides the level.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(debug: bool) -> bool {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(debug);
    if debug {
        builder.pretty().try_init().is_ok()
    } else {
        builder.json().flatten_event(true).try_init().is_ok()
    }
}
