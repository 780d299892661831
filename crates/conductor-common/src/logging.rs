// Tracing setup for Conductor binaries. Library crates only emit through the
// `tracing` macros; binaries call `init` once at startup.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Respects `RUST_LOG` for per-module filtering and defaults to `info`.
/// With `json` set, emits one JSON object per line for log collectors.
pub fn init(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
