//! Diagnostic tracing for the engine.
//!
//! Tracing output goes to stderr and is filtered by `RUST_LOG`. It is not a
//! product artifact: checkpoints, `audit.jsonl` and node output records under
//! `.devloop/runs/` are written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber once per process. Defaults to `warn` when
/// `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=devloop=debug devloop step
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
