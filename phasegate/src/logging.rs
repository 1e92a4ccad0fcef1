//! Diagnostic tracing to stderr.
//!
//! CLI invocations default to `warn` so hook output stays quiet; the daemon
//! defaults to `info`, and its stderr is appended to `.phasegate/daemon.log`
//! by whoever spawned it. `RUST_LOG` overrides both.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const CLI_DEFAULT: &str = "warn";
pub const DAEMON_DEFAULT: &str = "info";

/// Initialize the tracing subscriber, falling back to `default_filter` if `RUST_LOG` is unset.
///
/// # Example
/// ```bash
/// RUST_LOG=phasegate=debug phasegate get-phase
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
