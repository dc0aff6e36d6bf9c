//! Diagnostic tracing for the supervisor and the worker host.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Never part of grading output.
//!
//! - **Captured output (`environment::Results`)**: what the unit printed. The
//!   worker host writes it to the result channel, so enabling tracing inside a
//!   worker never pollutes a submission's stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for diagnostic logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format. Safe to call more than once; later calls are
/// ignored so tests and the worker host can both initialize freely.
///
/// # Example
/// ```bash
/// RUST_LOG=harness=debug cargo test -p harness
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
