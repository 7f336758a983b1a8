//! Logging setup for harness runs.
//!
//! The harness itself only emits `tracing` events: state transitions at
//! `debug`, policy iterations and session changes at `info`, and every
//! recorded failure or leaked guard at `warn`. Which of them are shown is up
//! to the subscriber installed here (or the host's own).
//!
//! # Example
//!
//! ```rust,no_run
//! use partcheck::logger::init_logger;
//!
//! init_logger(false, false, false);
//! tracing::info!("starting partition checks");
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither a flag nor `RUST_LOG` says otherwise.
pub const DEFAULT_FILTER: &str = "partcheck=info";

/// Installs the global subscriber.
///
/// Level is chosen in this order:
/// 1. `verbose`: DEBUG for this crate
/// 2. `quiet`: errors only
/// 3. `RUST_LOG`
/// 4. [`DEFAULT_FILTER`]
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Tests should use
/// [`init_test_logger`].
pub fn init_logger(verbose: bool, quiet: bool, no_color: bool) {
    init_logger_with_filter(select_filter(verbose, quiet), no_color);
}

/// Installs the global subscriber with an explicit filter.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logger_with_filter(filter: EnvFilter, no_color: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(!no_color)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Installs a test-writer subscriber once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_test_logger() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("partcheck=debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer().with_ansi(false).compact())
        .try_init();
}

fn select_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("partcheck=debug")
    } else if quiet {
        EnvFilter::new("partcheck=error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}
