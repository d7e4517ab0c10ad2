//! Log setup for the daemon.
//!
//! Under systemd the daemon logs straight to the journal (systemd exports
//! `JOURNAL_STREAM` when it owns stderr); anywhere else it uses the stock
//! compact stdout format. Filtering follows `RUST_LOG` with an INFO default
//! so the periodic per-device status lines are visible out of the box.

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
};

/// Install the global subscriber.
pub fn init() {
    #[cfg(target_os = "linux")]
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald)
                .init();
            return;
        }
        eprintln!("could not open journald socket, logging to stdout");
    }

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}
