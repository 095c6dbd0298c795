//! Logging for the cert-states-site daemon.
//!
//! The daemon runs unattended and is watched through log aggregation,
//! so every enabled `tracing` event goes to stdout as a single JSON
//! object per line. What gets through is controlled by `RUST_LOG`
//! (standard `tracing_subscriber` target syntax); without it, INFO and
//! above are logged.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Install the process-wide JSON logger. Call once from `main`; panics
/// if some other subscriber was installed first.
pub fn init() {
    try_init().expect("A global logger is already installed");
}

/// Logger setup for tests. Does nothing unless `RUST_LOG` is set, and
/// tolerates parallel test threads racing to install the subscriber.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = try_init();
    }
}

/// Install the process-wide JSON logger, unless another subscriber beat
/// us to it.
pub fn try_init() -> Result<(), TryInitError> {
    let json_to_stdout = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_filter(log_filter());

    tracing_subscriber::registry().with(json_to_stdout).try_init()
}

/// The event filter from `RUST_LOG`. A missing or unparseable variable
/// falls back to INFO-and-above across all targets.
fn log_filter() -> Targets {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|directives| Targets::from_str(&directives).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO))
}
