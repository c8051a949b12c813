// src/logging.rs
//! Tracing subscriber initialization.
//!
//! Call one of these once at startup, before constructing the server. The
//! level comes from `RUST_LOG` when set, otherwise from the argument.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging; `RUST_LOG` wins, default level is `info`.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with an explicit default level.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
