//! Logging setup for binaries and tests embedding the property cache.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the embedding process.

use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a global subscriber. `RUST_LOG` directives take precedence over
/// the configured level.
///
/// Returns false, leaving the existing one in place, if a global subscriber
/// is already installed.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level).into())
        .from_env_lossy();

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };
    match installed {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "tracing subscriber already installed");
            false
        }
    }
}
