//! Logger module
//!
//! Provides logging utilities for the supervisor and its workers:
//! - `tracing` subscriber setup (stderr, `RUST_LOG` aware)
//! - Server lifecycle banners
//! - Access logging with multiple formats

mod format;

pub use format::AccessLogEntry;

use std::net::SocketAddr;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, LoggingConfig};

/// Target used for access log events, filterable with `RUST_LOG=access=off`
pub const ACCESS_TARGET: &str = "access";

/// Install the global subscriber.
///
/// Output goes to stderr: a worker's stdout is its control channel to the
/// supervisor. Calling this twice keeps the first subscriber.
pub fn init(config: &LoggingConfig) {
    let level = config
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

pub fn log_server_start(addr: &SocketAddr, app: &str, config: &Config) {
    tracing::info!("======================================");
    tracing::info!("Supervisor started (pid {})", std::process::id());
    tracing::info!("Listening on: http://{addr}");
    tracing::info!("Application: {app}");
    tracing::info!("Workers: {}", config.server.workers);
    tracing::info!(
        "Graceful timeout: {}s, worker timeout: {}s",
        config.supervisor.graceful_timeout,
        config.supervisor.worker_timeout
    );
    if config.performance.max_requests > 0 {
        tracing::info!(
            "Workers recycle after {} requests (+{} jitter)",
            config.performance.max_requests,
            config.performance.max_requests_jitter
        );
    }
    tracing::info!("======================================");
}

/// Log formatted access log entry
pub fn log_access(entry: &AccessLogEntry, format: &str) {
    tracing::info!(target: ACCESS_TARGET, "{}", entry.format(format));
}
