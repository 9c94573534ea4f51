//! Error taxonomy of the supervisor and its workers.
//!
//! Startup errors (`ConfigError`, `BindError`, `StartupError`) are fatal and
//! never retried. Worker crashes are contained by the supervisor until the
//! crash-loop budget runs out (`SupervisorError::CrashLoop`). Per-request
//! failures live in [`crate::app::RequestError`] and never leave the worker.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid bind address `{addr}`: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("no application handler configured (use --app or PREFORK_SERVER__APP)")]
    MissingApp,
    #[error("invalid application reference `{0}`, expected `module:object`")]
    InvalidAppRef(String),
    #[error("unknown application `{name}` (available: {available})")]
    UnknownApp { name: String, available: String },
    #[error("invalid log level `{0}`")]
    InvalidLogLevel(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("cannot locate the worker program: {0}")]
    WorkerProgram(#[source] io::Error),
    #[error("failed to spawn worker {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker {slot} crashed {crashes} times within {window:?}, giving up")]
    CrashLoop {
        slot: usize,
        crashes: usize,
        window: Duration,
    },
    #[error("supervisor task failed: {0}")]
    Monitor(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker context unavailable: {0}")]
    Context(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to join listener on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("worker runtime error: {0}")]
    Runtime(#[from] io::Error),
}
