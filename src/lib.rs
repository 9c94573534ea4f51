//! Pre-forking HTTP server.
//!
//! A supervisor process binds one address and keeps a fixed pool of worker
//! processes serving it. Each worker runs a single-threaded event loop that
//! hands HTTP/1.1 requests to an application [`app::Handler`].

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod server;
pub mod supervisor;

pub use app::{AppRef, AppRegistry, Handler, Request, RequestError, Response};
pub use config::Config;
pub use error::{BindError, ConfigError, StartupError, SupervisorError, WorkerError};
pub use supervisor::{PoolHandle, PoolReport, PoolStatus, RunningPool, Supervisor, WorkerSpec};
