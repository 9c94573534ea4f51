// Server module entry
// Shared listener, worker event loop and the worker process around it

mod connection;
pub mod control;
pub mod listener;
pub mod process;
pub mod signal;
pub mod worker;

pub use control::{ControlMessage, ControlSender};
pub use listener::SharedSocket;
pub use process::{WorkerContext, CONTEXT_ENV};
pub use worker::{ExitReason, Worker, WorkerOptions, WorkerStats};
