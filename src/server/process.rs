// Worker process entry point
// The supervisor re-executes its own binary with the `worker` subcommand and
// hands over everything the worker needs in one JSON environment variable

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::control::{self, ControlMessage, ControlSender};
use super::listener;
use super::signal;
use super::worker::{ExitReason, Worker, WorkerOptions, WorkerStats};
use crate::app::{AppFactory, AppRef, AppRegistry};
use crate::config::{LoggingConfig, PerformanceConfig};
use crate::error::WorkerError;

/// Environment variable carrying the serialized [`WorkerContext`]
pub const CONTEXT_ENV: &str = "SERVE_WORKER_CONTEXT";

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a worker process is started with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub slot: usize,
    /// Incremented every time the slot is respawned
    pub generation: u64,
    pub addr: SocketAddr,
    pub app: String,
    pub backlog: u32,
    pub heartbeat_interval_ms: u64,
    /// Effective request quota with jitter applied, 0 = unlimited
    pub max_requests: u64,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

impl WorkerContext {
    pub fn from_env() -> Result<Self, WorkerError> {
        let raw = std::env::var(CONTEXT_ENV)
            .map_err(|e| WorkerError::Context(format!("{CONTEXT_ENV}: {e}")))?;
        Self::decode(&raw)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, WorkerError> {
        serde_json::from_str(raw).map_err(|e| WorkerError::Context(e.to_string()))
    }

    pub fn options(&self) -> WorkerOptions {
        WorkerOptions::from_config(&self.performance, &self.logging, self.max_requests)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms).max(MIN_HEARTBEAT_INTERVAL)
    }
}

/// Run a worker process to completion.
///
/// Builds a single-threaded runtime, joins the shared listener and serves
/// until the supervisor closes our stdin, a stop signal arrives or the
/// request quota is used up.
pub fn run(context: WorkerContext, registry: &AppRegistry) -> Result<ExitReason, WorkerError> {
    let app: AppRef = context.app.parse()?;
    let factory = registry.resolve(&app)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, serve_process(context, factory))
}

async fn serve_process(context: WorkerContext, factory: AppFactory) -> Result<ExitReason, WorkerError> {
    let slot = context.slot;
    let listener = listener::join(context.addr, context.backlog).map_err(|source| {
        WorkerError::Listen {
            addr: context.addr,
            source,
        }
    })?;

    let (stop_tx, stop_rx) = watch::channel(false);
    watch_supervisor(stop_tx.clone())?;
    signal::spawn_worker_signals(stop_tx)?;

    let (control, writer) = control::stdout_channel();
    let worker = Worker::new(slot, factory.build(), context.options());
    let stats = worker.stats();
    let heartbeat = tokio::task::spawn_local(heartbeat(
        control.clone(),
        Arc::clone(&stats),
        context.heartbeat_interval(),
    ));

    tracing::info!(
        worker = slot,
        generation = context.generation,
        "worker booted (pid {}), serving {}",
        std::process::id(),
        context.app
    );
    control.send(ControlMessage::Ready {
        pid: std::process::id(),
    });

    let reason = worker.serve(listener, stop_rx, &control).await;

    heartbeat.abort();
    let _ = heartbeat.await;
    // Final counts, so the supervisor's totals include the drain
    control.send(ControlMessage::Heartbeat {
        served: stats.served(),
        active: stats.active(),
    });
    drop(control);
    if let Err(e) = writer.await {
        tracing::debug!(worker = slot, "control writer ended abnormally: {e}");
    }

    tracing::info!(worker = slot, ?reason, "worker exiting");
    Ok(reason)
}

/// Stop once the supervisor closes our stdin, or dies and the pipe breaks.
///
/// Runs on a plain thread: a blocking stdin read inside the runtime would
/// keep it from shutting down.
fn watch_supervisor(stop: watch::Sender<bool>) -> io::Result<()> {
    std::thread::Builder::new()
        .name("supervisor-watch".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            if let Err(e) = io::copy(&mut stdin, &mut io::sink()) {
                tracing::debug!("supervisor pipe failed: {e}");
            }
            stop.send_replace(true);
        })?;
    Ok(())
}

async fn heartbeat(control: ControlSender, stats: Arc<WorkerStats>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        control.send(ControlMessage::Heartbeat {
            served: stats.served(),
            active: stats.active(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> WorkerContext {
        WorkerContext {
            slot: 2,
            generation: 5,
            addr: "127.0.0.1:8000".parse().unwrap(),
            app: "builtin:echo".to_string(),
            backlog: 128,
            heartbeat_interval_ms: 0,
            max_requests: 40,
            performance: PerformanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn context_survives_the_environment() {
        let ctx = context();
        let decoded = WorkerContext::decode(&ctx.encode().unwrap()).unwrap();
        assert_eq!(decoded, ctx);
        assert_eq!(decoded.options().max_requests, Some(40));
    }

    #[test]
    fn garbage_context_is_rejected() {
        assert!(matches!(
            WorkerContext::decode("{not json"),
            Err(WorkerError::Context(_))
        ));
    }

    #[test]
    fn heartbeat_interval_has_a_floor() {
        assert_eq!(context().heartbeat_interval(), MIN_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn unknown_app_fails_before_serving() {
        let ctx = WorkerContext {
            app: "missing:app".to_string(),
            ..context()
        };
        let err = run(ctx, &AppRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }
}
