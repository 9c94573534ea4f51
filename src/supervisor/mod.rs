//! Supervisor: owns the pool of worker slots.
//!
//! [`Supervisor::start`] binds the address, launches one process per slot
//! and hands the slots to a monitor task, the only place slot state is ever
//! changed. Workers report over their stdout and are stopped by closing
//! their stdin; everything else the supervisor learns from process exits.
//!
//! ```text
//! start ──► bind ──► spawn N ──► monitor ──► drain ──► PoolReport
//!                                   │  ▲
//!             PoolHandle::reload ───┘  └── worker events (ready, heartbeat, exit)
//! ```

mod backoff;
mod monitor;
mod slot;
mod spawn;

pub use backoff::{CrashHistory, RestartPolicy, Verdict};
pub use slot::{WorkerState, WorkerStatus};

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::app::AppRef;
use crate::config::Config;
use crate::error::{ConfigError, StartupError, SupervisorError};
use crate::server::{listener, WorkerContext};
use monitor::{Command, Monitor, MonitorChannels, MonitorSettings};
use slot::Slot;
use spawn::Spawner;

/// Arguments that make the program run as a worker
const WORKER_ARGS: &[&str] = &["worker"];

/// What the pool runs. Fixed once the supervisor starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub count: usize,
    pub addr: SocketAddr,
    pub app: AppRef,
}

impl WorkerSpec {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            count: config.server.workers,
            addr: config.socket_addr()?,
            app: config.app_ref()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Running,
    Draining,
    Stopped,
}

/// Snapshot of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub phase: PoolPhase,
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    pub fn running(&self) -> usize {
        self.count(WorkerState::Running)
    }

    pub fn count(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    pub fn restarts(&self) -> u32 {
        self.workers.iter().map(|w| w.restarts).sum()
    }

    pub fn crashes(&self) -> u32 {
        self.workers.iter().map(|w| w.crashes).sum()
    }
}

/// Final state of a pool that shut down cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: Vec<WorkerStatus>,
    /// Workers still alive when the grace period ran out
    pub forced_kills: usize,
}

impl PoolReport {
    pub fn restarts(&self) -> u32 {
        self.workers.iter().map(|w| w.restarts).sum()
    }

    pub fn served(&self) -> u64 {
        self.workers.iter().map(|w| w.served).sum()
    }
}

pub struct Supervisor {
    spec: WorkerSpec,
    config: Config,
    program: Option<PathBuf>,
    args: Vec<OsString>,
}

impl Supervisor {
    /// Timeouts, limits and logging of the workers come from `config`.
    pub fn new(spec: WorkerSpec, config: Config) -> Self {
        Self {
            spec,
            config,
            program: None,
            args: WORKER_ARGS.iter().map(OsString::from).collect(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(WorkerSpec::from_config(config)?, config.clone()))
    }

    /// Run `program args..` as the worker process instead of re-executing
    /// the current binary with `worker`.
    #[must_use]
    pub fn with_program<I, S>(mut self, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = Some(program.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub const fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Bind the address, launch every worker and start monitoring.
    ///
    /// Nothing is spawned when binding fails; if any worker cannot be
    /// launched, the ones already running are killed.
    pub async fn start(self) -> Result<RunningPool, StartupError> {
        let Self {
            spec,
            config,
            program,
            args,
        } = self;

        if spec.count == 0 {
            return Err(StartupError::NoWorkers);
        }

        let socket = listener::bind(spec.addr)?;
        let local_addr = socket.local_addr();

        let program = match program {
            Some(program) => program,
            None => std::env::current_exe().map_err(StartupError::WorkerProgram)?,
        };

        let template = WorkerContext {
            slot: 0,
            generation: 0,
            addr: local_addr,
            app: spec.app.to_string(),
            backlog: config.server.backlog,
            heartbeat_interval_ms: config.supervisor.heartbeat_interval_ms,
            max_requests: config.performance.max_requests,
            performance: config.performance.clone(),
            logging: config.logging.clone(),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let spawner = Spawner::new(
            program,
            args,
            template,
            config.performance.max_requests_jitter,
            events_tx,
        );

        let now = Instant::now();
        let mut slots = Vec::with_capacity(spec.count);
        for index in 0..spec.count {
            let child = spawner
                .spawn(index, 1)
                .map_err(|source| StartupError::Spawn { slot: index, source })?;
            slots.push(Slot::new(index, child, now));
        }
        tracing::info!("spawned {} workers for {} on {local_addr}", spec.count, spec.app);

        let (status_tx, status_rx) = watch::channel(PoolStatus {
            phase: PoolPhase::Running,
            workers: slots.iter().map(Slot::status).collect(),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shutdown_started = Arc::new(AtomicBool::new(false));

        let monitor = Monitor::new(
            slots,
            spawner,
            MonitorSettings {
                policy: RestartPolicy::from_config(&config.supervisor),
                worker_timeout: config.supervisor.worker_timeout(),
                graceful_timeout: config.supervisor.graceful_timeout(),
            },
            MonitorChannels {
                events: events_rx,
                commands: commands_rx,
                status: status_tx,
                shutdown_started: Arc::clone(&shutdown_started),
            },
            socket,
        );
        let task = tokio::spawn(monitor.run());

        Ok(RunningPool {
            local_addr,
            handle: PoolHandle {
                commands: commands_tx,
                status: status_rx,
                shutdown_started,
            },
            task,
        })
    }
}

/// Cloneable control of a running pool
#[derive(Debug, Clone)]
pub struct PoolHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PoolStatus>,
    shutdown_started: Arc<AtomicBool>,
}

impl PoolHandle {
    /// Drain the pool: workers stop accepting, get `grace` to finish their
    /// connections and are killed afterwards.
    ///
    /// Every caller returns once the pool has stopped. Only the call that
    /// started the drain returns `true`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let initiated = self
            .shutdown_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if initiated && self.commands.send(Command::Shutdown { grace }).is_err() {
            tracing::debug!("monitor already finished");
        }

        let mut status = self.status.clone();
        // Err: the monitor is gone, so the pool is stopped too
        let _ = status.wait_for(|s| s.phase == PoolPhase::Stopped).await;
        initiated
    }

    /// Rolling restart of every worker, one slot at a time.
    pub fn reload(&self) {
        if self.commands.send(Command::Reload).is_err() {
            tracing::debug!("reload ignored, monitor already finished");
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolStatus> {
        self.status.clone()
    }
}

/// A started pool
pub struct RunningPool {
    local_addr: SocketAddr,
    handle: PoolHandle,
    task: JoinHandle<Result<PoolReport, SupervisorError>>,
}

impl RunningPool {
    /// The bound address, with an ephemeral port resolved
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> PoolStatus {
        self.handle.status()
    }

    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.handle.shutdown(grace).await
    }

    /// Wait for the pool to stop.
    ///
    /// Fails with `SupervisorError::CrashLoop` when a slot exhausted its
    /// crash budget; the rest of the pool has been drained by then.
    pub async fn monitor(self) -> Result<PoolReport, SupervisorError> {
        let Self { handle, task, .. } = self;
        let result = task
            .await
            .map_err(|e| SupervisorError::Monitor(e.to_string()))?;
        drop(handle);
        result
    }
}
