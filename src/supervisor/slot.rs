// Worker slots
// The supervisor's record of one worker position across restarts

use std::fmt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use super::backoff::CrashHistory;
use super::spawn::ChildControl;

/// Liveness state of a slot.
///
/// `Starting -> Running -> Exiting -> Dead`, with `Crashed` instead of
/// `Dead` for an exit the supervisor did not ask for. A `Crashed` slot
/// waits out its backoff before starting again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Exiting,
    Crashed,
    Dead,
}

impl WorkerState {
    /// A process exists for this slot
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Exiting)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exiting => "exiting",
            Self::Crashed => "crashed",
            Self::Dead => "dead",
        })
    }
}

/// Snapshot of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub slot: usize,
    pub generation: u64,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub restarts: u32,
    /// Crashes over the lifetime of the pool
    pub crashes: u32,
    /// Requests served by every generation of this slot
    pub served: u64,
    /// Open connections, as of the last heartbeat
    pub active: usize,
}

/// How a process left its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitKind {
    /// Asked to stop, or recycled itself
    Clean,
    Crash,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub index: usize,
    pub generation: u64,
    pub state: WorkerState,
    pub restarts: u32,
    pub crashes: u32,
    pub history: CrashHistory,
    /// When a replacement may be spawned
    pub restart_at: Option<Instant>,
    child: Option<ChildControl>,
    pid: Option<u32>,
    started_at: Instant,
    last_heartbeat: Option<Instant>,
    ready: bool,
    stop_requested: bool,
    stop_deadline: Option<Instant>,
    recycling: bool,
    timed_out: bool,
    served: u64,
    served_before: u64,
    active: usize,
}

impl Slot {
    pub fn new(index: usize, child: ChildControl, now: Instant) -> Self {
        Self {
            index,
            generation: 1,
            state: WorkerState::Starting,
            restarts: 0,
            crashes: 0,
            history: CrashHistory::default(),
            restart_at: None,
            pid: child.pid,
            child: Some(child),
            started_at: now,
            last_heartbeat: None,
            ready: false,
            stop_requested: false,
            stop_deadline: None,
            recycling: false,
            timed_out: false,
            served: 0,
            served_before: 0,
            active: 0,
        }
    }

    /// Install the next generation after a restart.
    pub fn respawned(&mut self, generation: u64, child: ChildControl, now: Instant) {
        self.generation = generation;
        self.state = WorkerState::Starting;
        self.restarts += 1;
        self.restart_at = None;
        self.pid = child.pid;
        self.child = Some(child);
        self.started_at = now;
        self.last_heartbeat = None;
        self.ready = false;
        self.stop_requested = false;
        self.stop_deadline = None;
        self.recycling = false;
        self.timed_out = false;
        self.served = 0;
        self.active = 0;
    }

    pub fn on_ready(&mut self, pid: u32, now: Instant) {
        self.pid = Some(pid);
        self.ready = true;
        self.last_heartbeat = Some(now);
        if self.state == WorkerState::Starting {
            self.state = WorkerState::Running;
        }
    }

    pub fn on_heartbeat(&mut self, served: u64, active: usize, now: Instant) {
        self.last_heartbeat = Some(now);
        self.served = served;
        self.active = active;
    }

    /// The worker announced it stopped accepting.
    pub fn on_exiting(&mut self, recycling: bool) {
        self.recycling |= recycling;
        if self.state.is_alive() {
            self.state = WorkerState::Exiting;
        }
    }

    /// Record the process exit and classify it.
    ///
    /// A crash is an exit the supervisor did not request with a failure
    /// status, before becoming ready, or after missing heartbeats.
    pub fn on_exit(&mut self, status: Option<ExitStatus>) -> ExitKind {
        self.child = None;
        self.served_before += self.served;
        self.served = 0;
        self.active = 0;

        let requested = self.stop_requested || self.recycling;
        let failed = !status.is_some_and(|s| s.success());
        let kind = if !requested && (failed || !self.ready || self.timed_out) {
            self.crashes += 1;
            WorkerState::Crashed
        } else {
            WorkerState::Dead
        };
        self.state = kind;
        if kind == WorkerState::Crashed {
            ExitKind::Crash
        } else {
            ExitKind::Clean
        }
    }

    /// Launching the next generation failed; counts as a crash.
    pub fn on_spawn_failure(&mut self) {
        self.child = None;
        self.pid = None;
        self.restart_at = None;
        self.crashes += 1;
        self.state = WorkerState::Crashed;
    }

    /// Close the worker's stdin so it drains, killing it at `deadline`.
    pub fn request_stop(&mut self, deadline: Option<Instant>) {
        if !self.state.is_alive() {
            return;
        }
        self.stop_requested = true;
        self.stop_deadline = deadline;
        if let Some(child) = &mut self.child {
            child.close_stdin();
        }
    }

    /// The pool is stopping: a crashed slot waiting out its backoff will
    /// not be restarted.
    pub fn retire(&mut self) {
        self.restart_at = None;
        if self.state == WorkerState::Crashed {
            self.state = WorkerState::Dead;
        }
    }

    pub fn force_kill(&mut self) {
        if let Some(child) = &mut self.child {
            child.kill();
        }
    }

    /// Kill the worker if it missed its boot or heartbeat deadline, or did
    /// not finish draining in time. Returns whether it was killed.
    pub fn check_deadlines(&mut self, now: Instant, worker_timeout: Option<Duration>) -> bool {
        if !self.state.is_alive() || self.timed_out {
            return false;
        }

        if self.stop_requested {
            if self.stop_deadline.is_some_and(|deadline| now >= deadline) {
                tracing::warn!(worker = self.index, "worker did not drain in time, killing it");
                self.stop_deadline = None;
                self.force_kill();
                return true;
            }
            return false;
        }

        let Some(timeout) = worker_timeout else {
            return false;
        };
        let since = self.last_heartbeat.unwrap_or(self.started_at);
        if now.duration_since(since) <= timeout {
            return false;
        }

        if self.ready {
            tracing::error!(
                worker = self.index,
                "no heartbeat for {:?} (pid {:?}), killing worker",
                now.duration_since(since),
                self.pid
            );
        } else {
            tracing::error!(
                worker = self.index,
                "worker did not become ready within {timeout:?}, killing it"
            );
        }
        self.timed_out = true;
        self.force_kill();
        true
    }

    /// Supervisor-initiated stop of this generation is in progress
    pub const fn stopping(&self) -> bool {
        self.stop_requested
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub const fn status(&self) -> WorkerStatus {
        WorkerStatus {
            slot: self.index,
            generation: self.generation,
            pid: self.pid,
            state: self.state,
            restarts: self.restarts,
            crashes: self.crashes,
            served: self.served_before + self.served,
            active: self.active,
        }
    }
}
