// Supervisor monitor loop
// Sole owner of the slots: reacts to worker events, restarts, health checks,
// rolling reloads and the final drain

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::backoff::{RestartPolicy, Verdict};
use super::slot::{ExitKind, Slot, WorkerState};
use super::spawn::{Event, Spawner};
use super::{PoolPhase, PoolReport, PoolStatus};
use crate::error::SupervisorError;
use crate::server::{ControlMessage, ExitReason, SharedSocket};

/// Cadence of restart, health and reload checks
const TICK: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub(crate) enum Command {
    Shutdown { grace: Duration },
    Reload,
}

#[derive(Debug, Clone)]
pub(crate) struct MonitorSettings {
    pub policy: RestartPolicy,
    pub worker_timeout: Option<Duration>,
    pub graceful_timeout: Duration,
}

/// Slots still to be replaced by a rolling reload
#[derive(Debug)]
struct RollingReload {
    pending: VecDeque<usize>,
    /// Slot being replaced and the generation that was asked to stop
    current: Option<(usize, u64)>,
}

pub(crate) struct Monitor {
    slots: Vec<Slot>,
    spawner: Spawner,
    settings: MonitorSettings,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<PoolStatus>,
    shutdown_started: Arc<AtomicBool>,
    reload: Option<RollingReload>,
    draining: bool,
    failure: Option<SupervisorError>,
    forced_kills: usize,
    // Keeps the address reserved until every worker is gone
    _socket: SharedSocket,
}

pub(crate) struct MonitorChannels {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub status: watch::Sender<PoolStatus>,
    pub shutdown_started: Arc<AtomicBool>,
}

impl Monitor {
    pub fn new(
        slots: Vec<Slot>,
        spawner: Spawner,
        settings: MonitorSettings,
        channels: MonitorChannels,
        socket: SharedSocket,
    ) -> Self {
        Self {
            slots,
            spawner,
            settings,
            events: channels.events,
            commands: channels.commands,
            status: channels.status,
            shutdown_started: channels.shutdown_started,
            reload: None,
            draining: false,
            failure: None,
            forced_kills: 0,
            _socket: socket,
        }
    }

    /// Supervise until shutdown is requested or the crash-loop budget runs
    /// out, then drain the pool.
    pub async fn run(mut self) -> Result<PoolReport, SupervisorError> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let grace = loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event),

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { grace }) => break grace,
                    Some(Command::Reload) => self.start_reload(),
                    None => {
                        tracing::info!("every pool handle dropped, shutting down");
                        self.shutdown_started.store(true, Ordering::SeqCst);
                        break self.settings.graceful_timeout;
                    }
                },

                _ = tick.tick() => self.on_tick(Instant::now()),
            }

            if self.failure.is_some() {
                self.shutdown_started.store(true, Ordering::SeqCst);
                break self.settings.graceful_timeout;
            }
            self.publish(PoolPhase::Running);
        };

        self.drain(grace).await;

        let report = PoolReport {
            workers: self.slots.iter().map(Slot::status).collect(),
            forced_kills: self.forced_kills,
        };
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn handle_event(&mut self, event: Event) {
        let now = Instant::now();
        match event {
            Event::Message {
                slot,
                generation,
                message,
            } => {
                let Some(current) = self.current(slot, generation) else {
                    return;
                };
                match message {
                    ControlMessage::Ready { pid } => {
                        current.on_ready(pid, now);
                        tracing::info!(worker = slot, generation, "worker ready (pid {pid})");
                    }
                    ControlMessage::Heartbeat { served, active } => {
                        current.on_heartbeat(served, active, now);
                    }
                    ControlMessage::Exiting { reason } => {
                        let recycling = reason == ExitReason::MaxRequests;
                        current.on_exiting(recycling);
                        if recycling {
                            tracing::info!(worker = slot, generation, "worker reached max requests, recycling");
                        }
                    }
                }
            }
            Event::Exited {
                slot,
                generation,
                status,
            } => {
                let draining = self.draining;
                let Some(current) = self.current(slot, generation) else {
                    return;
                };
                let kind = current.on_exit(status);
                let status = status.map_or_else(|| "status unknown".to_string(), |s| s.to_string());

                match kind {
                    ExitKind::Clean => {
                        tracing::info!(worker = slot, generation, "worker exited ({status})");
                        if !draining {
                            current.restart_at = Some(now);
                        }
                    }
                    ExitKind::Crash => {
                        tracing::warn!(worker = slot, generation, "worker crashed ({status})");
                        if draining {
                            current.retire();
                        } else {
                            self.after_crash(slot, now);
                        }
                    }
                }
            }
        }
    }

    /// The slot, if `generation` is still the one occupying it
    fn current(&mut self, slot: usize, generation: u64) -> Option<&mut Slot> {
        match self.slots.get_mut(slot) {
            Some(current) if current.generation == generation => Some(current),
            _ => {
                tracing::trace!(worker = slot, generation, "ignoring event from a previous generation");
                None
            }
        }
    }

    fn after_crash(&mut self, index: usize, now: Instant) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        match self.settings.policy.on_crash(&mut slot.history, now) {
            Verdict::RestartAfter(delay) => {
                tracing::info!(
                    worker = index,
                    "restarting in {delay:?} ({} recent crashes)",
                    slot.history.len()
                );
                slot.restart_at = Some(now + delay);
            }
            Verdict::GiveUp { crashes } => {
                let window = self.settings.policy.crash_window;
                tracing::error!(
                    worker = index,
                    "worker crashed {crashes} times within {window:?}, giving up on the pool"
                );
                slot.restart_at = None;
                if self.failure.is_none() {
                    self.failure = Some(SupervisorError::CrashLoop {
                        slot: index,
                        crashes,
                        window,
                    });
                }
            }
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let worker_timeout = self.settings.worker_timeout;
        for slot in &mut self.slots {
            slot.check_deadlines(now, worker_timeout);
        }

        let due: Vec<usize> = self
            .slots
            .iter()
            .filter(|slot| slot.restart_at.is_some_and(|at| at <= now))
            .map(|slot| slot.index)
            .collect();
        for index in due {
            self.restart(index, now);
        }

        self.advance_reload(now);
    }

    fn restart(&mut self, index: usize, now: Instant) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let generation = slot.generation + 1;

        match self.spawner.spawn(index, generation) {
            Ok(child) => {
                slot.respawned(generation, child, now);
                tracing::info!(
                    worker = index,
                    generation,
                    "worker restarted (restart #{}, pid {:?})",
                    slot.restarts,
                    slot.pid()
                );
            }
            Err(e) => {
                tracing::error!(worker = index, "failed to restart worker: {e}");
                slot.on_spawn_failure();
                self.after_crash(index, now);
            }
        }
    }

    fn start_reload(&mut self) {
        if self.reload.is_some() {
            tracing::warn!("rolling restart already in progress, ignoring reload");
            return;
        }
        tracing::info!("rolling restart of {} workers", self.slots.len());
        self.reload = Some(RollingReload {
            pending: (0..self.slots.len()).collect(),
            current: None,
        });
    }

    /// Stop one slot at a time; the next goes once the previous
    /// replacement is running.
    fn advance_reload(&mut self, now: Instant) {
        let Some(reload) = &mut self.reload else {
            return;
        };

        if let Some((index, generation)) = reload.current {
            match self.slots.get(index) {
                Some(slot) if slot.generation > generation && slot.state == WorkerState::Running => {
                    reload.current = None;
                }
                Some(_) => return,
                None => reload.current = None,
            }
        }

        while let Some(index) = reload.pending.pop_front() {
            let Some(slot) = self.slots.get_mut(index) else {
                continue;
            };
            // Already on its way out; its replacement is fresh anyway
            if !slot.state.is_alive() || slot.stopping() {
                continue;
            }
            tracing::info!(worker = index, generation = slot.generation, "reloading worker");
            slot.request_stop(Some(now + self.settings.graceful_timeout));
            reload.current = Some((index, slot.generation));
            return;
        }

        tracing::info!("rolling restart complete");
        self.reload = None;
    }

    /// Stop every worker, killing whatever is left after `grace`.
    async fn drain(&mut self, grace: Duration) {
        self.draining = true;
        self.reload = None;

        for slot in &mut self.slots {
            slot.retire();
            slot.request_stop(None);
        }
        let alive = self.alive();
        tracing::info!("draining {alive} workers, grace period {grace:?}");
        self.publish(PoolPhase::Draining);

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        let mut killed = false;

        while self.alive() > 0 {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                        self.publish(PoolPhase::Draining);
                    }
                    None => break,
                },

                () = &mut deadline, if !killed => {
                    killed = true;
                    for slot in &mut self.slots {
                        if slot.state.is_alive() {
                            self.forced_kills += 1;
                            slot.force_kill();
                        }
                    }
                    tracing::warn!(
                        "grace period of {grace:?} expired, killed {} workers",
                        self.forced_kills
                    );
                }
            }
        }

        self.publish(PoolPhase::Stopped);
        tracing::info!("all workers stopped");
    }

    fn alive(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.is_alive()).count()
    }

    fn publish(&self, phase: PoolPhase) {
        let next = PoolStatus {
            phase,
            workers: self.slots.iter().map(Slot::status).collect(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
