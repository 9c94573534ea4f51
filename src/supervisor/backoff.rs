// Restart policy
// Exponential backoff between crash restarts and the crash-loop budget

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::SupervisorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Crashes within `crash_window` that end the pool, 0 never gives up
    pub crash_limit: usize,
    pub crash_window: Duration,
}

/// What to do with a slot after a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    RestartAfter(Duration),
    GiveUp { crashes: usize },
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.restart_backoff_ms),
            max_backoff: Duration::from_millis(config.restart_backoff_max_ms),
            crash_limit: usize::try_from(config.crash_loop_limit).unwrap_or(usize::MAX),
            crash_window: Duration::from_secs(config.crash_loop_window),
        }
    }

    /// Delay before the restart following the `crashes`-th recent crash:
    /// `initial * 2^(crashes - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, crashes: usize) -> Duration {
        let exponent = u32::try_from(crashes.saturating_sub(1)).unwrap_or(u32::MAX).min(31);
        self.initial_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }

    /// Record a crash at `now` and decide whether the slot may restart.
    pub fn on_crash(&self, history: &mut CrashHistory, now: Instant) -> Verdict {
        let crashes = history.record(now, self.crash_window);
        if self.crash_limit > 0 && crashes >= self.crash_limit {
            Verdict::GiveUp { crashes }
        } else {
            Verdict::RestartAfter(self.backoff(crashes))
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

/// Timestamps of a slot's recent crashes
#[derive(Debug, Clone, Default)]
pub struct CrashHistory {
    recent: VecDeque<Instant>,
}

impl CrashHistory {
    /// Add a crash and return how many fall within `window` of `now`.
    pub fn record(&mut self, now: Instant, window: Duration) -> usize {
        self.recent.push_back(now);
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.len()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
