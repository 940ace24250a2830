//! Restart bookkeeping: the rolling restart window, the consecutive-attempt
//! ceiling and the backoff delay.
//!
//! The policy is plain state. The supervisor asks it questions and schedules the
//! timers itself:
//! - [`RestartPolicy::open_window`] / [`RestartPolicy::close_window`] bracket the
//!   `max_wait_time_interval` window; [`RestartPolicy::record_start`] counts launches in it;
//! - [`RestartPolicy::window_exhausted`] is the "too many restarts in window" check
//!   made when a child is found dead;
//! - [`RestartPolicy::next_attempt`] runs when the restart timer fires: it grows the
//!   delay, counts the attempt and refuses once `max_retries` is exceeded;
//! - [`RestartPolicy::reset`] runs once a launched child is known to be alive.
//!
//! # Backoff
//! After every restart the delay grows by `grow` as a fraction of itself:
//! `wait ← wait × (1 + grow)`. With `wait = 1s, grow = 0.25` the schedule is
//! 1s, 1.25s, 1.5625s, ... `grow = 0` keeps the delay constant.
//!
//! A child that gets a pid counts as alive, and [`RestartPolicy::reset`] runs
//! `reset_after` seconds after the spawn. With the default `reset_after = 0`
//! that happens at once, so a script that spawns fine and then crashes never
//! grows its backoff or reaches `max_retries`; only the restart window stops
//! it. Set `reset_after > 0` for backoff and retries to apply to crash loops.

use std::time::Duration;

use tokio::time::Instant;

use crate::parse::{duration_secs, SupervisorConfig};

/// Which budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartLimit {
    /// `max_restarts` launches inside one `max_wait_time_interval` window.
    Window,
    /// More than `max_retries` consecutive restart attempts.
    Retries,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_wait_time_interval: Duration,
    max_restarts: u32,
    max_retries: Option<u32>,
    base_wait: Duration,
    grow: f64,

    wait: Duration,
    starts: u32,
    attempts: u32,
    start_time: Option<Instant>,
}

impl RestartPolicy {
    pub fn new(
        max_wait_time_interval: Duration,
        max_restarts: u32,
        max_retries: Option<u32>,
        base_wait: Duration,
        grow: f64,
    ) -> Self {
        Self {
            max_wait_time_interval,
            max_restarts,
            max_retries,
            base_wait,
            grow: grow.max(0.0),
            wait: base_wait,
            starts: 0,
            attempts: 0,
            start_time: None,
        }
    }

    pub fn from_config(cfg: &SupervisorConfig) -> Self {
        Self::new(
            duration_secs(cfg.max_wait_time_interval),
            u32::try_from(cfg.max_restarts).unwrap_or(u32::MAX),
            cfg.max_retries(),
            duration_secs(cfg.wait),
            cfg.grow,
        )
    }

    /// Opens a window at `now` unless one is already open.
    ///
    /// Returns how long the caller should wait before calling
    /// [`RestartPolicy::close_window`], or `None` if a window was already open.
    pub fn open_window(&mut self, now: Instant) -> Option<Duration> {
        if self.start_time.is_some() {
            return None;
        }
        self.start_time = Some(now);
        Some(self.max_wait_time_interval.saturating_add(Duration::from_millis(1)))
    }

    pub fn close_window(&mut self) {
        self.start_time = None;
        self.starts = 0;
    }

    pub fn record_start(&mut self) {
        self.starts = self.starts.saturating_add(1);
    }

    /// True when `max_restarts` launches happened and the window they belong to
    /// has not yet elapsed at `now`.
    pub fn window_exhausted(&self, now: Instant) -> bool {
        let Some(start_time) = self.start_time else {
            return false;
        };
        self.starts >= self.max_restarts
            && now.saturating_duration_since(start_time) <= self.max_wait_time_interval
    }

    /// Bookkeeping done when the restart timer fires.
    pub fn next_attempt(&mut self) -> Result<(), RestartLimit> {
        self.wait = Duration::try_from_secs_f64(self.wait.as_secs_f64() * (1.0 + self.grow))
            .unwrap_or(Duration::MAX);
        self.attempts = self.attempts.saturating_add(1);
        match self.max_retries {
            Some(max) if self.attempts > max => Err(RestartLimit::Retries),
            _ => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.wait = self.base_wait;
    }

    /// Delay before the next restart.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn starts(&self) -> u32 {
        self.starts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }
}
