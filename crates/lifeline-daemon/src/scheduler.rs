//! Adaptive polling interval and time-of-day gating.

use std::time::Duration;

use chrono::NaiveTime;
use lifeline_config::DaemonConfiguration;

/// Factor applied by [`IntervalScheduler::slow_down`].
pub const BACKOFF_FACTOR: f64 = 1.3;

/// Adaptive polling interval.
///
/// `current` starts at the base interval, grows by [`BACKOFF_FACTOR`] on each
/// slow down, never exceeds `max`, and snaps back to the base on speed up.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalScheduler {
    base: f64,
    current: f64,
    max: f64,
}

impl IntervalScheduler {
    /// Build a scheduler. A `max` below `base` is raised to `base`.
    pub fn new(base: f64, max: f64) -> Self {
        let max = if max < base { base } else { max };
        Self {
            base,
            current: base,
            max,
        }
    }

    /// Scheduler for an effective daemon configuration.
    pub fn from_configuration(config: &DaemonConfiguration) -> Self {
        Self::new(config.base_interval(), config.effective_max_interval())
    }

    /// Widen the interval: `current = min(current * 1.3, max)`.
    pub fn slow_down(&mut self) {
        self.current = (self.current * BACKOFF_FACTOR).min(self.max);
    }

    /// Reset the interval to the configured base.
    pub fn speed_up(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    /// Whole seconds to sleep at the end of a tick, `floor(current)`.
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.current.floor().max(0.0) as u64)
    }
}

/// A permitted time-of-day range, bounds exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub begin: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(begin: NaiveTime, end: NaiveTime) -> Self {
        Self { begin, end }
    }

    /// Window configured by `runStart`/`runEnd`, if both are set and valid.
    pub fn from_configuration(config: &DaemonConfiguration) -> Option<Self> {
        config
            .window_bounds()
            .ok()
            .flatten()
            .map(|(begin, end)| Self::new(begin, end))
    }

    /// Whether the window wraps past midnight.
    pub fn crosses_midnight(&self) -> bool {
        self.end < self.begin
    }

    /// Strict containment. An end before the begin continues into the next day.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.crosses_midnight() {
            now > self.begin || now < self.end
        } else {
            self.begin < now && now < self.end
        }
    }
}

/// True when no window is configured, otherwise [`TimeWindow::contains`].
pub fn is_in_window(window: Option<&TimeWindow>, now: NaiveTime) -> bool {
    window.is_none_or(|window| window.contains(now))
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
