//! Per-(rule, key) sliding window state

use std::collections::VecDeque;

/// Limits applied to a window, in milliseconds of event time
#[derive(Debug, Clone, Copy)]
pub struct WindowLimits {
    pub threshold: usize,
    pub window_ms: i64,
    pub cooldown_ms: i64,
    /// How far behind the newest entry a timestamp may be inserted
    pub tolerance_ms: i64,
}

/// Result of recording one matching event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The event arrived too far out of order and was not counted
    Late,
    Counted { count: usize, fired: bool },
}

/// Sliding window of matching-event timestamps for one (rule, key) pair.
///
/// Timestamps are kept sorted ascending and never older than the window
/// relative to the newest entry. A pair that fired is re-armed either when
/// the cooldown has elapsed or when the count is seen below threshold.
#[derive(Debug, Clone)]
pub struct WindowState {
    timestamps: VecDeque<i64>,
    last_fired_at: Option<i64>,
    armed: bool,
}

impl WindowState {
    pub fn new() -> Self {
        WindowState {
            timestamps: VecDeque::new(),
            last_fired_at: None,
            armed: true,
        }
    }

    /// Insert a timestamp in order, prune, and decide whether the rule fires
    pub fn observe(&mut self, timestamp: i64, limits: &WindowLimits) -> Observation {
        if let Some(&newest) = self.timestamps.back() {
            if timestamp < newest - limits.tolerance_ms {
                return Observation::Late;
            }
        }

        let position = self.timestamps.partition_point(|&t| t <= timestamp);
        self.timestamps.insert(position, timestamp);
        self.prune(limits.window_ms);

        let count = self.timestamps.len();
        let fired = self.check_fire(count, limits);
        Observation::Counted { count, fired }
    }

    fn prune(&mut self, window_ms: i64) {
        let Some(&newest) = self.timestamps.back() else {
            return;
        };
        let cutoff = newest - window_ms;
        while self.timestamps.front().map_or(false, |&t| t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn check_fire(&mut self, count: usize, limits: &WindowLimits) -> bool {
        if count < limits.threshold {
            self.armed = true;
            return false;
        }

        let now = self.newest().unwrap_or_default();
        let cooled_down = match self.last_fired_at {
            None => true,
            Some(fired_at) => now - fired_at >= limits.cooldown_ms,
        };

        if self.armed || cooled_down {
            self.armed = false;
            self.last_fired_at = Some(now);
            true
        } else {
            false
        }
    }

    pub fn newest(&self) -> Option<i64> {
        self.timestamps.back().copied()
    }

    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn last_fired_at(&self) -> Option<i64> {
        self.last_fired_at
    }

    pub fn timestamps(&self) -> impl Iterator<Item = &i64> {
        self.timestamps.iter()
    }

    /// True when nothing happened on this pair for at least `idle_ms`
    pub fn is_idle(&self, now: i64, idle_ms: i64) -> bool {
        let last_activity = self.newest().max(self.last_fired_at).unwrap_or(i64::MIN);
        now.saturating_sub(last_activity) >= idle_ms
    }
}

impl Default for WindowState {
    fn default() -> Self {
        Self::new()
    }
}
