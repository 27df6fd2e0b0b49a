//! Sliding-window request budget shared by every fetch.
//!
//! Timestamps come from the caller (the tick's `now`) rather than a
//! wall clock, so ticks can be replayed deterministically in tests.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateBudget {
    capacity: usize,
    window: chrono::Duration,
    issued: VecDeque<DateTime<Utc>>,
}

impl RateBudget {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            issued: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.issued.front() {
            if now - *front >= self.window {
                self.issued.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests still allowed in the window ending at `now`.
    pub fn remaining(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.capacity.saturating_sub(self.issued.len())
    }

    /// Take one request slot if one is free.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if self.remaining(now) == 0 {
            return false;
        }
        self.issued.push_back(now);
        true
    }
}
