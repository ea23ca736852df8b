//! Sliding-window rate limiter for analysis dispatch

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max: usize,
    granted: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            granted: VecDeque::with_capacity(max),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(first) = self.granted.front() {
            if now.saturating_duration_since(*first) >= self.window {
                self.granted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take one slot if the window has room
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.granted.len() >= self.max {
            return false;
        }
        self.granted.push_back(now);
        true
    }

    pub fn remaining(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.max.saturating_sub(self.granted.len())
    }
}
