//! Streaming baseline learner
//!
//! Computes mean and variance in a single pass using Welford's online
//! algorithm, so memory stays constant regardless of the learning window.
//! Window progress is measured on snapshot timestamps, not wall-clock time.

use super::{Baseline, BaselineState};
use crate::error::BaselineError;
use crate::models::Snapshot;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Learns a [`Baseline`] from a stream of snapshots
#[derive(Debug, Clone)]
pub struct BaselineLearner {
    metric: String,
    window: Duration,
    min_samples: u64,
    extensions: u32,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    count: u64,
    mean: f64,
    /// Sum of squared differences from the running mean
    m2: f64,
    min: f64,
    max: f64,
}

impl BaselineLearner {
    pub fn new(metric: impl Into<String>, window: Duration, min_samples: u64) -> Self {
        Self {
            metric: metric.into(),
            window,
            min_samples: min_samples.max(1),
            extensions: 0,
            first_seen: None,
            last_seen: None,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Feed one snapshot into the running statistics
    pub fn observe(&mut self, snapshot: &Snapshot) {
        self.observe_value(snapshot.timestamp, snapshot.primary_value());
    }

    pub fn observe_value(&mut self, timestamp: DateTime<Utc>, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.first_seen.get_or_insert(timestamp);
        self.last_seen = Some(match self.last_seen {
            Some(last) if last > timestamp => last,
            _ => timestamp,
        });

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation of the samples seen so far
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }

    pub fn extensions(&self) -> u32 {
        self.extensions
    }

    /// Whether the (possibly extended) learning window has elapsed
    pub fn window_elapsed(&self) -> bool {
        let (Some(first), Some(last)) = (self.first_seen, self.last_seen) else {
            return false;
        };
        let required = self.window.saturating_mul(self.extensions + 1);
        (last - first).to_std().unwrap_or_default() >= required
    }

    /// Window elapsed and enough samples collected
    pub fn is_ready(&self) -> bool {
        self.window_elapsed() && self.count >= self.min_samples
    }

    /// Grant another learning window after an insufficient one
    pub fn extend(&mut self) {
        self.extensions += 1;
    }

    /// Produce a frozen baseline, failing when too few samples were seen
    pub fn finalize(&self) -> Result<Baseline, BaselineError> {
        if self.count < self.min_samples {
            return Err(BaselineError::InsufficientData {
                needed: self.min_samples,
                have: self.count,
            });
        }
        Ok(self.build(false))
    }

    /// Produce a baseline flagged as degraded from whatever was collected
    ///
    /// Returns `None` when nothing at all was observed.
    pub fn finalize_degraded(&self) -> Option<Baseline> {
        if self.count == 0 {
            return None;
        }
        Some(self.build(self.count < self.min_samples))
    }

    fn build(&self, degraded: bool) -> Baseline {
        let now = Utc::now();
        Baseline {
            metric: self.metric.clone(),
            mean: self.mean,
            spread: self.std_dev(),
            min: self.min,
            max: self.max,
            sample_count: self.count,
            window_start: self.first_seen.unwrap_or(now),
            window_end: self.last_seen.unwrap_or(now),
            state: BaselineState::Ready,
            degraded,
        }
    }
}
