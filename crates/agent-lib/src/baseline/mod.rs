//! Baseline learning
//!
//! A baseline describes what "normal" looks like for one metric on this
//! host. It is learned once over a learning window and then frozen.

mod learner;

pub use learner::BaselineLearner;

use crate::models::BaselineRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineState {
    Learning,
    Ready,
}

/// Learned statistical description of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub metric: String,
    pub mean: f64,
    /// Standard deviation of the learning window
    pub spread: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub state: BaselineState,
    /// Finalized with fewer samples than required
    pub degraded: bool,
}

impl Baseline {
    /// Baseline for metrics where absence is normal: expected value zero,
    /// no spread, usable immediately
    pub fn absence(metric: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            mean: 0.0,
            spread: 0.0,
            min: 0.0,
            max: 0.0,
            sample_count: 0,
            window_start: at,
            window_end: at,
            state: BaselineState::Ready,
            degraded: false,
        }
    }

    /// Baseline with a known mean and spread, for pre-seeded watchers
    pub fn fixed(metric: impl Into<String>, mean: f64, spread: f64, at: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            mean,
            spread,
            min: mean - spread,
            max: mean + spread,
            sample_count: 0,
            window_start: at,
            window_end: at,
            state: BaselineState::Ready,
            degraded: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == BaselineState::Ready
    }

    /// Expected range at `sigma` spread-units around the mean
    pub fn range(&self, sigma: f64) -> BaselineRange {
        BaselineRange {
            mean: self.mean,
            spread: self.spread,
            low: self.mean - sigma * self.spread,
            high: self.mean + sigma * self.spread,
        }
    }
}
