//! Memory leak detection
//!
//! Detects memory leaks by calculating linear regression slope over recent
//! used-memory samples and requiring a near-monotonic growth pattern.
//! `observed` stays in memory percent like the baseline; the growth rate
//! travels in the event details.

use super::{AnomalyClassification, Detector};
use crate::baseline::Baseline;
use crate::config::LeakPolicy;
use crate::models::{AnomalyCategory, EventDetails, MetricValues, Severity, Snapshot};
use std::collections::VecDeque;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Detects sustained memory growth on the memory watcher
pub struct LeakDetector {
    policy: LeakPolicy,
    /// (seconds since first sample, used bytes), oldest first
    samples: VecDeque<(f64, f64)>,
    origin: Option<chrono::DateTime<chrono::Utc>>,
}

impl LeakDetector {
    pub fn new(policy: LeakPolicy) -> Self {
        Self {
            samples: VecDeque::with_capacity(policy.history),
            policy,
            origin: None,
        }
    }

    fn record(&mut self, snapshot: &Snapshot, used_bytes: u64) {
        let origin = *self.origin.get_or_insert(snapshot.timestamp);
        let t = (snapshot.timestamp - origin).num_milliseconds() as f64 / 1000.0;

        while self.samples.len() >= self.policy.history.max(2) {
            self.samples.pop_front();
        }
        self.samples.push_back((t, used_bytes as f64));
    }

    /// Linear regression slope in bytes per second
    fn linear_regression_slope(&self) -> f64 {
        let n = self.samples.len() as f64;
        if n < 2.0 {
            return 0.0;
        }

        // Normalize timestamps to avoid precision issues
        let t0 = self.samples.front().map(|(t, _)| *t).unwrap_or(0.0);

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xy = 0.0;
        let mut sum_xx = 0.0;

        for (t, y) in &self.samples {
            let x = t - t0;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_xx += x * x;
        }

        let denominator = n * sum_xx - sum_x * sum_x;
        if denominator.abs() < f64::EPSILON {
            return 0.0;
        }

        (n * sum_xy - sum_x * sum_y) / denominator
    }

    /// Fraction of consecutive sample pairs where memory did not decrease
    fn monotonicity(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        let non_decreasing = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter(|(a, b)| b.1 >= a.1)
            .count();

        non_decreasing as f64 / (self.samples.len() - 1) as f64
    }

    /// Coarse growth-rate band: doubling buckets of MB/min
    fn rate_bucket(mb_per_min: f64) -> i64 {
        mb_per_min.max(1.0).log2().floor() as i64
    }
}

impl Detector for LeakDetector {
    fn classify(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Option<AnomalyClassification> {
        let MetricValues::Memory { used_bytes, .. } = snapshot.values else {
            return None;
        };
        if !self.policy.enabled {
            return None;
        }

        self.record(snapshot, used_bytes);

        if !baseline.is_ready() || self.samples.len() < self.policy.min_samples {
            return None;
        }

        let slope = self.linear_regression_slope();
        if slope <= self.policy.slope_threshold {
            return None;
        }
        if self.monotonicity() < self.policy.monotonicity {
            return None;
        }

        let mb_per_min = slope * 60.0 / BYTES_PER_MB;
        let culprit = snapshot
            .top_processes
            .iter()
            .max_by_key(|p| p.rss_bytes)
            .cloned();
        let mut description = format!(
            "Memory leak: growing at {:.1} MB/min ({:.0} MB used)",
            mb_per_min,
            used_bytes as f64 / BYTES_PER_MB
        );
        if let Some(process) = &culprit {
            description.push_str(&format!(" - {} (PID {})", process.name, process.pid));
        }

        Some(AnomalyClassification {
            category: AnomalyCategory::MemoryLeak,
            severity: Severity::Warning,
            observed: snapshot.primary_value(),
            subject: None,
            bucket: Self::rate_bucket(mb_per_min),
            description,
            details: EventDetails {
                culprit,
                top_processes: snapshot.top_processes.clone(),
                growth_bytes_per_sec: Some(slope),
                ..Default::default()
            },
        })
    }
}
