//! Anomaly detection against learned baselines
//!
//! This module provides detection for:
//! - Threshold deviation (CPU, memory, load) in spread-units above the mean
//! - Absolute ceilings that override statistical classification
//! - Memory leaks (sustained, near-monotonic growth)
//! - Zombie processes (any presence is anomalous)
//! - Process exits, restarts and crash loops per process name
//! - New high-resource processes

mod crash_loop;
mod fingerprint;
mod leak_detector;
mod new_process;
mod threshold;
mod zombie;

pub use crash_loop::CrashLoopDetector;
pub use fingerprint::{fingerprint, value_bucket};
pub use leak_detector::LeakDetector;
pub use new_process::NewProcessDetector;
pub use threshold::ThresholdDetector;
pub use zombie::ZombieDetector;

use crate::baseline::Baseline;
use crate::models::{AnomalyCategory, EventDetails, Severity, Snapshot};

/// Result of classifying one snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyClassification {
    pub category: AnomalyCategory,
    pub severity: Severity,
    pub observed: f64,
    /// Process name or similar identity, folded into the fingerprint
    pub subject: Option<String>,
    /// Coarse magnitude bucket, folded into the fingerprint
    pub bucket: i64,
    pub description: String,
    pub details: EventDetails,
}

/// Classifies a snapshot against a frozen baseline
///
/// Implementations may keep bounded internal state (trend history, restart
/// windows) but must never alter the baseline.
pub trait Detector: Send {
    fn classify(&mut self, baseline: &Baseline, snapshot: &Snapshot)
        -> Option<AnomalyClassification>;

    /// Every distinct anomaly in the snapshot
    ///
    /// Detectors that track several identities at once (one event per
    /// process) override this; the watcher publishes each result. Must
    /// advance internal state exactly as `classify` would.
    fn classify_all(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Vec<AnomalyClassification> {
        self.classify(baseline, snapshot).into_iter().collect()
    }
}

/// Most severe classification, keeping the earliest on ties
pub(crate) fn most_severe(
    found: impl IntoIterator<Item = AnomalyClassification>,
) -> Option<AnomalyClassification> {
    found.into_iter().fold(None, |worst, next| match worst {
        Some(current) if current.severity >= next.severity => Some(current),
        _ => Some(next),
    })
}

/// Runs several detectors on the same snapshot
///
/// Every inner detector sees every snapshot so stateful detectors stay in
/// sync. A merged composite reports only the most severe result (earlier
/// detector wins ties); an independent one reports every result.
pub struct CompositeDetector {
    detectors: Vec<Box<dyn Detector>>,
    merge: bool,
}

impl CompositeDetector {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self {
            detectors,
            merge: true,
        }
    }

    /// Composite whose detectors report side by side
    pub fn independent(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self {
            detectors,
            merge: false,
        }
    }
}

impl Detector for CompositeDetector {
    fn classify(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Option<AnomalyClassification> {
        let found: Vec<_> = self
            .detectors
            .iter_mut()
            .flat_map(|detector| detector.classify_all(baseline, snapshot))
            .collect();
        most_severe(found)
    }

    fn classify_all(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Vec<AnomalyClassification> {
        if self.merge {
            return self.classify(baseline, snapshot).into_iter().collect();
        }
        self.detectors
            .iter_mut()
            .flat_map(|detector| detector.classify_all(baseline, snapshot))
            .collect()
    }
}
