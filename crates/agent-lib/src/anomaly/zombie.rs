//! Zombie process detection
//!
//! Zombies have no normal range: the expected count is zero and any
//! positive count is at least a warning.

use super::{AnomalyClassification, Detector};
use crate::baseline::Baseline;
use crate::config::ZombiePolicy;
use crate::models::{AnomalyCategory, EventDetails, Severity, Snapshot};

/// Names listed in the description before truncating
const MAX_LISTED: usize = 5;

pub struct ZombieDetector {
    policy: ZombiePolicy,
}

impl ZombieDetector {
    pub fn new(policy: ZombiePolicy) -> Self {
        Self { policy }
    }
}

impl Detector for ZombieDetector {
    fn classify(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Option<AnomalyClassification> {
        if !self.policy.enabled || !baseline.is_ready() {
            return None;
        }

        let zombies: Vec<_> = snapshot
            .process_list()
            .iter()
            .filter(|p| p.is_zombie())
            .collect();
        let count = zombies.len();
        if count as f64 <= baseline.mean {
            return None;
        }

        let severity = if count >= self.policy.error_count.max(1) {
            Severity::Error
        } else {
            Severity::Warning
        };

        let mut listed: Vec<String> = zombies
            .iter()
            .take(MAX_LISTED)
            .map(|p| format!("{} ({})", p.name, p.pid))
            .collect();
        if count > MAX_LISTED {
            listed.push(format!("+{} more", count - MAX_LISTED));
        }

        Some(AnomalyClassification {
            category: AnomalyCategory::ZombieProcess,
            severity,
            observed: count as f64,
            subject: None,
            bucket: (count / self.policy.bucket_width.max(1)) as i64,
            description: format!("{} zombie process(es): {}", count, listed.join(", ")),
            details: EventDetails {
                pids: zombies.iter().map(|p| p.pid).collect(),
                ..Default::default()
            },
        })
    }
}
