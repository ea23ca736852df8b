//! New high-resource process detection
//!
//! A process that was not present on the previous snapshot and already uses
//! more CPU or memory than the policy allows is reported at `Info`.

use super::{most_severe, AnomalyClassification, Detector};
use crate::baseline::Baseline;
use crate::config::NewProcessPolicy;
use crate::models::{AnomalyCategory, EventDetails, ProcessSample, Severity, Snapshot};
use std::collections::HashMap;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct NewProcessDetector {
    policy: NewProcessPolicy,
    /// Process name per PID from the previous snapshot
    previous: Option<HashMap<u32, String>>,
}

impl NewProcessDetector {
    pub fn new(policy: NewProcessPolicy) -> Self {
        Self {
            policy,
            previous: None,
        }
    }

    fn is_heavy(&self, process: &ProcessSample) -> bool {
        process.cpu_percent >= self.policy.cpu_percent || process.rss_bytes >= self.policy.rss_bytes
    }

    fn report(process: &ProcessSample) -> AnomalyClassification {
        AnomalyClassification {
            category: AnomalyCategory::NewProcess,
            severity: Severity::Info,
            observed: process.cpu_percent,
            subject: Some(process.name.clone()),
            bucket: 0,
            description: format!(
                "New high-resource process: {} (PID {}, {:.1}% CPU, {:.0} MB)",
                process.name,
                process.pid,
                process.cpu_percent,
                process.rss_bytes as f64 / BYTES_PER_MB
            ),
            details: EventDetails {
                culprit: Some(process.clone()),
                pids: vec![process.pid],
                ..Default::default()
            },
        }
    }
}

impl Detector for NewProcessDetector {
    fn classify(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Option<AnomalyClassification> {
        most_severe(self.classify_all(baseline, snapshot))
    }

    fn classify_all(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Vec<AnomalyClassification> {
        if !self.policy.enabled || !baseline.is_ready() {
            return Vec::new();
        }

        let processes = snapshot.process_list();
        let current: HashMap<u32, String> =
            processes.iter().map(|p| (p.pid, p.name.clone())).collect();
        let Some(previous) = self.previous.replace(current) else {
            return Vec::new();
        };

        processes
            .iter()
            .filter(|p| previous.get(&p.pid) != Some(&p.name))
            .filter(|p| self.is_heavy(p))
            .map(Self::report)
            .collect()
    }
}
