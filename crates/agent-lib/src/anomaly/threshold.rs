//! Threshold deviation detection
//!
//! Classifies a value by how many spread-units it sits above the baseline
//! mean. An absolute ceiling, when configured, forces `Critical` regardless
//! of what the baseline considers normal. CPU and memory anomalies name the
//! heaviest process carried by the snapshot as the likely culprit.

use super::{value_bucket, AnomalyClassification, Detector};
use crate::baseline::Baseline;
use crate::config::ThresholdPolicy;
use crate::models::{AnomalyCategory, EventDetails, ProcessSample, Severity, Snapshot};

/// Tolerance for floating point error when comparing against multipliers
const SIGMA_EPSILON: f64 = 1e-9;

/// Which process usage figure identifies a culprit
#[derive(Debug, Clone, Copy)]
enum Culprit {
    Cpu,
    Memory,
}

impl Culprit {
    fn pick(self, processes: &[ProcessSample]) -> Option<&ProcessSample> {
        match self {
            Culprit::Cpu => processes
                .iter()
                .max_by(|a, b| a.cpu_percent.total_cmp(&b.cpu_percent)),
            Culprit::Memory => processes.iter().max_by_key(|p| p.rss_bytes),
        }
    }
}

/// Stateless spread-unit classifier for CPU, memory and load
pub struct ThresholdDetector {
    category: AnomalyCategory,
    label: &'static str,
    unit: &'static str,
    policy: ThresholdPolicy,
    culprit: Option<Culprit>,
}

impl ThresholdDetector {
    pub fn new(
        category: AnomalyCategory,
        label: &'static str,
        unit: &'static str,
        policy: ThresholdPolicy,
    ) -> Self {
        Self {
            category,
            label,
            unit,
            policy,
            culprit: None,
        }
    }

    pub fn cpu(policy: ThresholdPolicy) -> Self {
        Self {
            culprit: Some(Culprit::Cpu),
            ..Self::new(AnomalyCategory::CpuSpike, "CPU usage", "%", policy)
        }
    }

    pub fn memory(policy: ThresholdPolicy) -> Self {
        Self {
            culprit: Some(Culprit::Memory),
            ..Self::new(AnomalyCategory::MemorySpike, "Memory usage", "%", policy)
        }
    }

    pub fn load(policy: ThresholdPolicy) -> Self {
        Self::new(AnomalyCategory::HighLoad, "Load average", "", policy)
    }

    /// Spread-units `observed` sits above the baseline mean
    pub fn z_score(&self, baseline: &Baseline, observed: f64) -> f64 {
        let spread = baseline.spread.max(self.policy.min_spread);
        let delta = observed - baseline.mean;
        if spread < f64::EPSILON {
            return if delta > f64::EPSILON {
                f64::INFINITY
            } else {
                0.0
            };
        }
        delta / spread
    }

    fn statistical_severity(&self, z: f64) -> Option<Severity> {
        let z = z + SIGMA_EPSILON;
        if z >= self.policy.critical_sigma {
            Some(Severity::Critical)
        } else if z >= self.policy.error_sigma {
            Some(Severity::Error)
        } else if z >= self.policy.warning_sigma {
            Some(Severity::Warning)
        } else {
            match self.policy.info_sigma {
                Some(info) if z >= info => Some(Severity::Info),
                _ => None,
            }
        }
    }
}

impl Detector for ThresholdDetector {
    fn classify(
        &mut self,
        baseline: &Baseline,
        snapshot: &Snapshot,
    ) -> Option<AnomalyClassification> {
        if !baseline.is_ready() {
            return None;
        }

        let observed = snapshot.primary_value();
        if !observed.is_finite() {
            return None;
        }

        let z = self.z_score(baseline, observed);
        let over_ceiling = self
            .policy
            .ceiling
            .map(|ceiling| observed >= ceiling)
            .unwrap_or(false);

        let severity = if over_ceiling {
            Severity::Critical
        } else {
            self.statistical_severity(z)?
        };

        let mut description = if over_ceiling {
            format!(
                "{} critical: {:.1}{} (ceiling {:.1}{})",
                self.label,
                observed,
                self.unit,
                self.policy.ceiling.unwrap_or_default(),
                self.unit
            )
        } else {
            format!(
                "{} above baseline: {:.2}{} (baseline {:.2}{} \u{b1} {:.2}, {:.1}\u{3c3})",
                self.label, observed, self.unit, baseline.mean, self.unit, baseline.spread, z
            )
        };

        let culprit = self
            .culprit
            .and_then(|rank| rank.pick(&snapshot.top_processes))
            .cloned();
        if let Some(process) = &culprit {
            description.push_str(&format!(" - {} (PID {})", process.name, process.pid));
        }

        Some(AnomalyClassification {
            category: self.category,
            severity,
            observed,
            subject: None,
            bucket: value_bucket(observed, self.policy.bucket_width),
            description,
            details: EventDetails {
                culprit,
                top_processes: snapshot.top_processes.clone(),
                ..Default::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineLearner;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn cpu_policy() -> ThresholdPolicy {
        ThresholdPolicy {
            ceiling: Some(90.0),
            ..Default::default()
        }
    }

    /// Baseline learned over 5 synthetic minutes: mean 10%, spread ~2%
    fn learned_cpu_baseline() -> Baseline {
        let start = Utc::now();
        let mut learner = BaselineLearner::new("cpu", Duration::from_secs(300), 10);
        for i in 0..300 {
            let v = if i % 2 == 0 { 8.0 } else { 12.0 };
            learner.observe_value(start + ChronoDuration::seconds(i), v);
        }
        learner.observe_value(start + ChronoDuration::seconds(300), 10.0);
        assert!(learner.is_ready());
        learner.finalize().unwrap()
    }

    #[test]
    fn test_scenario_four_sigma_is_critical() {
        let baseline = learned_cpu_baseline();
        assert!((baseline.mean - 10.0).abs() < 1e-6);
        assert!((baseline.spread - 2.0).abs() < 0.01);

        let mut detector = ThresholdDetector::cpu(cpu_policy());
        let found = detector
            .classify(&baseline, &Snapshot::cpu(Utc::now(), 18.0))
            .unwrap();
        assert_eq!(found.severity, Severity::Critical);
        assert_eq!(found.category, AnomalyCategory::CpuSpike);

        assert!(detector
            .classify(&baseline, &Snapshot::cpu(Utc::now(), 11.0))
            .is_none());
    }

    #[test]
    fn test_severity_tiers() {
        let baseline = Baseline::fixed("cpu", 10.0, 2.0, Utc::now());
        let mut detector = ThresholdDetector::cpu(cpu_policy());
        let classify = |d: &mut ThresholdDetector, v: f64| {
            d.classify(&baseline, &Snapshot::cpu(Utc::now(), v))
                .map(|c| c.severity)
        };

        assert_eq!(classify(&mut detector, 13.9), None);
        assert_eq!(classify(&mut detector, 14.0), Some(Severity::Warning));
        assert_eq!(classify(&mut detector, 16.5), Some(Severity::Error));
        assert_eq!(classify(&mut detector, 18.0), Some(Severity::Critical));
        assert_eq!(classify(&mut detector, 40.0), Some(Severity::Critical));
    }

    #[test]
    fn test_values_below_mean_are_normal() {
        let baseline = Baseline::fixed("cpu", 50.0, 2.0, Utc::now());
        let mut detector = ThresholdDetector::cpu(cpu_policy());
        for v in [0.0, 10.0, 45.0, 50.0, 53.9] {
            assert!(detector
                .classify(&baseline, &Snapshot::cpu(Utc::now(), v))
                .is_none());
        }
    }

    #[test]
    fn test_ceiling_overrides_hot_baseline() {
        // A host that typically runs hot still goes critical past the ceiling
        let baseline = Baseline::fixed("memory", 94.0, 3.0, Utc::now());
        let mut detector = ThresholdDetector::memory(ThresholdPolicy {
            ceiling: Some(95.0),
            ..Default::default()
        });
        let snapshot = Snapshot::memory(Utc::now(), 97, 100);

        let found = detector.classify(&baseline, &snapshot).unwrap();
        assert_eq!(found.severity, Severity::Critical);
        assert!(found.description.contains("ceiling"));
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let baseline = Baseline::fixed("memory", 70.0, 10.0, Utc::now());
        let mut detector = ThresholdDetector::memory(ThresholdPolicy {
            ceiling: Some(95.0),
            ..Default::default()
        });
        let at_ceiling = detector
            .classify(&baseline, &Snapshot::memory(Utc::now(), 95, 100))
            .unwrap();
        assert_eq!(at_ceiling.severity, Severity::Critical);

        // 94% is 2.4 sigma above 70% +/- 10
        let below = detector
            .classify(&baseline, &Snapshot::memory(Utc::now(), 94, 100))
            .unwrap();
        assert_eq!(below.severity, Severity::Warning);
        assert!(!below.description.contains("ceiling"));
    }

    fn sample(pid: u32, name: &str, cpu_percent: f64, rss_mb: u64) -> ProcessSample {
        ProcessSample {
            pid,
            name: name.to_string(),
            state: 'R',
            cpu_percent,
            memory_percent: 0.0,
            rss_bytes: rss_mb * 1024 * 1024,
        }
    }

    #[test]
    fn test_cpu_spike_names_culprit() {
        let baseline = Baseline::fixed("cpu", 10.0, 2.0, Utc::now());
        let mut detector = ThresholdDetector::cpu(cpu_policy());
        let top = vec![
            sample(300, "postgres", 4.0, 2048),
            sample(4242, "ffmpeg", 71.5, 300),
            sample(12, "sshd", 0.1, 8),
        ];
        let snapshot = Snapshot::cpu(Utc::now(), 80.0).with_top_processes(top);

        let found = detector.classify(&baseline, &snapshot).unwrap();
        let culprit = found.details.culprit.as_ref().unwrap();
        assert_eq!(culprit.pid, 4242);
        assert!(found.description.ends_with("- ffmpeg (PID 4242)"));
        assert_eq!(found.details.top_processes.len(), 3);
    }

    #[test]
    fn test_memory_spike_blames_largest_rss() {
        let baseline = Baseline::fixed("memory", 40.0, 2.0, Utc::now());
        let mut detector = ThresholdDetector::memory(ThresholdPolicy::default());
        let snapshot = Snapshot::memory(Utc::now(), 60, 100).with_top_processes(vec![
            sample(300, "postgres", 4.0, 2048),
            sample(4242, "ffmpeg", 71.5, 300),
        ]);

        let found = detector.classify(&baseline, &snapshot).unwrap();
        assert_eq!(found.details.culprit.as_ref().unwrap().name, "postgres");
    }

    #[test]
    fn test_load_has_no_culprit() {
        let baseline = Baseline::fixed("load", 1.0, 0.2, Utc::now());
        let mut detector = ThresholdDetector::load(ThresholdPolicy::default());
        let snapshot = Snapshot::load(Utc::now(), 9.0, 4.0, 2.0)
            .with_top_processes(vec![sample(1, "make", 90.0, 100)]);

        let found = detector.classify(&baseline, &snapshot).unwrap();
        assert!(found.details.culprit.is_none());
        assert!(!found.description.contains("make"));
    }

    #[test]
    fn test_min_spread_floor() {
        // Perfectly flat baseline: spread floor keeps small wiggles quiet
        let baseline = Baseline::fixed("cpu", 5.0, 0.0, Utc::now());
        let mut detector = ThresholdDetector::cpu(cpu_policy());
        assert!(detector
            .classify(&baseline, &Snapshot::cpu(Utc::now(), 6.5))
            .is_none());
        assert_eq!(
            detector
                .classify(&baseline, &Snapshot::cpu(Utc::now(), 9.0))
                .map(|c| c.severity),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_info_tier_optional() {
        let baseline = Baseline::fixed("load", 1.0, 0.5, Utc::now());
        let mut detector = ThresholdDetector::load(ThresholdPolicy {
            info_sigma: Some(1.0),
            min_spread: 0.1,
            bucket_width: 1.0,
            ..Default::default()
        });
        assert_eq!(
            detector
                .classify(&baseline, &Snapshot::load(Utc::now(), 1.6, 1.0, 1.0))
                .map(|c| c.severity),
            Some(Severity::Info)
        );
    }

    #[test]
    fn test_not_ready_baseline_never_classifies() {
        let mut baseline = Baseline::fixed("cpu", 10.0, 2.0, Utc::now());
        baseline.state = crate::baseline::BaselineState::Learning;
        let mut detector = ThresholdDetector::cpu(cpu_policy());
        assert!(detector
            .classify(&baseline, &Snapshot::cpu(Utc::now(), 99.0))
            .is_none());
    }

    #[test]
    fn test_order_independent() {
        let baseline = Baseline::fixed("cpu", 10.0, 2.0, Utc::now());
        let mut detector = ThresholdDetector::cpu(cpu_policy());
        let values = [30.0, 12.0, 19.0, 100.0, 25.0];

        let forward: Vec<_> = values
            .iter()
            .map(|v| detector.classify(&baseline, &Snapshot::cpu(Utc::now(), *v)))
            .map(|c| c.map(|c| c.severity))
            .collect();
        let mut backward: Vec<_> = values
            .iter()
            .rev()
            .map(|v| detector.classify(&baseline, &Snapshot::cpu(Utc::now(), *v)))
            .map(|c| c.map(|c| c.severity))
            .collect();
        backward.reverse();

        assert_eq!(forward, backward);
        assert!(forward
            .iter()
            .all(|s| s.is_none() || *s == Some(Severity::Critical)));
    }
}
