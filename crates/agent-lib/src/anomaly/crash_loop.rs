//! Process exit, restart and crash-loop detection
//!
//! Tracks process identities by name, not PID, since PIDs are reused. Every
//! PID that disappears between two snapshots is an exit, remembered per name
//! for the restart grace period. A new PID whose name exited within that
//! period is a restart, whether it shows up on the same tick or several
//! ticks later. Restart times are kept per name in a bounded trailing window.

use super::{most_severe, AnomalyClassification, Detector};
use crate::baseline::Baseline;
use crate::config::CrashLoopPolicy;
use crate::models::{AnomalyCategory, EventDetails, Severity, Snapshot};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

type Timeline = HashMap<String, VecDeque<DateTime<Utc>>>;

pub struct CrashLoopDetector {
    policy: CrashLoopPolicy,
    /// Process name per PID from the previous snapshot
    previous: Option<HashMap<u32, String>>,
    /// Exits not yet matched to a restart, per name, oldest first
    exits: Timeline,
    /// Recent restart times per process name, oldest first
    restarts: Timeline,
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::max_value())
}

/// `now - duration`, saturating at the earliest representable time
fn cutoff(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_duration(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Drop entries older than `cutoff`, then cap the number of names by
/// evicting those whose latest entry is oldest
fn prune(timeline: &mut Timeline, cutoff: DateTime<Utc>, cap: usize) {
    timeline.retain(|_, times| {
        while times.front().map(|t| *t < cutoff).unwrap_or(false) {
            times.pop_front();
        }
        !times.is_empty()
    });

    if timeline.len() > cap {
        let mut by_recency: Vec<(DateTime<Utc>, String)> = timeline
            .iter()
            .filter_map(|(name, times)| times.back().map(|t| (*t, name.clone())))
            .collect();
        by_recency.sort();
        let excess = timeline.len() - cap;
        for (_, name) in by_recency.into_iter().take(excess) {
            timeline.remove(&name);
        }
    }
}

fn describe_pids(pids: &[u32]) -> String {
    match pids {
        [pid] => format!("PID {}", pid),
        _ => format!(
            "PIDs {}",
            pids.iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl CrashLoopDetector {
    pub fn new(policy: CrashLoopPolicy) -> Self {
        Self {
            policy,
            previous: None,
            exits: HashMap::new(),
            restarts: HashMap::new(),
        }
    }

    /// Number of process names with restarts inside the window
    pub fn tracked(&self) -> usize {
        self.restarts.len()
    }

    /// Number of process names with exits still eligible to match a restart
    pub fn pending_exits(&self) -> usize {
        self.exits.len()
    }

    fn pid_names(snapshot: &Snapshot) -> HashMap<u32, String> {
        snapshot
            .process_list()
            .iter()
            .map(|p| (p.pid, p.name.clone()))
            .collect()
    }

    /// Consume the oldest exit of `name` that is still within the grace period
    fn take_recent_exit(&mut self, name: &str, now: DateTime<Utc>) -> bool {
        let grace = chrono_duration(self.policy.restart_grace());
        let Some(times) = self.exits.get_mut(name) else {
            return false;
        };
        while times.front().map(|t| now - *t > grace).unwrap_or(false) {
            times.pop_front();
        }
        let matched = times.pop_front().is_some();
        if times.is_empty() {
            self.exits.remove(name);
        }
        matched
    }

    fn gc(&mut self, now: DateTime<Utc>) {
        let cap = self.policy.max_tracked.max(1);
        prune(&mut self.restarts, cutoff(now, self.policy.window()), cap);
        prune(&mut self.exits, cutoff(now, self.policy.restart_grace()), cap);
    }

    fn severity_for(&self, count: usize) -> (Severity, AnomalyCategory) {
        let threshold = self.policy.restart_threshold.max(1);
        if count >= threshold * 2 {
            (Severity::Critical, AnomalyCategory::CrashLoop)
        } else if count >= threshold {
            (Severity::Error, AnomalyCategory::CrashLoop)
        } else {
            (Severity::Warning, AnomalyCategory::ProcessRestart)
        }
    }

    fn restart(&self, name: &str, pids: Vec<u32>) -> AnomalyClassification {
        let count = self.restarts.get(name).map(|t| t.len()).unwrap_or(1);
        let (severity, category) = self.severity_for(count);
        let description = match category {
            AnomalyCategory::CrashLoop => format!(
                "Crash loop: {} restarted {} times in the last {}s",
                name, count, self.policy.window_secs
            ),
            _ => format!("Process restarted: {} (new {})", name, describe_pids(&pids)),
        };

        AnomalyClassification {
            category,
            severity,
            observed: count as f64,
            subject: Some(name.to_string()),
            bucket: (count / self.policy.restart_threshold.max(1)) as i64,
            description,
            details: EventDetails {
                pids,
                ..Default::default()
            },
        }
    }

    fn exit(name: &str, pids: Vec<u32>) -> AnomalyClassification {
        AnomalyClassification {
            category: AnomalyCategory::ProcessCrash,
            severity: Severity::Warning,
            observed: pids.len() as f64,
            subject: Some(name.to_string()),
            bucket: 0,
            description: format!("Process exited: {} ({})", name, describe_pids(&pids)),
            details: EventDetails {
                pids,
                ..Default::default()
            },
        }
    }
}

impl Detector for CrashLoopDetector {
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

        let current = Self::pid_names(snapshot);
        let Some(previous) = self.previous.replace(current.clone()) else {
            return Vec::new();
        };
        let now = snapshot.timestamp;

        let mut exited: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (pid, name) in &previous {
            if current.get(pid) != Some(name) {
                exited.entry(name.clone()).or_default().push(*pid);
            }
        }
        for (name, pids) in &mut exited {
            pids.sort_unstable();
            self.exits
                .entry(name.clone())
                .or_default()
                .extend(std::iter::repeat(now).take(pids.len()));
        }

        let mut spawned: Vec<(u32, String)> = current
            .into_iter()
            .filter(|(pid, name)| previous.get(pid) != Some(name))
            .collect();
        spawned.sort_unstable();

        let mut restarted: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (pid, name) in spawned {
            if self.take_recent_exit(&name, now) {
                self.restarts.entry(name.clone()).or_default().push_back(now);
                restarted.entry(name).or_default().push(pid);
            }
        }
        self.gc(now);

        // Restarts first so they win severity ties against plain exits
        let mut found: Vec<AnomalyClassification> = restarted
            .into_iter()
            .map(|(name, pids)| self.restart(&name, pids))
            .collect();
        if self.policy.report_exits {
            found.extend(exited.into_iter().map(|(name, pids)| Self::exit(&name, pids)));
        }
        found
    }
}
