//! Core data models for the host monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::anomaly::{fingerprint, AnomalyClassification};

/// Kind of metric a source can be asked to sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
    Load,
    Processes,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Load => "load",
            MetricKind::Processes => "processes",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-process resource usage captured in a process snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    /// Single-letter kernel state (`R`, `S`, `Z`, ...)
    pub state: char,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub rss_bytes: u64,
}

impl ProcessSample {
    pub fn is_zombie(&self) -> bool {
        self.state == 'Z'
    }
}

/// Values carried by a snapshot, one variant per metric kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricValues {
    Cpu {
        percent: f64,
    },
    Memory {
        percent: f64,
        used_bytes: u64,
        total_bytes: u64,
    },
    Load {
        one: f64,
        five: f64,
        fifteen: f64,
    },
    Processes {
        count: usize,
        processes: Vec<ProcessSample>,
    },
}

/// Point-in-time sample of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub metric: MetricKind,
    pub values: MetricValues,
    /// Heaviest processes at sample time, carried by CPU and memory snapshots
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_processes: Vec<ProcessSample>,
}

impl Snapshot {
    pub fn new(timestamp: DateTime<Utc>, values: MetricValues) -> Self {
        let metric = match &values {
            MetricValues::Cpu { .. } => MetricKind::Cpu,
            MetricValues::Memory { .. } => MetricKind::Memory,
            MetricValues::Load { .. } => MetricKind::Load,
            MetricValues::Processes { .. } => MetricKind::Processes,
        };
        Self {
            timestamp,
            metric,
            values,
            top_processes: Vec::new(),
        }
    }

    /// Attach the heaviest processes observed alongside this sample
    pub fn with_top_processes(mut self, processes: Vec<ProcessSample>) -> Self {
        self.top_processes = processes;
        self
    }

    pub fn cpu(timestamp: DateTime<Utc>, percent: f64) -> Self {
        Self::new(timestamp, MetricValues::Cpu { percent })
    }

    pub fn memory(timestamp: DateTime<Utc>, used_bytes: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };
        Self::new(
            timestamp,
            MetricValues::Memory {
                percent,
                used_bytes,
                total_bytes,
            },
        )
    }

    pub fn load(timestamp: DateTime<Utc>, one: f64, five: f64, fifteen: f64) -> Self {
        Self::new(timestamp, MetricValues::Load { one, five, fifteen })
    }

    pub fn processes(timestamp: DateTime<Utc>, processes: Vec<ProcessSample>) -> Self {
        Self::new(
            timestamp,
            MetricValues::Processes {
                count: processes.len(),
                processes,
            },
        )
    }

    /// The scalar a baseline is learned over: CPU%, memory%, 1-minute load,
    /// or process count
    pub fn primary_value(&self) -> f64 {
        match &self.values {
            MetricValues::Cpu { percent } => *percent,
            MetricValues::Memory { percent, .. } => *percent,
            MetricValues::Load { one, .. } => *one,
            MetricValues::Processes { count, .. } => *count as f64,
        }
    }

    /// Process list for process snapshots, empty otherwise
    pub fn process_list(&self) -> &[ProcessSample] {
        match &self.values {
            MetricValues::Processes { processes, .. } => processes,
            _ => &[],
        }
    }
}

/// Anomaly severity, ordered `Info < Warning < Error < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Anomaly category used in fingerprints and topic routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    CpuSpike,
    MemorySpike,
    MemoryLeak,
    HighLoad,
    ZombieProcess,
    ProcessCrash,
    ProcessRestart,
    CrashLoop,
    NewProcess,
}

impl AnomalyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyCategory::CpuSpike => "cpu_spike",
            AnomalyCategory::MemorySpike => "memory_spike",
            AnomalyCategory::MemoryLeak => "memory_leak",
            AnomalyCategory::HighLoad => "high_load",
            AnomalyCategory::ZombieProcess => "zombie_process",
            AnomalyCategory::ProcessCrash => "process_crash",
            AnomalyCategory::ProcessRestart => "process_restart",
            AnomalyCategory::CrashLoop => "crash_loop",
            AnomalyCategory::NewProcess => "new_process",
        }
    }
}

impl fmt::Display for AnomalyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected range of a metric at the time an anomaly was detected
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineRange {
    pub mean: f64,
    pub spread: f64,
    pub low: f64,
    pub high: f64,
}

/// Supporting facts attached to an anomaly
///
/// Never part of the fingerprint: two spikes blamed on different processes
/// are still the same anomaly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetails {
    /// Process most likely responsible for a CPU or memory anomaly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culprit: Option<ProcessSample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_processes: Vec<ProcessSample>,
    /// PIDs a process lifecycle event refers to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pids: Vec<u32>,
    /// Regression slope of used memory, bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub growth_bytes_per_sec: Option<f64>,
}

impl EventDetails {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Deduplication key for anomalies
///
/// Hex-encoded SHA-256 over metric name, category, optional subject and
/// magnitude bucket. Never derived from timestamps or exact values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Detected anomaly, immutable once published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub severity: Severity,
    pub category: AnomalyCategory,
    /// Process name or other identity the anomaly is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub observed: f64,
    pub baseline: BaselineRange,
    pub description: String,
    pub fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "EventDetails::is_empty")]
    pub details: EventDetails,
}

impl AnomalyEvent {
    /// Build an event from a detector classification
    pub fn from_classification(
        metric: &str,
        timestamp: DateTime<Utc>,
        baseline: BaselineRange,
        classification: AnomalyClassification,
    ) -> Self {
        let fingerprint = fingerprint(
            metric,
            classification.category,
            classification.subject.as_deref(),
            classification.bucket,
        );
        Self {
            id: Uuid::new_v4(),
            timestamp,
            metric: metric.to_string(),
            severity: classification.severity,
            category: classification.category,
            subject: classification.subject,
            observed: classification.observed,
            baseline,
            description: classification.description,
            fingerprint,
            details: classification.details,
        }
    }

    /// Bus topic this event is published on
    pub fn topic(&self) -> String {
        format!("anomaly.{}", self.metric)
    }
}

impl fmt::Display for AnomalyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.timestamp.format("%H:%M:%S"),
            self.severity,
            self.description
        )
    }
}
