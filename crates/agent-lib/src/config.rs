//! Monitor configuration
//!
//! Every tunable used by learners, detectors, the bus and the investigation
//! gate lives here. Durations are expressed in whole seconds (or
//! milliseconds where noted) so the file format stays flat.

use crate::models::Severity;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Root of the procfs mount to sample from
    pub proc_root: PathBuf,
    /// Window between the two /proc/stat reads used to compute CPU%
    pub cpu_sample_window_ms: u64,
    /// Upper bound for a single metric source call
    pub sample_timeout_secs: u64,
    /// Heaviest processes attached to CPU and memory snapshots; 0 disables
    pub top_processes: usize,
    pub learning: LearningConfig,
    #[serde(default = "default_cpu")]
    pub cpu: ThresholdMetricConfig,
    #[serde(default = "default_memory")]
    pub memory: ThresholdMetricConfig,
    #[serde(default = "default_load")]
    pub load: ThresholdMetricConfig,
    pub memory_leak: LeakPolicy,
    pub zombies: ZombiePolicy,
    pub restarts: CrashLoopPolicy,
    pub new_processes: NewProcessPolicy,
    pub investigation: InvestigationConfig,
    pub bus: BusConfig,
    /// JSON-lines anomaly log; disabled when unset
    pub event_log_path: Option<PathBuf>,
    /// Print anomalies and investigation reports to stdout
    pub console: bool,
    /// Grace period for in-flight work on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            cpu_sample_window_ms: 100,
            sample_timeout_secs: 5,
            top_processes: 5,
            learning: LearningConfig::default(),
            cpu: default_cpu(),
            memory: default_memory(),
            load: default_load(),
            memory_leak: LeakPolicy::default(),
            zombies: ZombiePolicy::default(),
            restarts: CrashLoopPolicy::default(),
            new_processes: NewProcessPolicy::default(),
            investigation: InvestigationConfig::default(),
            bus: BusConfig::default(),
            event_log_path: Some(PathBuf::from("hostwatch-events.jsonl")),
            console: true,
            shutdown_grace_secs: 10,
        }
    }
}

impl MonitorConfig {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }

    pub fn cpu_sample_window(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_window_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Baseline learning window
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub window_secs: u64,
    /// Below this many samples a baseline cannot be finalized
    pub min_samples: u64,
    /// Extra windows granted when a window ends with too few samples
    pub max_extensions: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_secs: 5 * 60,
            min_samples: 10,
            max_extensions: 3,
        }
    }
}

impl LearningConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Sampling and classification settings for a threshold metric
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdMetricConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interval_secs: u64,
    #[serde(default)]
    pub policy: ThresholdPolicy,
}

impl ThresholdMetricConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Spread-unit multipliers and absolute ceiling for threshold deviation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThresholdPolicy {
    /// Optional informational tier below `warning_sigma`
    pub info_sigma: Option<f64>,
    pub warning_sigma: f64,
    pub error_sigma: f64,
    pub critical_sigma: f64,
    /// Observed values at or above this are critical regardless of baseline.
    /// Inclusive: a host sitting exactly on the ceiling is already saturated.
    pub ceiling: Option<f64>,
    /// Floor applied to the learned spread so flat baselines stay usable
    pub min_spread: f64,
    /// Width of the magnitude bucket used in fingerprints
    pub bucket_width: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            info_sigma: None,
            warning_sigma: 2.0,
            error_sigma: 3.0,
            critical_sigma: 4.0,
            ceiling: None,
            min_spread: 1.0,
            bucket_width: 10.0,
        }
    }
}

fn default_cpu() -> ThresholdMetricConfig {
    ThresholdMetricConfig {
        enabled: true,
        interval_secs: 1,
        policy: ThresholdPolicy {
            ceiling: Some(90.0),
            ..Default::default()
        },
    }
}

fn default_memory() -> ThresholdMetricConfig {
    ThresholdMetricConfig {
        enabled: true,
        interval_secs: 2,
        policy: ThresholdPolicy {
            ceiling: Some(95.0),
            ..Default::default()
        },
    }
}

fn default_load() -> ThresholdMetricConfig {
    ThresholdMetricConfig {
        enabled: true,
        interval_secs: 5,
        policy: ThresholdPolicy {
            min_spread: 0.1,
            bucket_width: 1.0,
            ..Default::default()
        },
    }
}

fn default_true() -> bool {
    true
}

/// Memory growth trend detection on the memory watcher
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LeakPolicy {
    pub enabled: bool,
    /// Number of recent samples kept for regression
    pub history: usize,
    pub min_samples: usize,
    /// Minimum growth rate (bytes/sec) to consider a leak
    pub slope_threshold: f64,
    /// Fraction of consecutive samples that must not decrease
    pub monotonicity: f64,
}

impl Default for LeakPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            history: 60,
            min_samples: 10,
            slope_threshold: 64.0 * 1024.0,
            monotonicity: 0.8,
        }
    }
}

/// Zombie process presence detection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ZombiePolicy {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Zombie count at which severity escalates to error
    pub error_count: usize,
    pub bucket_width: usize,
}

impl Default for ZombiePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            error_count: 5,
            bucket_width: 5,
        }
    }
}

impl ZombiePolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Process exit, restart and crash-loop detection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CrashLoopPolicy {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Restarts within the window that make a crash loop
    pub restart_threshold: usize,
    pub window_secs: u64,
    /// A new PID counts as a restart when a process of the same name exited
    /// at most this long before
    pub restart_grace_secs: u64,
    /// Publish a warning for every process that exits
    pub report_exits: bool,
    /// Upper bound on process identities tracked at once
    pub max_tracked: usize,
}

impl Default for CrashLoopPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3,
            restart_threshold: 3,
            window_secs: 5 * 60,
            restart_grace_secs: 10,
            report_exits: true,
            max_tracked: 512,
        }
    }
}

impl CrashLoopPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_secs(self.restart_grace_secs)
    }
}

/// Flags processes that appear already using a lot of CPU or memory
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NewProcessPolicy {
    pub enabled: bool,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

impl Default for NewProcessPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_percent: 20.0,
            rss_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Investigation gate policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvestigationConfig {
    pub enabled: bool,
    /// Events below this severity are never investigated
    pub min_severity: Severity,
    pub cache_expiry_secs: u64,
    /// Expiry for failed investigations so outages do not suppress forever
    pub failure_expiry_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: usize,
    pub engine_timeout_secs: u64,
    /// Timeout for the system overview attached to analysis requests
    pub context_timeout_secs: u64,
    /// External analysis command; investigation is off when unset
    pub command: Option<Vec<String>>,
    /// JSON file completed investigations are restored from at startup and
    /// saved to on shutdown; in-memory only when unset
    pub cache_path: Option<PathBuf>,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: Severity::Warning,
            cache_expiry_secs: 60 * 60,
            failure_expiry_secs: 60,
            rate_limit_window_secs: 60,
            rate_limit_max: 5,
            engine_timeout_secs: 120,
            context_timeout_secs: 2,
            command: None,
            cache_path: None,
        }
    }
}

impl InvestigationConfig {
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_secs)
    }

    pub fn failure_expiry(&self) -> Duration {
        Duration::from_secs(self.failure_expiry_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_secs(self.context_timeout_secs)
    }
}

/// Event bus settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscription queue depth; events beyond it are dropped, never waited on
    pub queue_capacity: usize,
    pub handler_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            handler_timeout_secs: 10,
        }
    }
}

impl BusConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}
