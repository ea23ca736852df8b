//! procfs metric source
//!
//! Reads host metrics from a procfs mount:
//! - stat for aggregate CPU times
//! - meminfo for memory usage
//! - loadavg for load averages
//! - [pid]/stat and [pid]/status for per-process state and usage
//!
//! CPU and memory snapshots optionally carry the heaviest processes so
//! anomalies can name a culprit.

use super::MetricSource;
use crate::error::SourceError;
use crate::models::{MetricKind, ProcessSample, Snapshot};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Kernel clock ticks per second used in /proc/[pid]/stat
const CLOCK_TICKS: f64 = 100.0;

/// Aggregate CPU time counters from the `cpu` line of /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Fields of interest from /proc/[pid]/stat
#[derive(Debug, Clone, PartialEq)]
pub struct PidStat {
    pub name: String,
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
}

/// Metric source backed by a procfs mount
pub struct ProcfsSource {
    proc_root: PathBuf,
    cpu_window: Duration,
    top_processes: usize,
}

impl ProcfsSource {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            cpu_window: Duration::from_millis(100),
            top_processes: 0,
        }
    }

    /// Set the window between the two /proc/stat reads used for CPU%
    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    /// Attach the `count` heaviest processes to CPU and memory snapshots
    pub fn with_top_processes(mut self, count: usize) -> Self {
        self.top_processes = count;
        self
    }

    /// Parse the aggregate `cpu` line of /proc/stat
    pub fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
        let line = content.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|v| v.parse().unwrap_or(0))
            .collect();
        if fields.len() < 4 {
            return None;
        }

        // user nice system idle iowait irq softirq steal ...
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        // guest time is already included in user
        let total: u64 = fields.iter().take(8).sum();
        Some(CpuTimes {
            busy: total.saturating_sub(idle),
            total,
        })
    }

    /// CPU% between two /proc/stat readings
    pub fn cpu_percent(before: CpuTimes, after: CpuTimes) -> f64 {
        let total = after.total.saturating_sub(before.total);
        if total == 0 {
            return 0.0;
        }
        let busy = after.busy.saturating_sub(before.busy);
        (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Parse /proc/meminfo, returning (used, total) in bytes
    pub fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
        let mut total = None;
        let mut available = None;
        let mut free = 0u64;
        let mut buffers = 0u64;
        let mut cached = 0u64;

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }
            let kib: u64 = match parts[1].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            match parts[0] {
                "MemTotal:" => total = Some(kib),
                "MemAvailable:" => available = Some(kib),
                "MemFree:" => free = kib,
                "Buffers:" => buffers = kib,
                "Cached:" => cached = kib,
                _ => {}
            }
        }

        let total = total?;
        // Older kernels lack MemAvailable
        let available = available.unwrap_or(free + buffers + cached);
        Some((total.saturating_sub(available) * 1024, total * 1024))
    }

    /// Parse /proc/loadavg into 1, 5 and 15 minute averages
    pub fn parse_loadavg(content: &str) -> Option<(f64, f64, f64)> {
        let mut parts = content.split_whitespace();
        let one = parts.next()?.parse().ok()?;
        let five = parts.next()?.parse().ok()?;
        let fifteen = parts.next()?.parse().ok()?;
        Some((one, five, fifteen))
    }

    /// Parse /proc/uptime, returning seconds since boot
    pub fn parse_uptime(content: &str) -> Option<f64> {
        content.split_whitespace().next()?.parse().ok()
    }

    /// Parse /proc/[pid]/stat
    ///
    /// The command name may itself contain spaces and parentheses, so it is
    /// taken as everything between the first `(` and the last `)`.
    pub fn parse_pid_stat(content: &str) -> Option<PidStat> {
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        if close < open {
            return None;
        }
        let name = content[open + 1..close].to_string();
        let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();

        // rest[0] is field 3 (state); utime, stime and starttime are fields 14, 15, 22
        let state = rest.first()?.chars().next()?;
        let utime = rest.get(11)?.parse().ok()?;
        let stime = rest.get(12)?.parse().ok()?;
        let starttime = rest.get(19)?.parse().ok()?;

        Some(PidStat {
            name,
            state,
            utime,
            stime,
            starttime,
        })
    }

    /// Parse the VmRSS line of /proc/[pid]/status, in bytes
    pub fn parse_vm_rss(content: &str) -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with("VmRSS:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kib| kib * 1024)
    }

    async fn read(&self, kind: MetricKind, name: &str) -> Result<String, SourceError> {
        let path = self.proc_root.join(name);
        fs::read_to_string(&path)
            .await
            .map_err(|e| SourceError::unavailable(kind, format!("{}: {}", path.display(), e)))
    }

    async fn read_cpu_times(&self) -> Result<CpuTimes, SourceError> {
        let content = self.read(MetricKind::Cpu, "stat").await?;
        Self::parse_cpu_times(&content)
            .ok_or_else(|| SourceError::unavailable(MetricKind::Cpu, "malformed stat"))
    }

    async fn sample_cpu(&self) -> Result<Snapshot, SourceError> {
        let before = self.read_cpu_times().await?;
        tokio::time::sleep(self.cpu_window).await;
        let after = self.read_cpu_times().await?;
        let top = self
            .top_processes(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent))
            .await;
        Ok(Snapshot::cpu(Utc::now(), Self::cpu_percent(before, after)).with_top_processes(top))
    }

    async fn sample_memory(&self) -> Result<Snapshot, SourceError> {
        let content = self.read(MetricKind::Memory, "meminfo").await?;
        let (used, total) = Self::parse_meminfo(&content)
            .ok_or_else(|| SourceError::unavailable(MetricKind::Memory, "MemTotal missing"))?;
        let top = self.top_processes(|a, b| b.rss_bytes.cmp(&a.rss_bytes)).await;
        Ok(Snapshot::memory(Utc::now(), used, total).with_top_processes(top))
    }

    async fn sample_load(&self) -> Result<Snapshot, SourceError> {
        let content = self.read(MetricKind::Load, "loadavg").await?;
        let (one, five, fifteen) = Self::parse_loadavg(&content)
            .ok_or_else(|| SourceError::unavailable(MetricKind::Load, "malformed loadavg"))?;
        Ok(Snapshot::load(Utc::now(), one, five, fifteen))
    }

    async fn list_processes(&self) -> Result<Vec<ProcessSample>, SourceError> {
        let root = self.proc_root.clone();
        // Directory walk is synchronous and can be slow on busy hosts
        tokio::task::spawn_blocking(move || enumerate_processes(&root))
            .await
            .map_err(|e| SourceError::unavailable(MetricKind::Processes, e.to_string()))?
    }

    async fn sample_processes(&self) -> Result<Snapshot, SourceError> {
        let processes = self.list_processes().await?;
        Ok(Snapshot::processes(Utc::now(), processes))
    }

    /// Heaviest processes first by `order`, ties broken by PID
    ///
    /// Best effort: a failed walk only loses the attribution, never the sample.
    async fn top_processes(
        &self,
        order: fn(&ProcessSample, &ProcessSample) -> Ordering,
    ) -> Vec<ProcessSample> {
        if self.top_processes == 0 {
            return Vec::new();
        }
        let mut processes = match self.list_processes().await {
            Ok(processes) => processes,
            Err(e) => {
                debug!(error = %e, "Process walk failed, snapshot carries no top processes");
                return Vec::new();
            }
        };
        processes.retain(|p| !p.is_zombie());
        processes.sort_by(|a, b| order(a, b).then(a.pid.cmp(&b.pid)));
        processes.truncate(self.top_processes);
        processes
    }
}

/// Walk numeric entries of the procfs root
///
/// Processes that exit mid-walk are skipped.
fn enumerate_processes(proc_root: &Path) -> Result<Vec<ProcessSample>, SourceError> {
    let entries = std::fs::read_dir(proc_root).map_err(|e| {
        SourceError::unavailable(
            MetricKind::Processes,
            format!("{}: {}", proc_root.display(), e),
        )
    })?;

    let uptime = std::fs::read_to_string(proc_root.join("uptime"))
        .ok()
        .and_then(|c| ProcfsSource::parse_uptime(&c))
        .unwrap_or(0.0);
    let total_memory = std::fs::read_to_string(proc_root.join("meminfo"))
        .ok()
        .and_then(|c| ProcfsSource::parse_meminfo(&c))
        .map(|(_, total)| total)
        .unwrap_or(0);

    let mut processes = Vec::new();
    for entry in entries.flatten() {
        let pid: u32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        let dir = entry.path();

        let stat = match std::fs::read_to_string(dir.join("stat"))
            .ok()
            .and_then(|c| ProcfsSource::parse_pid_stat(&c))
        {
            Some(stat) => stat,
            None => continue,
        };
        let rss_bytes = std::fs::read_to_string(dir.join("status"))
            .ok()
            .and_then(|c| ProcfsSource::parse_vm_rss(&c))
            .unwrap_or(0);

        // Average over the process lifetime
        let elapsed = uptime - stat.starttime as f64 / CLOCK_TICKS;
        let cpu_percent = if elapsed > 0.0 {
            (stat.utime + stat.stime) as f64 / CLOCK_TICKS / elapsed * 100.0
        } else {
            0.0
        };
        let memory_percent = if total_memory > 0 {
            rss_bytes as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        processes.push(ProcessSample {
            pid,
            name: stat.name,
            state: stat.state,
            cpu_percent,
            memory_percent,
            rss_bytes,
        });
    }

    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

#[async_trait]
impl MetricSource for ProcfsSource {
    async fn sample(&self, kind: MetricKind) -> Result<Snapshot, SourceError> {
        match kind {
            MetricKind::Cpu => self.sample_cpu().await,
            MetricKind::Memory => self.sample_memory().await,
            MetricKind::Load => self.sample_load().await,
            MetricKind::Processes => self.sample_processes().await,
        }
    }
}
