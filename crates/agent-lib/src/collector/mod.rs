//! Host metric sources
//!
//! This module provides the metric source abstraction and the procfs-backed
//! implementation used on Linux hosts. Sources are pure queries: they hold
//! no per-metric state between calls.

mod procfs;


pub use procfs::{CpuTimes, PidStat, ProcfsSource};

use crate::error::SourceError;
use crate::models::{MetricKind, Snapshot};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// Trait for metric source implementations
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Take one point-in-time snapshot of the given metric
    async fn sample(&self, kind: MetricKind) -> Result<Snapshot, SourceError>;
}

/// Create the metric source for the given procfs mount
///
/// `top_processes` heaviest processes ride along on CPU and memory snapshots.
pub async fn create_source(
    proc_root: &Path,
    cpu_window: Duration,
    top_processes: usize,
) -> Arc<dyn MetricSource> {
    if tokio::fs::metadata(proc_root.join("stat")).await.is_err() {
        tracing::warn!(
            proc_root = %proc_root.display(),
            "procfs not readable, samples will fail until it is"
        );
    } else {
        tracing::info!(proc_root = %proc_root.display(), "Using procfs metric source");
    }
    Arc::new(
        ProcfsSource::new(proc_root)
            .with_cpu_window(cpu_window)
            .with_top_processes(top_processes),
    )
}
