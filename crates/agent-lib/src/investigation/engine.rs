//! Analysis engine contract
//!
//! The engine is opaque to the monitor: it receives an anomaly plus some
//! context and returns free-form analysis text. [`CommandEngine`] adapts any
//! external program that reads a JSON request on stdin and writes its
//! analysis to stdout.

use crate::collector::MetricSource;
use crate::error::EngineError;
use crate::models::{AnomalyEvent, BaselineRange, MetricKind, MetricValues};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Host state at the time an investigation starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemOverview {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub load_one: Option<f64>,
    pub load_five: Option<f64>,
    pub load_fifteen: Option<f64>,
}

impl SystemOverview {
    /// Sample cpu, memory and load concurrently, each bounded by `timeout`
    ///
    /// Returns `None` when nothing could be sampled.
    pub async fn sample(source: &dyn MetricSource, timeout: Duration) -> Option<Self> {
        let (cpu, memory, load) = tokio::join!(
            tokio::time::timeout(timeout, source.sample(MetricKind::Cpu)),
            tokio::time::timeout(timeout, source.sample(MetricKind::Memory)),
            tokio::time::timeout(timeout, source.sample(MetricKind::Load)),
        );

        let mut overview = SystemOverview::default();
        let mut any = false;
        for snapshot in [cpu, memory, load].into_iter().flatten().flatten() {
            any = true;
            match snapshot.values {
                MetricValues::Cpu { percent } => overview.cpu_percent = Some(percent),
                MetricValues::Memory {
                    percent,
                    used_bytes,
                    total_bytes,
                } => {
                    overview.memory_percent = Some(percent);
                    overview.memory_used_bytes = Some(used_bytes);
                    overview.memory_total_bytes = Some(total_bytes);
                }
                MetricValues::Load { one, five, fifteen } => {
                    overview.load_one = Some(one);
                    overview.load_five = Some(five);
                    overview.load_fifteen = Some(fifteen);
                }
                MetricValues::Processes { .. } => {}
            }
        }
        any.then_some(overview)
    }
}

/// Context passed alongside the anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub node_name: String,
    pub baseline: BaselineRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemOverview>,
    /// Times this fingerprint has been seen in the current cache window
    pub seen_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: String,
    pub engine: String,
    pub analyzed_at: DateTime<Utc>,
}

/// External analysis function
///
/// Implementations must tolerate one retry of the same request after a
/// timeout.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(
        &self,
        event: &AnomalyEvent,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, EngineError>;
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    event: &'a AnomalyEvent,
    context: &'a AnalysisContext,
}

/// Runs an external program per analysis
///
/// The child is killed if the analysis future is dropped, which is how the
/// gate's timeout cancels it.
pub struct CommandEngine {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: format!("command:{}", program),
            program,
            args,
        }
    }

    /// Build from an argv list; `None` when the list is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl AnalysisEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(
        &self,
        event: &AnomalyEvent,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, EngineError> {
        let request = serde_json::to_vec(&CommandRequest { event, context })
            .map_err(|e| EngineError::Unavailable(format!("encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Unavailable(format!("spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program may exit without reading; its exit status decides
            if let Err(e) = stdin.write_all(&request).await {
                debug!(engine = %self.name, error = %e, "Request not fully written");
            }
            // Closing stdin signals end of request
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("wait for {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(500)
                .collect();
            return Err(EngineError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let summary = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if summary.is_empty() {
            return Err(EngineError::Unavailable(format!(
                "{} produced no analysis",
                self.program
            )));
        }
        debug!(engine = %self.name, bytes = summary.len(), "Analysis received");

        Ok(AnalysisResult {
            summary,
            engine: self.name.clone(),
            analyzed_at: Utc::now(),
        })
    }
}
