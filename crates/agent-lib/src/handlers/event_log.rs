//! Append-only JSON-lines event log
//!
//! One record per line. Anomalies carry at least timestamp, metric,
//! severity, fingerprint and description; handler failures are written as
//! `handler_error` records. Existing content is never rewritten, and a
//! record that has started writing always finishes, even if the bus aborts
//! the handler for running past its timeout.

use crate::events::{BusEvent, EventHandler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

pub struct EventLogHandler {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl EventLogHandler {
    /// Open `path` for appending, creating it and its parent directory
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open event log {}", path.display()))?;

        info!(path = %path.display(), "Event log opened");
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventHandler for EventLogHandler {
    fn name(&self) -> &str {
        "event_log"
    }

    async fn handle(&self, event: &BusEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to encode event")?;
        line.push(b'\n');

        // Whole line under one lock so records never interleave. The write
        // runs detached: aborting this handler cannot truncate a record.
        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        let write = tokio::spawn(async move {
            let mut file = file.lock().await;
            file.write_all(&line)
                .await
                .with_context(|| format!("Failed to append to {}", path.display()))?;
            file.flush().await?;
            Ok::<_, anyhow::Error>(())
        });
        write.await.context("Event log writer failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyClassification;
    use crate::events::HandlerFailure;
    use crate::models::{AnomalyCategory, AnomalyEvent, BaselineRange, Severity};
    use chrono::Utc;
    use tempfile::TempDir;

    fn anomaly(description: &str) -> BusEvent {
        BusEvent::Anomaly(AnomalyEvent::from_classification(
            "memory",
            Utc::now(),
            BaselineRange {
                mean: 50.0,
                spread: 5.0,
                low: 40.0,
                high: 60.0,
            },
            AnomalyClassification {
                category: AnomalyCategory::MemorySpike,
                severity: Severity::Critical,
                observed: 97.0,
                subject: None,
                bucket: 9,
                description: description.to_string(),
                details: Default::default(),
            },
        ))
    }

    #[tokio::test]
    async fn test_records_are_independent_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let handler = EventLogHandler::open(&path).await.unwrap();

        handler.handle(&anomaly("Memory at 97%")).await.unwrap();
        handler
            .handle(&BusEvent::HandlerError(HandlerFailure {
                timestamp: Utc::now(),
                handler: "console".to_string(),
                topic: "anomaly.memory".to_string(),
                event_id: None,
                error: "broken pipe".to_string(),
            }))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["record"], "anomaly");
        assert_eq!(first["metric"], "memory");
        assert_eq!(first["severity"], "critical");
        assert_eq!(first["description"], "Memory at 97%");
        assert!(first["fingerprint"].as_str().unwrap().len() == 64);
        assert!(first["timestamp"].is_string());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["record"], "handler_error");
        assert_eq!(second["handler"], "console");
    }

    #[tokio::test]
    async fn test_aborted_handler_still_writes_whole_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let handler = Arc::new(EventLogHandler::open(&path).await.unwrap());
        let description = "x".repeat(256 * 1024);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let handler = Arc::clone(&handler);
                let event = anomaly(&description);
                tokio::spawn(async move { handler.handle(&event).await })
            })
            .collect();
        // Let every handler start its write, then abort them all
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        for task in &tasks {
            task.abort();
        }

        handler.handle(&anomaly("after")).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.ends_with('\n'));
        let records: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 21);
        assert_eq!(records[20]["description"], "after");
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");

        let handler = EventLogHandler::open(&path).await.unwrap();
        handler.handle(&anomaly("first")).await.unwrap();
        drop(handler);

        let handler = EventLogHandler::open(&path).await.unwrap();
        handler.handle(&anomaly("second")).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let descriptions: Vec<String> = content
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["description"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(descriptions, vec!["first", "second"]);
    }
}
