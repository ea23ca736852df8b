//! End-to-end tests: scripted metric source through watchers, bus,
//! handlers and the investigation gate

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostwatch_lib::anomaly::ThresholdDetector;
use hostwatch_lib::collector::MetricSource;
use hostwatch_lib::config::{BusConfig, ThresholdPolicy};
use hostwatch_lib::events::{BusEvent, EventBus, EventHandler, TopicFilter};
use hostwatch_lib::health::components;
use hostwatch_lib::investigation::{AnalysisContext, AnalysisEngine, AnalysisResult};
use hostwatch_lib::watcher::{BaselinePolicy, TickOutcome, Watcher, WatcherSpec};
use hostwatch_lib::{
    AnomalyEvent, ComponentStatus, EngineError, HealthRegistry, MetricKind, Monitor,
    MonitorConfig, ProcessSample, Severity, Snapshot, SourceError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// CPU and load source; load fails for its first `load_failures` calls
struct FlakyLoad {
    load_failures: usize,
    calls: Mutex<HashMap<MetricKind, Vec<Instant>>>,
}

impl FlakyLoad {
    fn new(load_failures: usize) -> Arc<Self> {
        Arc::new(Self {
            load_failures,
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn calls(&self, kind: MetricKind) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetricSource for FlakyLoad {
    async fn sample(&self, kind: MetricKind) -> Result<Snapshot, SourceError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(kind).or_default();
            entry.push(Instant::now());
            entry.len()
        };
        match kind {
            MetricKind::Cpu => Ok(Snapshot::cpu(Utc::now(), 12.0)),
            MetricKind::Load if call <= self.load_failures => Err(SourceError::unavailable(
                kind,
                "/proc/loadavg: No such file or directory",
            )),
            MetricKind::Load => Ok(Snapshot::load(Utc::now(), 0.4, 0.3, 0.2)),
            other => Err(SourceError::unavailable(other, "not scripted")),
        }
    }
}

fn learned_spec(name: &str, kind: MetricKind) -> WatcherSpec {
    WatcherSpec {
        name: name.to_string(),
        kind,
        interval: Duration::from_secs(1),
        baseline: BaselinePolicy::Learned {
            window: Duration::from_secs(300),
            min_samples: 10,
            max_extensions: 3,
        },
        range_sigma: 2.0,
    }
}

fn quiet_config() -> MonitorConfig {
    MonitorConfig {
        event_log_path: None,
        console: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_load_failures_skip_ticks() {
    let source = FlakyLoad::new(3);
    let bus = EventBus::new(BusConfig::default()).unwrap();
    let mut load = Watcher::new(
        learned_spec("load", MetricKind::Load),
        source.clone(),
        Box::new(ThresholdDetector::load(ThresholdPolicy::default())),
        bus,
        Duration::from_secs(1),
    );

    let mut unavailable = 0;
    for _ in 0..5 {
        if let TickOutcome::SourceUnavailable(SourceError::Unavailable { metric, .. }) =
            load.tick().await
        {
            assert_eq!(metric, MetricKind::Load);
            unavailable += 1;
        }
    }
    assert_eq!(unavailable, 3);
    assert!(load.baseline().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failing_load_watcher_does_not_disturb_cpu() {
    let source = FlakyLoad::new(3);
    let health = HealthRegistry::new();
    let mut monitor = Monitor::builder(quiet_config())
        .source(source.clone())
        .health(health.clone())
        .without_default_watchers()
        .watcher(
            learned_spec("cpu", MetricKind::Cpu),
            Box::new(ThresholdDetector::cpu(ThresholdPolicy::default())),
        )
        .watcher(
            learned_spec("load", MetricKind::Load),
            Box::new(ThresholdDetector::load(ThresholdPolicy::default())),
        )
        .build()
        .await
        .unwrap();

    let start = Instant::now();
    monitor.start().await;

    // Ticks at 0..=3s; the load source has failed exactly three times by 2s
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(
        health
            .component(&components::watcher("load"))
            .await
            .unwrap()
            .status,
        ComponentStatus::Degraded
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    monitor.shutdown(Duration::from_secs(1)).await;

    let cpu_calls = source.calls(MetricKind::Cpu);
    assert_eq!(cpu_calls.len(), 6);
    for (i, at) in cpu_calls.iter().enumerate() {
        assert_eq!(at.duration_since(start), Duration::from_secs(i as u64));
    }
    assert_eq!(source.calls(MetricKind::Load).len(), 6);

    assert_eq!(
        health
            .component(&components::watcher("cpu"))
            .await
            .unwrap()
            .status,
        ComponentStatus::Healthy
    );
    // Recovered once the source came back
    assert_eq!(
        health
            .component(&components::watcher("load"))
            .await
            .unwrap()
            .status,
        ComponentStatus::Healthy
    );
}

/// CPU source replaying a learning phase at 10% +/- 2%, then a sustained 18%
/// driven by one busy process
///
/// Snapshot timestamps advance 10 synthetic seconds per call so five
/// minutes of learning fit in 30 ticks.
struct SyntheticCpu {
    start: DateTime<Utc>,
    calls: AtomicUsize,
}

#[async_trait]
impl MetricSource for SyntheticCpu {
    async fn sample(&self, kind: MetricKind) -> Result<Snapshot, SourceError> {
        if kind != MetricKind::Cpu {
            return Err(SourceError::unavailable(kind, "cpu only"));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let timestamp = self.start + chrono::Duration::seconds(10 * (n as i64 + 1));
        let snapshot = match n {
            0..=29 if n % 2 == 0 => Snapshot::cpu(timestamp, 8.0),
            0..=29 => Snapshot::cpu(timestamp, 12.0),
            _ => Snapshot::cpu(timestamp, 18.0).with_top_processes(vec![
                ProcessSample {
                    pid: 4242,
                    name: "ffmpeg".to_string(),
                    state: 'R',
                    cpu_percent: 9.5,
                    memory_percent: 1.0,
                    rss_bytes: 300 * 1024 * 1024,
                },
                ProcessSample {
                    pid: 1,
                    name: "systemd".to_string(),
                    state: 'S',
                    cpu_percent: 0.2,
                    memory_percent: 0.1,
                    rss_bytes: 12 * 1024 * 1024,
                },
            ]),
        };
        Ok(snapshot)
    }
}

#[derive(Default)]
struct CountingEngine {
    calls: AtomicUsize,
}

#[async_trait]
impl AnalysisEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    async fn analyze(
        &self,
        event: &AnomalyEvent,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Ok(AnalysisResult {
            summary: format!(
                "{} on {} (baseline {:.1}..{:.1})",
                event.description, context.node_name, context.baseline.low, context.baseline.high
            ),
            engine: "counting".to_string(),
            analyzed_at: Utc::now(),
        })
    }
}

#[derive(Default)]
struct Recorder {
    anomalies: Mutex<Vec<AnomalyEvent>>,
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: &BusEvent) -> anyhow::Result<()> {
        if let Some(anomaly) = event.as_anomaly() {
            self.anomalies.lock().unwrap().push(anomaly.clone());
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_recurring_anomaly_investigated_once() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("events.jsonl");

    let mut config = quiet_config();
    config.event_log_path = Some(log_path.clone());
    config.learning.window_secs = 290;

    let engine = Arc::new(CountingEngine::default());
    let recorder = Arc::new(Recorder::default());
    let source = Arc::new(SyntheticCpu {
        start: Utc::now(),
        calls: AtomicUsize::new(0),
    });

    let mut monitor = Monitor::builder(config)
        .source(source)
        .engine(engine.clone())
        .node_name("node-1")
        .without_default_watchers()
        .watcher(
            learned_spec("cpu", MetricKind::Cpu),
            Box::new(ThresholdDetector::cpu(ThresholdPolicy::default())),
        )
        .handler(TopicFilter::parse("anomaly.*"), recorder.clone())
        .build()
        .await
        .unwrap();
    assert!(monitor.gate().is_some());

    monitor.start().await;
    tokio::time::sleep(Duration::from_secs(40)).await;
    let gate = Arc::clone(monitor.gate().unwrap());
    monitor.shutdown(Duration::from_secs(5)).await;

    let anomalies = recorder.anomalies.lock().unwrap().clone();
    assert!(anomalies.len() >= 5, "got {} anomalies", anomalies.len());
    assert!(anomalies.iter().all(|a| a.severity == Severity::Critical));
    assert!(anomalies
        .iter()
        .all(|a| a.fingerprint == anomalies[0].fingerprint));

    // One engine call no matter how often the fingerprint fired
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    assert_eq!(gate.in_flight(), 0);

    let log = std::fs::read_to_string(&log_path).unwrap();
    let records: Vec<serde_json::Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), anomalies.len());
    for record in &records {
        assert_eq!(record["metric"], "cpu");
        assert_eq!(record["severity"], "critical");
        assert!(record["fingerprint"].is_string());
        assert!(record["description"]
            .as_str()
            .unwrap()
            .ends_with("- ffmpeg (PID 4242)"));
        assert!(record["timestamp"].is_string());
        assert_eq!(record["details"]["culprit"]["name"], "ffmpeg");
        assert_eq!(record["details"]["culprit"]["pid"], 4242);
        assert_eq!(record["details"]["top_processes"].as_array().unwrap().len(), 2);
    }
}
