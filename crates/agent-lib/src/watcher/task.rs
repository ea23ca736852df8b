//! Per-metric watcher task
//!
//! A watcher samples one metric on its own interval, learns that metric's
//! baseline, then classifies every later snapshot against the frozen
//! baseline and publishes the resulting anomalies.

use crate::anomaly::Detector;
use crate::baseline::{Baseline, BaselineLearner};
use crate::collector::MetricSource;
use crate::error::{BaselineError, SourceError};
use crate::events::{BusEvent, EventBus};
use crate::health::{components, HealthRegistry};
use crate::models::{AnomalyEvent, MetricKind, Snapshot};
use crate::observability::{MonitorMetrics, StructuredLogger};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Consecutive source failures before the watcher reports itself degraded
const DEGRADED_AFTER_FAILURES: u32 = 3;

/// How a watcher obtains its baseline
#[derive(Debug, Clone)]
pub enum BaselinePolicy {
    /// Learn mean and spread over a window of snapshots
    Learned {
        window: Duration,
        min_samples: u64,
        /// Extra windows granted before settling for a degraded baseline
        max_extensions: u32,
    },
    /// Expected value zero, ready immediately
    Absence,
}

#[derive(Debug, Clone)]
pub struct WatcherSpec {
    /// Metric name used in topics, fingerprints and health entries
    pub name: String,
    pub kind: MetricKind,
    pub interval: Duration,
    pub baseline: BaselinePolicy,
    /// Spread-units around the mean reported as the event's baseline range
    pub range_sigma: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Learning,
    Ready,
    Running,
    Stopped,
}

/// What one tick did
#[derive(Debug, Clone)]
pub enum TickOutcome {
    SourceUnavailable(SourceError),
    /// Snapshot fed to the learner
    Learning,
    /// Learning finished on this tick
    BaselineReady(Baseline),
    /// Classified, nothing anomalous
    Normal,
    /// Every anomaly found on this tick, in publish order
    Published(Vec<AnomalyEvent>),
    /// The bus is closed; the watcher has stopped
    Stopped,
}

pub struct Watcher {
    spec: WatcherSpec,
    source: Arc<dyn MetricSource>,
    detector: Box<dyn Detector>,
    bus: EventBus,
    sample_timeout: Duration,
    state: WatcherState,
    learner: Option<BaselineLearner>,
    baseline: Option<Baseline>,
    consecutive_failures: u32,
    health: Option<HealthRegistry>,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
}

impl Watcher {
    pub fn new(
        spec: WatcherSpec,
        source: Arc<dyn MetricSource>,
        detector: Box<dyn Detector>,
        bus: EventBus,
        sample_timeout: Duration,
    ) -> Self {
        let (state, learner, baseline) = match &spec.baseline {
            BaselinePolicy::Learned {
                window,
                min_samples,
                ..
            } => (
                WatcherState::Learning,
                Some(BaselineLearner::new(spec.name.clone(), *window, *min_samples)),
                None,
            ),
            BaselinePolicy::Absence => (
                WatcherState::Ready,
                None,
                Some(Baseline::absence(spec.name.clone(), Utc::now())),
            ),
        };

        Self {
            spec,
            source,
            detector,
            bus,
            sample_timeout,
            state,
            learner,
            baseline,
            consecutive_failures: 0,
            health: None,
            metrics: MonitorMetrics::new(),
            logger: StructuredLogger::new("localhost"),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Skip learning and classify against `baseline` from the first tick
    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.learner = None;
        self.baseline = Some(baseline);
        self.state = WatcherState::Ready;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    fn health_name(&self) -> String {
        components::watcher(&self.spec.name)
    }

    /// Run one sampling tick
    pub async fn tick(&mut self) -> TickOutcome {
        if self.state == WatcherState::Stopped {
            return TickOutcome::Stopped;
        }

        let snapshot = match self.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.on_source_failure(e).await,
        };
        self.on_source_success().await;

        match self.state {
            WatcherState::Learning => self.learn(&snapshot).await,
            WatcherState::Ready => {
                debug!(metric = %self.spec.name, "Watcher running");
                self.state = WatcherState::Running;
                self.detect(&snapshot)
            }
            WatcherState::Running => self.detect(&snapshot),
            WatcherState::Stopped => TickOutcome::Stopped,
        }
    }

    async fn sample(&mut self) -> Result<Snapshot, SourceError> {
        let start = Instant::now();
        let result = match tokio::time::timeout(
            self.sample_timeout,
            self.source.sample(self.spec.kind),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout {
                metric: self.spec.kind,
                timeout_ms: self.sample_timeout.as_millis() as u64,
            }),
        };
        if result.is_ok() {
            self.metrics
                .observe_sample(&self.spec.name, start.elapsed().as_secs_f64());
        }
        result
    }

    async fn on_source_failure(&mut self, error: SourceError) -> TickOutcome {
        self.consecutive_failures += 1;
        self.metrics.inc_sample_errors(&self.spec.name);
        warn!(
            metric = %self.spec.name,
            error = %error,
            consecutive = self.consecutive_failures,
            "Metric source unavailable, skipping tick"
        );

        if self.consecutive_failures == DEGRADED_AFTER_FAILURES {
            let name = self.health_name();
            let message = format!(
                "{} consecutive sample failures: {}",
                self.consecutive_failures, error
            );
            if let Some(health) = &self.health {
                health.set_degraded(&name, message).await;
            }
        }
        TickOutcome::SourceUnavailable(error)
    }

    async fn on_source_success(&mut self) {
        if self.consecutive_failures == 0 {
            return;
        }
        let recovered = self.consecutive_failures >= DEGRADED_AFTER_FAILURES;
        self.consecutive_failures = 0;

        if recovered {
            info!(metric = %self.spec.name, "Metric source recovered");
            let degraded_baseline = self.baseline.as_ref().is_some_and(|b| b.degraded);
            let name = self.health_name();
            if let Some(health) = &self.health {
                if degraded_baseline {
                    health.set_degraded(&name, "running on a degraded baseline").await;
                } else {
                    health.set_healthy(&name).await;
                }
            }
        }
    }

    async fn learn(&mut self, snapshot: &Snapshot) -> TickOutcome {
        let (max_extensions, min_samples) = match &self.spec.baseline {
            BaselinePolicy::Learned {
                max_extensions,
                min_samples,
                ..
            } => (*max_extensions, *min_samples),
            BaselinePolicy::Absence => (0, 0),
        };
        let Some(learner) = self.learner.as_mut() else {
            return TickOutcome::Learning;
        };
        learner.observe(snapshot);

        if !learner.window_elapsed() {
            return TickOutcome::Learning;
        }

        let baseline = match learner.finalize() {
            Ok(baseline) => baseline,
            Err(BaselineError::InsufficientData { needed, have })
                if learner.extensions() < max_extensions =>
            {
                learner.extend();
                warn!(
                    metric = %self.spec.name,
                    needed,
                    have,
                    extension = learner.extensions(),
                    "Learning window ended with too few samples, extending"
                );
                return TickOutcome::Learning;
            }
            Err(BaselineError::InsufficientData { .. }) => match learner.finalize_degraded() {
                Some(baseline) => baseline,
                None => return TickOutcome::Learning,
            },
        };

        if baseline.degraded {
            self.logger.log_degraded_baseline(&baseline, min_samples);
            let name = self.health_name();
            if let Some(health) = &self.health {
                health.set_degraded(&name, "running on a degraded baseline").await;
            }
        } else {
            self.logger.log_baseline_established(&baseline);
        }

        self.learner = None;
        self.baseline = Some(baseline.clone());
        self.state = WatcherState::Ready;
        TickOutcome::BaselineReady(baseline)
    }

    fn detect(&mut self, snapshot: &Snapshot) -> TickOutcome {
        let Some(baseline) = self.baseline.as_ref() else {
            return TickOutcome::Normal;
        };
        let classifications = self.detector.classify_all(baseline, snapshot);
        if classifications.is_empty() {
            return TickOutcome::Normal;
        }

        let range = baseline.range(self.spec.range_sigma);
        let mut published = Vec::with_capacity(classifications.len());
        for classification in classifications {
            let event = AnomalyEvent::from_classification(
                &self.spec.name,
                snapshot.timestamp,
                range,
                classification,
            );

            if let Err(e) = self
                .bus
                .publish(&event.topic(), BusEvent::Anomaly(event.clone()))
            {
                debug!(metric = %self.spec.name, error = %e, "Publish rejected, stopping watcher");
                self.state = WatcherState::Stopped;
                return TickOutcome::Stopped;
            }
            self.metrics.inc_anomalies(&self.spec.name, event.severity);
            self.logger.log_anomaly(&event);
            published.push(event);
        }
        TickOutcome::Published(published)
    }

    /// Tick on the configured interval until shutdown is signalled or the
    /// bus closes
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> WatcherState {
        info!(
            metric = %self.spec.name,
            interval_ms = self.spec.interval.as_millis() as u64,
            state = ?self.state,
            "Starting watcher"
        );
        let name = self.health_name();
        if let Some(health) = &self.health {
            health.register(&name).await;
        }
        self.metrics.watcher_started();

        let mut ticker = interval(self.spec.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    // A sample in flight is abandoned once shutdown is requested
                    let outcome = tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        outcome = self.tick() => outcome,
                    };
                    if matches!(outcome, TickOutcome::Stopped) {
                        break;
                    }
                }
            }
        }

        self.state = WatcherState::Stopped;
        self.metrics.watcher_stopped();
        info!(metric = %self.spec.name, "Watcher stopped");
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{
        AnomalyClassification, CompositeDetector, CrashLoopDetector, NewProcessDetector,
        ThresholdDetector, ZombieDetector,
    };
    use crate::config::{
        BusConfig, CrashLoopPolicy, NewProcessPolicy, ThresholdPolicy, ZombiePolicy,
    };
    use crate::models::AnomalyCategory;
    use crate::events::{EventHandler, TopicFilter};
    use crate::health::ComponentStatus;
    use crate::models::{ProcessSample, Severity};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Source that replays scripted results, then repeats the last one
    struct Scripted {
        results: Mutex<VecDeque<Result<f64, ()>>>,
        last: Mutex<Result<f64, ()>>,
        start: chrono::DateTime<Utc>,
        ticks: Mutex<i64>,
        step_secs: i64,
    }

    impl Scripted {
        fn new(results: Vec<Result<f64, ()>>, step_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                last: Mutex::new(Err(())),
                start: Utc::now(),
                ticks: Mutex::new(0),
                step_secs,
            })
        }
    }

    #[async_trait]
    impl MetricSource for Scripted {
        async fn sample(&self, kind: MetricKind) -> Result<Snapshot, SourceError> {
            let next = {
                let mut results = self.results.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                if let Some(r) = results.pop_front() {
                    *last = r;
                }
                *last
            };
            let timestamp = {
                let mut ticks = self.ticks.lock().unwrap();
                *ticks += 1;
                self.start + chrono::Duration::seconds(*ticks * self.step_secs)
            };
            match next {
                Ok(value) => Ok(Snapshot::cpu(timestamp, value)),
                Err(()) => Err(SourceError::unavailable(kind, "scripted failure")),
            }
        }
    }

    struct Never;

    #[async_trait]
    impl MetricSource for Never {
        async fn sample(&self, _kind: MetricKind) -> Result<Snapshot, SourceError> {
            std::future::pending().await
        }
    }

    struct Zombies;

    #[async_trait]
    impl MetricSource for Zombies {
        async fn sample(&self, _kind: MetricKind) -> Result<Snapshot, SourceError> {
            Ok(Snapshot::processes(
                Utc::now(),
                vec![ProcessSample {
                    pid: 77,
                    name: "defunct".to_string(),
                    state: 'Z',
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    rss_bytes: 0,
                }],
            ))
        }
    }

    /// Replays process tables, then repeats the last one
    struct ProcessTables(Mutex<VecDeque<Vec<ProcessSample>>>);

    #[async_trait]
    impl MetricSource for ProcessTables {
        async fn sample(&self, _kind: MetricKind) -> Result<Snapshot, SourceError> {
            let mut tables = self.0.lock().unwrap();
            let table = if tables.len() > 1 {
                tables.pop_front().unwrap_or_default()
            } else {
                tables.front().cloned().unwrap_or_default()
            };
            Ok(Snapshot::processes(Utc::now(), table))
        }
    }

    fn running(pid: u32, name: &str, cpu_percent: f64) -> ProcessSample {
        ProcessSample {
            pid,
            name: name.to_string(),
            state: 'S',
            cpu_percent,
            memory_percent: 0.0,
            rss_bytes: 8 * 1024 * 1024,
        }
    }

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default()).unwrap()
    }

    fn learned_spec(window_secs: u64, min_samples: u64, max_extensions: u32) -> WatcherSpec {
        WatcherSpec {
            name: "cpu".to_string(),
            kind: MetricKind::Cpu,
            interval: Duration::from_secs(1),
            baseline: BaselinePolicy::Learned {
                window: Duration::from_secs(window_secs),
                min_samples,
                max_extensions,
            },
            range_sigma: 2.0,
        }
    }

    fn cpu_watcher(source: Arc<dyn MetricSource>, spec: WatcherSpec, bus: EventBus) -> Watcher {
        Watcher::new(
            spec,
            source,
            Box::new(ThresholdDetector::cpu(ThresholdPolicy::default())),
            bus,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_learning_then_running() {
        // 10% +/- 2% over 5 synthetic minutes, then 11% and 18%
        let mut script: Vec<Result<f64, ()>> = (0..30)
            .map(|i| Ok(if i % 2 == 0 { 8.0 } else { 12.0 }))
            .collect();
        script.push(Ok(11.0));
        script.push(Ok(18.0));
        let source = Scripted::new(script, 10);
        let mut watcher = cpu_watcher(source, learned_spec(290, 10, 0), bus());

        assert_eq!(watcher.state(), WatcherState::Learning);
        let mut ready = None;
        for _ in 0..30 {
            if let TickOutcome::BaselineReady(baseline) = watcher.tick().await {
                ready = Some(baseline);
            }
        }
        let baseline = ready.expect("baseline should be ready after the window");
        assert!((baseline.mean - 10.0).abs() < 1e-9);
        assert!((baseline.spread - 2.0).abs() < 1e-9);
        assert_eq!(baseline.sample_count, 30);
        assert!(!baseline.degraded);
        assert_eq!(watcher.state(), WatcherState::Ready);

        assert!(matches!(watcher.tick().await, TickOutcome::Normal));
        assert_eq!(watcher.state(), WatcherState::Running);

        match watcher.tick().await {
            TickOutcome::Published(events) => {
                assert_eq!(events.len(), 1);
                let event = &events[0];
                assert_eq!(event.severity, Severity::Critical);
                assert_eq!(event.metric, "cpu");
                assert!((event.baseline.low - 6.0).abs() < 1e-6);
                assert!((event.baseline.high - 14.0).abs() < 1e-6);
            }
            other => panic!("expected a published anomaly, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_classification_while_learning() {
        let source = Scripted::new(vec![Ok(99.0)], 1);
        let mut watcher = cpu_watcher(source, learned_spec(300, 10, 0), bus());
        for _ in 0..20 {
            assert!(matches!(watcher.tick().await, TickOutcome::Learning));
        }
        assert!(watcher.baseline().is_none());
    }

    #[tokio::test]
    async fn test_insufficient_data_extends_then_degrades() {
        // One sample per 100s against a 200s window needing 10 samples
        let source = Scripted::new(vec![Ok(5.0)], 100);
        let health = HealthRegistry::new();
        let mut watcher =
            cpu_watcher(source, learned_spec(200, 10, 1), bus()).with_health(health.clone());

        let mut degraded = None;
        for _ in 0..10 {
            if let TickOutcome::BaselineReady(baseline) = watcher.tick().await {
                degraded = Some(baseline);
                break;
            }
        }
        let baseline = degraded.expect("degraded baseline after the extension");
        assert!(baseline.degraded);
        assert!(baseline.sample_count < 10);
        assert_eq!(
            health.component("watcher.cpu").await.unwrap().status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_source_failures_skip_ticks_and_keep_baseline() {
        let source = Scripted::new(vec![Err(()), Err(()), Err(()), Ok(10.0)], 1);
        let health = HealthRegistry::new();
        let mut watcher = cpu_watcher(source, learned_spec(300, 10, 0), bus())
            .with_health(health.clone())
            .with_baseline(Baseline::fixed("cpu", 10.0, 2.0, Utc::now()));

        for _ in 0..3 {
            assert!(matches!(
                watcher.tick().await,
                TickOutcome::SourceUnavailable(SourceError::Unavailable { .. })
            ));
        }
        assert_eq!(
            health.component("watcher.cpu").await.unwrap().status,
            ComponentStatus::Degraded
        );
        assert_eq!(watcher.baseline().unwrap().mean, 10.0);

        assert!(matches!(watcher.tick().await, TickOutcome::Normal));
        assert_eq!(
            health.component("watcher.cpu").await.unwrap().status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_timeout() {
        let mut watcher = cpu_watcher(Arc::new(Never), learned_spec(300, 10, 0), bus());
        assert!(matches!(
            watcher.tick().await,
            TickOutcome::SourceUnavailable(SourceError::Timeout { timeout_ms: 1000, .. })
        ));
    }

    #[tokio::test]
    async fn test_absence_watcher_classifies_immediately() {
        let spec = WatcherSpec {
            name: "zombies".to_string(),
            kind: MetricKind::Processes,
            interval: Duration::from_secs(5),
            baseline: BaselinePolicy::Absence,
            range_sigma: 0.0,
        };
        let mut watcher = Watcher::new(
            spec,
            Arc::new(Zombies),
            Box::new(ZombieDetector::new(ZombiePolicy::default())),
            bus(),
            Duration::from_secs(1),
        );
        assert_eq!(watcher.state(), WatcherState::Ready);
        match watcher.tick().await {
            TickOutcome::Published(events) => {
                assert_eq!(events[0].severity, Severity::Warning);
                assert_eq!(events[0].topic(), "anomaly.zombies");
            }
            other => panic!("expected zombie anomaly, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_one_tick_publishes_every_finding() {
        let tables = ProcessTables(Mutex::new(
            vec![
                vec![running(1, "init", 0.0), running(100, "worker", 1.0)],
                vec![running(1, "init", 0.0), running(300, "ffmpeg", 64.0)],
            ]
            .into(),
        ));
        let spec = WatcherSpec {
            name: "processes".to_string(),
            kind: MetricKind::Processes,
            interval: Duration::from_secs(3),
            baseline: BaselinePolicy::Absence,
            range_sigma: 0.0,
        };
        let detector = CompositeDetector::independent(vec![
            Box::new(CrashLoopDetector::new(CrashLoopPolicy::default())),
            Box::new(NewProcessDetector::new(NewProcessPolicy::default())),
        ]);
        let mut watcher = Watcher::new(
            spec,
            Arc::new(tables),
            Box::new(detector),
            bus(),
            Duration::from_secs(1),
        );

        assert!(matches!(watcher.tick().await, TickOutcome::Normal));
        match watcher.tick().await {
            TickOutcome::Published(events) => {
                let categories: Vec<_> = events.iter().map(|e| e.category).collect();
                assert_eq!(
                    categories,
                    vec![AnomalyCategory::ProcessCrash, AnomalyCategory::NewProcess]
                );
                assert_eq!(events[0].details.pids, vec![100]);
                assert_eq!(events[1].details.culprit.as_ref().unwrap().name, "ffmpeg");
                assert_ne!(events[0].fingerprint, events[1].fingerprint);
            }
            other => panic!("expected two anomalies, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_bus_stops_watcher() {
        let bus = bus();
        let source = Scripted::new(vec![Ok(50.0)], 1);
        let mut watcher = cpu_watcher(source, learned_spec(300, 10, 0), bus.clone())
            .with_baseline(Baseline::fixed("cpu", 10.0, 2.0, Utc::now()));

        bus.close();
        assert!(matches!(watcher.tick().await, TickOutcome::Stopped));
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert!(matches!(watcher.tick().await, TickOutcome::Stopped));
    }

    struct Collect(Mutex<Vec<AnomalyEvent>>);

    #[async_trait]
    impl EventHandler for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn handle(&self, event: &BusEvent) -> anyhow::Result<()> {
            if let Some(anomaly) = event.as_anomaly() {
                self.0.lock().unwrap().push(anomaly.clone());
            }
            Ok(())
        }
    }

    /// Always reports the same warning
    struct AlwaysWarn;

    impl Detector for AlwaysWarn {
        fn classify(&mut self, _: &Baseline, snapshot: &Snapshot) -> Option<AnomalyClassification> {
            Some(AnomalyClassification {
                category: crate::models::AnomalyCategory::CpuSpike,
                severity: Severity::Warning,
                observed: snapshot.primary_value(),
                subject: None,
                bucket: 0,
                description: "always".to_string(),
                details: Default::default(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let bus = bus();
        let collected = Arc::new(Collect(Mutex::new(Vec::new())));
        bus.subscribe(TopicFilter::parse("anomaly.*"), collected.clone());

        let watcher = Watcher::new(
            learned_spec(300, 10, 0),
            Scripted::new(vec![Ok(10.0)], 1),
            Box::new(AlwaysWarn),
            bus.clone(),
            Duration::from_secs(1),
        )
        .with_baseline(Baseline::fixed("cpu", 10.0, 2.0, Utc::now()));

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(watcher.run(rx));

        // Ticks at 0s, 1s and 2s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), WatcherState::Stopped);

        bus.shutdown(Duration::from_secs(1)).await;
        assert_eq!(collected.0.lock().unwrap().len(), 3);
    }
}
