//! Monitor orchestration
//!
//! Wires the metric source, watchers, event bus, handlers and investigation
//! gate together, starts every watcher as its own task and shuts the whole
//! pipeline down in order.

use super::task::{BaselinePolicy, Watcher, WatcherSpec, WatcherState};
use crate::anomaly::{
    CompositeDetector, CrashLoopDetector, Detector, LeakDetector, NewProcessDetector,
    ThresholdDetector, ZombieDetector,
};
use crate::collector::MetricSource;
use crate::config::{MonitorConfig, ThresholdMetricConfig};
use crate::events::{EventBus, EventHandler, TopicFilter};
use crate::handlers::{ConsolePresenter, EventLogHandler, InvestigationHandler};
use crate::health::{components, HealthRegistry};
use crate::investigation::{AnalysisEngine, InvestigationGate};
use crate::models::MetricKind;
use crate::observability::StructuredLogger;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

/// Capacity of the investigation report channel
const REPORT_BUFFER: usize = 64;

fn learned(config: &MonitorConfig) -> BaselinePolicy {
    BaselinePolicy::Learned {
        window: config.learning.window(),
        min_samples: config.learning.min_samples,
        max_extensions: config.learning.max_extensions,
    }
}

fn threshold_spec(
    name: &str,
    kind: MetricKind,
    metric: &ThresholdMetricConfig,
    config: &MonitorConfig,
) -> WatcherSpec {
    WatcherSpec {
        name: name.to_string(),
        kind,
        interval: metric.interval(),
        baseline: learned(config),
        range_sigma: metric.policy.warning_sigma,
    }
}

fn presence_spec(name: &str, interval: Duration) -> WatcherSpec {
    WatcherSpec {
        name: name.to_string(),
        kind: MetricKind::Processes,
        interval,
        baseline: BaselinePolicy::Absence,
        range_sigma: 0.0,
    }
}

/// Watchers enabled by `config`
fn default_watchers(config: &MonitorConfig) -> Vec<(WatcherSpec, Box<dyn Detector>)> {
    let mut watchers: Vec<(WatcherSpec, Box<dyn Detector>)> = Vec::new();

    if config.cpu.enabled {
        watchers.push((
            threshold_spec("cpu", MetricKind::Cpu, &config.cpu, config),
            Box::new(ThresholdDetector::cpu(config.cpu.policy.clone())),
        ));
    }
    if config.memory.enabled {
        let mut detectors: Vec<Box<dyn Detector>> =
            vec![Box::new(ThresholdDetector::memory(config.memory.policy.clone()))];
        if config.memory_leak.enabled {
            detectors.push(Box::new(LeakDetector::new(config.memory_leak.clone())));
        }
        watchers.push((
            threshold_spec("memory", MetricKind::Memory, &config.memory, config),
            Box::new(CompositeDetector::new(detectors)),
        ));
    }
    if config.load.enabled {
        watchers.push((
            threshold_spec("load", MetricKind::Load, &config.load, config),
            Box::new(ThresholdDetector::load(config.load.policy.clone())),
        ));
    }
    if config.zombies.enabled {
        watchers.push((
            presence_spec("zombies", config.zombies.interval()),
            Box::new(ZombieDetector::new(config.zombies.clone())),
        ));
    }
    // Exits, restarts and new heavy processes share one process table scan
    let mut process_detectors: Vec<Box<dyn Detector>> = Vec::new();
    if config.restarts.enabled {
        process_detectors.push(Box::new(CrashLoopDetector::new(config.restarts.clone())));
    }
    if config.new_processes.enabled {
        process_detectors.push(Box::new(NewProcessDetector::new(
            config.new_processes.clone(),
        )));
    }
    if !process_detectors.is_empty() {
        watchers.push((
            presence_spec("processes", config.restarts.interval()),
            Box::new(CompositeDetector::independent(process_detectors)),
        ));
    }

    watchers
}

/// Builder for creating a [`Monitor`]
pub struct MonitorBuilder {
    config: MonitorConfig,
    source: Option<Arc<dyn MetricSource>>,
    engine: Option<Arc<dyn AnalysisEngine>>,
    node_name: String,
    health: Option<HealthRegistry>,
    default_watchers: bool,
    watchers: Vec<(WatcherSpec, Box<dyn Detector>)>,
    handlers: Vec<(TopicFilter, Arc<dyn EventHandler>)>,
}

impl MonitorBuilder {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            source: None,
            engine: None,
            node_name: "localhost".to_string(),
            health: None,
            default_watchers: true,
            watchers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Set the metric source (required)
    pub fn source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the analysis engine; investigation is off without one
    pub fn engine(mut self, engine: Arc<dyn AnalysisEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Do not add the watchers derived from configuration
    pub fn without_default_watchers(mut self) -> Self {
        self.default_watchers = false;
        self
    }

    /// Add a watcher in addition to the configured ones
    pub fn watcher(mut self, spec: WatcherSpec, detector: Box<dyn Detector>) -> Self {
        self.watchers.push((spec, detector));
        self
    }

    /// Subscribe an additional handler
    pub fn handler(mut self, filter: TopicFilter, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push((filter, handler));
        self
    }

    /// Build the monitor
    ///
    /// Fails only if the event bus cannot be created or the event log
    /// cannot be opened.
    pub async fn build(self) -> Result<Monitor> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Metric source is required"))?;
        let config = self.config;
        let health = self.health.unwrap_or_default();
        let logger = StructuredLogger::new(self.node_name.clone());

        let bus = EventBus::new(config.bus.clone()).context("Failed to create event bus")?;
        health.register(components::EVENT_BUS).await;

        if let Some(path) = &config.event_log_path {
            let log = EventLogHandler::open(path).await?;
            bus.subscribe(TopicFilter::All, Arc::new(log));
        }

        let console = config.console.then(|| Arc::new(ConsolePresenter::stdout()));
        if let Some(console) = &console {
            bus.subscribe(TopicFilter::All, console.clone());
        }

        let mut report_task = None;
        let gate = match (&self.engine, config.investigation.enabled) {
            (Some(engine), true) => {
                let mut gate = InvestigationGate::new(
                    config.investigation.clone(),
                    Arc::clone(engine),
                    self.node_name.clone(),
                )
                .with_context_source(Arc::clone(&source))
                .with_health(health.clone());

                if let Some(console) = &console {
                    let (tx, rx) = mpsc::channel(REPORT_BUFFER);
                    gate = gate.with_reports(tx);
                    let console = Arc::clone(console);
                    report_task = Some(tokio::spawn(async move { console.run_reports(rx).await }));
                }

                let gate = Arc::new(gate);
                gate.restore().await;
                health.register(components::INVESTIGATION_GATE).await;
                bus.subscribe(
                    TopicFilter::parse("anomaly.*"),
                    Arc::new(InvestigationHandler::new(Arc::clone(&gate))),
                );
                info!(engine = %engine.name(), "Investigation enabled");
                Some(gate)
            }
            (None, true) => {
                info!("No analysis engine configured, investigation disabled");
                None
            }
            _ => None,
        };

        for (filter, handler) in self.handlers {
            bus.subscribe(filter, handler);
        }

        let mut specs = if self.default_watchers {
            default_watchers(&config)
        } else {
            Vec::new()
        };
        specs.extend(self.watchers);

        let watchers = specs
            .into_iter()
            .map(|(spec, detector)| {
                Watcher::new(
                    spec,
                    Arc::clone(&source),
                    detector,
                    bus.clone(),
                    config.sample_timeout(),
                )
                .with_health(health.clone())
                .with_logger(logger.clone())
            })
            .collect();

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Monitor {
            config,
            bus,
            gate,
            health,
            logger,
            pending: watchers,
            tasks: Vec::new(),
            report_task,
            shutdown_tx,
        })
    }
}

/// Running host monitor
pub struct Monitor {
    config: MonitorConfig,
    bus: EventBus,
    gate: Option<Arc<InvestigationGate>>,
    health: HealthRegistry,
    logger: StructuredLogger,
    /// Watchers built but not yet started
    pending: Vec<Watcher>,
    tasks: Vec<(String, JoinHandle<WatcherState>)>,
    report_task: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Monitor {
    pub fn builder(config: MonitorConfig) -> MonitorBuilder {
        MonitorBuilder::new(config)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn gate(&self) -> Option<&Arc<InvestigationGate>> {
        self.gate.as_ref()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Names of every watcher, started or not
    pub fn watcher_names(&self) -> Vec<String> {
        self.pending
            .iter()
            .map(|w| w.name().to_string())
            .chain(self.tasks.iter().map(|(name, _)| name.clone()))
            .collect()
    }

    /// Spawn every watcher as an independent task
    pub async fn start(&mut self) {
        for watcher in std::mem::take(&mut self.pending) {
            let name = watcher.name().to_string();
            let shutdown = self.shutdown_tx.subscribe();
            self.tasks.push((name, tokio::spawn(watcher.run(shutdown))));
        }

        self.health.set_ready(true).await;
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), &self.watcher_names());
    }

    /// Stop publishing, stop watchers, drain handlers and in-flight analyses
    ///
    /// Everything still running when `grace` runs out is aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        self.logger.log_shutdown("shutdown requested");
        self.health.set_ready(false).await;
        let deadline = Instant::now() + grace;

        // No publish succeeds from here on
        self.bus.close();
        let _ = self.shutdown_tx.send(());

        for (name, mut task) in self.tasks.drain(..) {
            if timeout_at(deadline, &mut task).await.is_err() {
                warn!(metric = %name, "Watcher did not stop within grace period, aborting");
                task.abort();
            }
        }

        self.bus
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await;

        if let Some(gate) = &self.gate {
            gate.shutdown(deadline.saturating_duration_since(Instant::now()))
                .await;
        }

        if let Some(mut task) = self.report_task.take() {
            // Reports already queued get printed; the gate keeps its sender
            let _ = tokio::time::timeout(Duration::from_millis(50), &mut task).await;
            task.abort();
        }

        self.health
            .set_unhealthy(components::EVENT_BUS, "event bus closed")
            .await;
        info!("Monitor stopped");
    }
}
