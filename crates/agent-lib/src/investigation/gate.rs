//! Investigation gate
//!
//! Decides per anomaly whether the analysis engine runs. Decision order:
//! severity threshold, fingerprint cache, rate limit, dispatch. Cache lookup,
//! rate limiting and marking a fingerprint pending happen under one lock so
//! concurrent anomalies with the same fingerprint dispatch at most once.

use super::cache::{self, CacheExpiry, InvestigationCache, Lookup};
use super::engine::{AnalysisContext, AnalysisEngine, AnalysisResult, SystemOverview};
use super::rate_limit::RateLimiter;
use crate::collector::MetricSource;
use crate::config::InvestigationConfig;
use crate::error::EngineError;
use crate::health::{components, HealthRegistry};
use crate::models::AnomalyEvent;
use crate::observability::{MonitorMetrics, StructuredLogger};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BelowThreshold,
    RateLimited,
    /// A recent analysis for this fingerprint failed
    EngineFailure,
    /// An analysis for this fingerprint is already running
    InFlight,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::BelowThreshold => "below_threshold",
            SkipReason::RateLimited => "rate_limited",
            SkipReason::EngineFailure => "engine_failure",
            SkipReason::InFlight => "in_flight",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvestigationOutcome {
    Skipped(SkipReason),
    Cached(Arc<AnalysisResult>),
    Dispatched,
}

impl InvestigationOutcome {
    /// Metric label for this outcome
    pub fn label(&self) -> &'static str {
        match self {
            InvestigationOutcome::Skipped(SkipReason::BelowThreshold) => "skipped_below_threshold",
            InvestigationOutcome::Skipped(SkipReason::RateLimited) => "skipped_rate_limited",
            InvestigationOutcome::Skipped(SkipReason::EngineFailure) => "skipped_engine_failure",
            InvestigationOutcome::Skipped(SkipReason::InFlight) => "skipped_in_flight",
            InvestigationOutcome::Cached(_) => "cached",
            InvestigationOutcome::Dispatched => "dispatched",
        }
    }
}

impl fmt::Display for InvestigationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvestigationOutcome::Skipped(reason) => write!(f, "skipped ({})", reason.as_str()),
            InvestigationOutcome::Cached(_) => f.write_str("cached"),
            InvestigationOutcome::Dispatched => f.write_str("dispatched"),
        }
    }
}

/// A finished (or cache-served) investigation, for presentation
#[derive(Debug, Clone)]
pub struct InvestigationReport {
    pub event: AnomalyEvent,
    pub result: Result<Arc<AnalysisResult>, EngineError>,
    pub cached: bool,
    /// Sightings of this fingerprint in the current cache window
    pub seen: u64,
}

struct GateState {
    cache: InvestigationCache,
    limiter: RateLimiter,
}

pub struct InvestigationGate {
    config: InvestigationConfig,
    engine: Arc<dyn AnalysisEngine>,
    node_name: String,
    state: Mutex<GateState>,
    tasks: Mutex<JoinSet<()>>,
    context_source: Option<Arc<dyn MetricSource>>,
    reports: Option<mpsc::Sender<InvestigationReport>>,
    health: Option<HealthRegistry>,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
}

impl InvestigationGate {
    pub fn new(
        config: InvestigationConfig,
        engine: Arc<dyn AnalysisEngine>,
        node_name: impl Into<String>,
    ) -> Self {
        let node_name = node_name.into();
        let expiry = CacheExpiry {
            ready: config.cache_expiry(),
            failed: config.failure_expiry(),
            // Two engine attempts plus context gathering
            pending: config.engine_timeout() * 2 + config.context_timeout(),
        };
        let limiter = RateLimiter::new(config.rate_limit_window(), config.rate_limit_max);

        Self {
            engine,
            state: Mutex::new(GateState {
                cache: InvestigationCache::new(expiry),
                limiter,
            }),
            tasks: Mutex::new(JoinSet::new()),
            context_source: None,
            reports: None,
            health: None,
            metrics: MonitorMetrics::new(),
            logger: StructuredLogger::new(node_name.clone()),
            node_name,
            config,
        }
    }

    /// Attach a source for the system overview sent with each request
    pub fn with_context_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.context_source = Some(source);
        self
    }

    /// Emit finished investigations on `reports`
    pub fn with_reports(mut self, reports: mpsc::Sender<InvestigationReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Decide what to do about one anomaly
    ///
    /// Never waits on the engine; dispatched analyses run as background
    /// tasks. Must be called from within a tokio runtime.
    pub fn consider(self: &Arc<Self>, event: &AnomalyEvent) -> InvestigationOutcome {
        let outcome = self.decide(event);
        self.metrics.inc_investigations(outcome.label());
        debug!(
            fingerprint = %event.fingerprint.short(),
            severity = %event.severity,
            outcome = %outcome,
            "Investigation gate decision"
        );
        outcome
    }

    fn decide(self: &Arc<Self>, event: &AnomalyEvent) -> InvestigationOutcome {
        if event.severity < self.config.min_severity {
            return InvestigationOutcome::Skipped(SkipReason::BelowThreshold);
        }

        let now = Instant::now();
        let seen = {
            let Ok(mut state) = self.state.lock() else {
                warn!("Investigation state lock poisoned");
                return InvestigationOutcome::Skipped(SkipReason::EngineFailure);
            };

            let lookup = state.cache.lookup(&event.fingerprint, now);
            match lookup {
                Lookup::Ready { result, seen } => {
                    drop(state);
                    self.logger
                        .log_investigation(&event.fingerprint, "cached", seen);
                    self.emit(InvestigationReport {
                        event: event.clone(),
                        result: Ok(Arc::clone(&result)),
                        cached: true,
                        seen,
                    });
                    return InvestigationOutcome::Cached(result);
                }
                Lookup::Pending => return InvestigationOutcome::Skipped(SkipReason::InFlight),
                Lookup::Failed => return InvestigationOutcome::Skipped(SkipReason::EngineFailure),
                Lookup::Miss => {}
            }

            if !state.limiter.try_acquire(now) {
                return InvestigationOutcome::Skipped(SkipReason::RateLimited);
            }

            state.cache.begin(event.fingerprint.clone(), now);
            state.cache.purge_expired(now);
            1
        };

        let gate = Arc::clone(self);
        let event = event.clone();
        match self.tasks.lock() {
            Ok(mut tasks) => {
                // Reap finished analyses so the set stays small
                while tasks.try_join_next().is_some() {}
                tasks.spawn(async move { gate.investigate(event, seen).await });
            }
            Err(_) => {
                tokio::spawn(async move { gate.investigate(event, seen).await });
            }
        }

        InvestigationOutcome::Dispatched
    }

    async fn investigate(self: Arc<Self>, event: AnomalyEvent, seen: u64) {
        let system = match &self.context_source {
            Some(source) => {
                SystemOverview::sample(source.as_ref(), self.config.context_timeout()).await
            }
            None => None,
        };
        let context = AnalysisContext {
            node_name: self.node_name.clone(),
            baseline: event.baseline,
            system,
            seen_count: seen,
        };

        let mut outcome = self.call_engine(&event, &context).await;
        if matches!(&outcome, Err(e) if e.is_timeout()) {
            info!(fingerprint = %event.fingerprint.short(), "Engine timed out, retrying once");
            outcome = self.call_engine(&event, &context).await;
        }

        let now = Instant::now();
        let report = match outcome {
            Ok(result) => {
                let result = Arc::new(result);
                let seen = match self.state.lock() {
                    Ok(mut state) => {
                        state
                            .cache
                            .complete(&event.fingerprint, Arc::clone(&result), now)
                    }
                    Err(_) => seen,
                };
                self.logger
                    .log_investigation(&event.fingerprint, "completed", seen);
                if let Some(health) = &self.health {
                    health.set_healthy(components::INVESTIGATION_GATE).await;
                }
                InvestigationReport {
                    event,
                    result: Ok(result),
                    cached: false,
                    seen,
                }
            }
            Err(error) => {
                let seen = match self.state.lock() {
                    Ok(mut state) => state.cache.fail(&event.fingerprint, error.to_string(), now),
                    Err(_) => seen,
                };
                self.metrics.inc_engine_failures();
                self.logger
                    .log_engine_failure(&event.fingerprint, &error.to_string());
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::INVESTIGATION_GATE, error.to_string())
                        .await;
                }
                InvestigationReport {
                    event,
                    result: Err(error),
                    cached: false,
                    seen,
                }
            }
        };

        self.emit(report);
    }

    async fn call_engine(
        &self,
        event: &AnomalyEvent,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, EngineError> {
        let limit = self.config.engine_timeout();
        match tokio::time::timeout(limit, self.engine.analyze(event, context)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(limit.as_secs())),
        }
    }

    fn emit(&self, report: InvestigationReport) {
        if let Some(reports) = &self.reports {
            if reports.try_send(report).is_err() {
                debug!("Investigation report dropped, no room or no listener");
            }
        }
    }

    /// Restore completed investigations saved by an earlier run
    pub async fn load_cache(&self, path: &Path) -> anyhow::Result<usize> {
        let records = cache::load_records(path).await?;
        let available = records.len();
        let restored = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("Investigation state lock poisoned"))?;
            state.cache.restore(records, Instant::now(), chrono::Utc::now())
        };
        info!(
            path = %path.display(),
            restored,
            expired = available - restored,
            "Investigation cache restored"
        );
        Ok(restored)
    }

    /// Save completed investigations for the next run
    pub async fn save_cache(&self, path: &Path) -> anyhow::Result<usize> {
        let records = {
            let state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("Investigation state lock poisoned"))?;
            state.cache.export(Instant::now())
        };
        let saved = records.len();
        cache::save_records(path, records).await?;
        info!(path = %path.display(), saved, "Investigation cache saved");
        Ok(saved)
    }

    /// Restore the configured cache file, if any; failures only cost a
    /// cold cache
    pub async fn restore(&self) {
        if let Some(path) = &self.config.cache_path {
            if let Err(e) = self.load_cache(path).await {
                warn!(error = %e, "Starting with an empty investigation cache");
            }
        }
    }

    /// Number of analyses still running
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Wait up to `grace` for running analyses, cancel the rest, then save
    /// the configured cache file
    pub async fn shutdown(&self, grace: Duration) {
        self.drain(grace).await;
        if let Some(path) = &self.config.cache_path {
            if let Err(e) = self.save_cache(path).await {
                warn!(error = %e, "Investigation cache not saved");
            }
        }
    }

    async fn drain(&self, grace: Duration) {
        let mut tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        if tasks.is_empty() {
            return;
        }

        let pending = tasks.len();
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Cancelling analyses still running after grace period"
            );
            tasks.shutdown().await;
        } else {
            info!(completed = pending, "In-flight analyses finished");
        }
    }
}
