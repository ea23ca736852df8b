//! Health of the monitor's moving parts
//!
//! One entry for the event bus, one for the investigation gate and one per
//! watcher. `/healthz` reports the worst entry; `/readyz` additionally
//! requires the monitor to be started and the bus to be open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered from best to worst so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still producing results, on a degraded baseline or a flaky source
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the component entered this status
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Health entry names
pub mod components {
    pub const EVENT_BUS: &str = "event_bus";
    pub const INVESTIGATION_GATE: &str = "investigation_gate";

    /// Entry for the watcher of `metric`
    pub fn watcher(metric: &str) -> String {
        format!("watcher.{}", metric)
    }
}

#[derive(Debug, Default)]
struct Entries {
    components: BTreeMap<String, ComponentHealth>,
    started: bool,
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Entries>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component as healthy; an existing entry is reset
    pub async fn register(&self, name: &str) {
        self.inner.write().await.components.insert(
            name.to_string(),
            ComponentHealth {
                status: ComponentStatus::Healthy,
                message: None,
                since: Utc::now(),
            },
        );
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    /// Repeating the current status keeps its original `since`
    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut entries = self.inner.write().await;
        let since = match entries.components.get(name) {
            Some(current) if current.status == status => current.since,
            _ => Utc::now(),
        };
        entries.components.insert(
            name.to_string(),
            ComponentHealth {
                status,
                message,
                since,
            },
        );
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.inner.read().await.components.get(name).cloned()
    }

    /// Flipped by the monitor on start and shutdown
    pub async fn set_ready(&self, started: bool) {
        self.inner.write().await.started = started;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.inner.read().await.components.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let entries = self.inner.read().await;
        let reason = if !entries.started {
            Some("Monitor not yet started".to_string())
        } else if entries
            .components
            .get(components::EVENT_BUS)
            .is_some_and(|bus| bus.status == ComponentStatus::Unhealthy)
        {
            // Nothing detected can reach a handler
            Some("Event bus unavailable".to_string())
        } else {
            entries
                .components
                .iter()
                .find(|(_, c)| c.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| format!("{} unhealthy", name))
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
