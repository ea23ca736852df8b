//! Host monitoring core
//!
//! This crate provides the core functionality for:
//! - Sampling host metrics from procfs
//! - Learning a per-metric baseline of "normal"
//! - Heuristic anomaly detection against the learned baseline
//! - Topic-based event fan-out to independent handlers
//! - Gating, caching and rate limiting of deeper anomaly investigation
//! - Health checks and observability

pub mod anomaly;
pub mod baseline;
pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod health;
pub mod investigation;
pub mod models;
pub mod observability;
pub mod watcher;

pub use config::MonitorConfig;
pub use error::{BaselineError, BusError, EngineError, SourceError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{MonitorMetrics, StructuredLogger};
pub use watcher::{Monitor, MonitorBuilder};
