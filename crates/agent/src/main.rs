//! Hostwatch - host anomaly monitor
//!
//! Learns what normal looks like for this host, raises anomaly events when
//! live metrics deviate, and optionally hands them to an external analysis
//! command.

use anyhow::Result;
use hostwatch::{api, config::AgentConfig};
use hostwatch_lib::{
    collector::create_source,
    investigation::{AnalysisEngine, CommandEngine},
    HealthRegistry, Monitor, MonitorMetrics,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting hostwatch");

    let config = AgentConfig::load()?;
    info!(node_name = %config.node_name, "Agent configured");

    let health_registry = HealthRegistry::new();
    let metrics = MonitorMetrics::new();

    let source = create_source(
        &config.monitor.proc_root,
        config.monitor.cpu_sample_window(),
        config.monitor.top_processes,
    )
    .await;

    let mut builder = Monitor::builder(config.monitor.clone())
        .source(source)
        .node_name(config.node_name.clone())
        .health(health_registry.clone());

    match config
        .monitor
        .investigation
        .command
        .as_deref()
        .and_then(CommandEngine::from_argv)
    {
        Some(engine) => {
            info!(engine = %engine.name(), "Analysis engine configured");
            builder = builder.engine(Arc::new(engine));
        }
        None if config.monitor.investigation.command.is_some() => {
            warn!("Empty analysis command, investigation disabled");
        }
        None => {}
    }

    // Failing to build the bus or open the event log is the only fatal error
    let mut monitor = builder.build().await?;

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    monitor.start().await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server stopped"),
                Err(e) => error!(error = %e, "API server task failed"),
                Ok(Ok(())) => warn!("API server exited"),
            }
        }
    }

    let grace = config.monitor.shutdown_grace();
    monitor.shutdown(grace).await;
    info!("Shutdown complete");

    Ok(())
}
