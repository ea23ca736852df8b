//! Bridges bus anomalies to the investigation gate

use crate::events::{BusEvent, EventHandler};
use crate::investigation::InvestigationGate;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct InvestigationHandler {
    gate: Arc<InvestigationGate>,
}

impl InvestigationHandler {
    pub fn new(gate: Arc<InvestigationGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl EventHandler for InvestigationHandler {
    fn name(&self) -> &str {
        "investigation"
    }

    async fn handle(&self, event: &BusEvent) -> Result<()> {
        // The gate only decides and spawns, so this returns immediately
        if let Some(anomaly) = event.as_anomaly() {
            self.gate.consider(anomaly);
        }
        Ok(())
    }
}
