//! Console presenter for anomalies and investigation reports

use crate::events::{BusEvent, EventHandler, HandlerFailure};
use crate::investigation::InvestigationReport;
use crate::models::{AnomalyEvent, Severity};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use colored::{ColoredString, Colorize};
use std::io::{self, Stdout, Write};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

fn paint(text: &str, severity: Severity) -> ColoredString {
    match severity {
        Severity::Info => text.blue(),
        Severity::Warning => text.yellow(),
        Severity::Error => text.red(),
        Severity::Critical => text.red().bold(),
    }
}

fn icon(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "[i]",
        Severity::Warning => "[!]",
        Severity::Error => "[x]",
        Severity::Critical => "[!!]",
    }
}

/// Writes one line per anomaly and a block per investigation report
pub struct ConsolePresenter<W: Write + Send = Stdout> {
    out: Mutex<W>,
}

impl ConsolePresenter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsolePresenter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn render_anomaly(event: &AnomalyEvent) -> String {
        let line = format!(
            "[{}] {}  {}",
            event.timestamp.format("%H:%M:%S"),
            icon(event.severity),
            event.description
        );
        paint(&line, event.severity).to_string()
    }

    pub fn render_failure(failure: &HandlerFailure) -> String {
        format!(
            "{} handler {} failed on {}: {}",
            "[x]".red(),
            failure.handler.bold(),
            failure.topic,
            failure.error
        )
    }

    pub fn render_report(report: &InvestigationReport) -> String {
        let mut title = "Investigation Report".to_string();
        if report.cached {
            title.push_str(&format!(" (cached, seen {}x)", report.seen));
        }
        let title = paint(&title, report.event.severity).bold();

        let body = match &report.result {
            Ok(result) => result.summary.clone(),
            Err(error) => format!("Investigation failed: {}", error).red().to_string(),
        };
        format!(
            "{}\n{}\n{}\n",
            title,
            report.event.description.dimmed(),
            body
        )
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow!("console output lock poisoned"))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }

    pub fn present_report(&self, report: &InvestigationReport) -> Result<()> {
        self.write_line(&Self::render_report(report))
    }

    /// Print reports until the sending side is dropped
    pub async fn run_reports(&self, mut reports: mpsc::Receiver<InvestigationReport>) {
        while let Some(report) = reports.recv().await {
            if let Err(e) = self.present_report(&report) {
                debug!(error = %e, "Failed to print investigation report");
            }
        }
    }
}

#[async_trait]
impl<W: Write + Send> EventHandler for ConsolePresenter<W> {
    fn name(&self) -> &str {
        "console"
    }

    async fn handle(&self, event: &BusEvent) -> Result<()> {
        let line = match event {
            BusEvent::Anomaly(anomaly) => Self::render_anomaly(anomaly),
            BusEvent::HandlerError(failure) => Self::render_failure(failure),
        };
        self.write_line(&line)
    }
}
