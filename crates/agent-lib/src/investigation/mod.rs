//! Anomaly investigation
//!
//! Anomalies at or above the configured severity may be handed to an
//! external analysis engine. The [`InvestigationGate`] deduplicates by
//! fingerprint, rate limits dispatch and never blocks the event bus while
//! an analysis runs.

mod cache;
mod engine;
mod gate;
mod rate_limit;

pub use cache::{CacheExpiry, InvestigationCache, InvestigationRecord, Lookup, RecordState};
pub use engine::{AnalysisContext, AnalysisEngine, AnalysisResult, CommandEngine, SystemOverview};
pub use gate::{InvestigationGate, InvestigationOutcome, InvestigationReport, SkipReason};
pub use rate_limit::RateLimiter;
