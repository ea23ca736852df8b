//! Fingerprint-keyed investigation cache
//!
//! One record per fingerprint. An expired record is superseded by a fresh
//! one, never merged into it. Completed records can be saved to a JSON file
//! and restored on the next start with whatever expiry they have left.

use super::engine::AnalysisResult;
use crate::models::Fingerprint;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What is known about a fingerprint's investigation
#[derive(Debug, Clone)]
pub enum RecordState {
    /// Analysis dispatched and not yet finished
    Pending,
    Ready(Arc<AnalysisResult>),
    /// Engine failed; held only for the short failure expiry
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct InvestigationRecord {
    pub fingerprint: Fingerprint,
    pub last_investigated: DateTime<Utc>,
    pub state: RecordState,
    pub expires_at: Instant,
    /// Events that mapped onto this record, including the first
    pub seen: u64,
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    Miss,
    Pending,
    Ready { result: Arc<AnalysisResult>, seen: u64 },
    Failed,
}

/// A completed record as written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub fingerprint: Fingerprint,
    pub investigated_at: DateTime<Utc>,
    pub seen: u64,
    pub result: AnalysisResult,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    saved_at: DateTime<Utc>,
    records: Vec<PersistedRecord>,
}

/// Read persisted records; a missing file is an empty cache
pub async fn load_records(path: &Path) -> Result<Vec<PersistedRecord>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read cache {}", path.display()))
        }
    };
    let file: CacheFile = serde_json::from_slice(&content)
        .with_context(|| format!("Malformed cache file {}", path.display()))?;
    Ok(file.records)
}

/// Write `records`, replacing the previous file only once the new one is complete
pub async fn save_records(path: &Path, records: Vec<PersistedRecord>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = CacheFile {
        saved_at: Utc::now(),
        records,
    };
    let content = serde_json::to_vec_pretty(&file).context("Failed to encode cache")?;

    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, content)
        .await
        .with_context(|| format!("Failed to write {}", staging.display()))?;
    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Expiry settings for each record state
#[derive(Debug, Clone, Copy)]
pub struct CacheExpiry {
    pub ready: Duration,
    pub failed: Duration,
    /// Upper bound on how long an unfinished analysis blocks its fingerprint
    pub pending: Duration,
}

#[derive(Debug)]
pub struct InvestigationCache {
    records: HashMap<Fingerprint, InvestigationRecord>,
    expiry: CacheExpiry,
}

impl InvestigationCache {
    pub fn new(expiry: CacheExpiry) -> Self {
        Self {
            records: HashMap::new(),
            expiry,
        }
    }

    /// Look up a fingerprint, counting the lookup as one more sighting
    pub fn lookup(&mut self, fingerprint: &Fingerprint, now: Instant) -> Lookup {
        let expired = match self.records.get(fingerprint) {
            None => return Lookup::Miss,
            Some(record) => record.expires_at <= now,
        };
        if expired {
            self.records.remove(fingerprint);
            return Lookup::Miss;
        }

        let Some(record) = self.records.get_mut(fingerprint) else {
            return Lookup::Miss;
        };
        record.seen += 1;
        match &record.state {
            RecordState::Pending => Lookup::Pending,
            RecordState::Ready(result) => Lookup::Ready {
                result: Arc::clone(result),
                seen: record.seen,
            },
            RecordState::Failed(_) => Lookup::Failed,
        }
    }

    /// Start a new record for a dispatched analysis
    pub fn begin(&mut self, fingerprint: Fingerprint, now: Instant) {
        self.records.insert(
            fingerprint.clone(),
            InvestigationRecord {
                fingerprint,
                last_investigated: Utc::now(),
                state: RecordState::Pending,
                expires_at: now + self.expiry.pending,
                seen: 1,
            },
        );
    }

    /// Store a finished analysis; returns the sighting count so far
    pub fn complete(
        &mut self,
        fingerprint: &Fingerprint,
        result: Arc<AnalysisResult>,
        now: Instant,
    ) -> u64 {
        self.settle(fingerprint, RecordState::Ready(result), now + self.expiry.ready)
    }

    /// Store a failed analysis under the short failure expiry
    pub fn fail(&mut self, fingerprint: &Fingerprint, error: String, now: Instant) -> u64 {
        self.settle(fingerprint, RecordState::Failed(error), now + self.expiry.failed)
    }

    fn settle(&mut self, fingerprint: &Fingerprint, state: RecordState, expires_at: Instant) -> u64 {
        let record = self
            .records
            .entry(fingerprint.clone())
            .or_insert_with(|| InvestigationRecord {
                fingerprint: fingerprint.clone(),
                last_investigated: Utc::now(),
                state: RecordState::Pending,
                expires_at,
                seen: 1,
            });
        record.last_investigated = Utc::now();
        record.state = state;
        record.expires_at = expires_at;
        record.seen
    }

    /// Drop every expired record
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        before - self.records.len()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&InvestigationRecord> {
        self.records.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Completed records that have not expired at `now`
    pub fn export(&self, now: Instant) -> Vec<PersistedRecord> {
        let mut records: Vec<PersistedRecord> = self
            .records
            .values()
            .filter(|record| record.expires_at > now)
            .filter_map(|record| match &record.state {
                RecordState::Ready(result) => Some(PersistedRecord {
                    fingerprint: record.fingerprint.clone(),
                    investigated_at: record.last_investigated,
                    seen: record.seen,
                    result: result.as_ref().clone(),
                }),
                _ => None,
            })
            .collect();
        records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        records
    }

    /// Restore persisted records, keeping each for the rest of its ready
    /// expiry as measured from `wall_now`
    ///
    /// Records already in the cache win over restored ones. Returns how many
    /// were restored.
    pub fn restore(
        &mut self,
        records: Vec<PersistedRecord>,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> usize {
        let mut restored = 0;
        for record in records {
            let age = (wall_now - record.investigated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let Some(remaining) = self.expiry.ready.checked_sub(age) else {
                continue;
            };
            if remaining.is_zero() || self.records.contains_key(&record.fingerprint) {
                continue;
            }
            self.records.insert(
                record.fingerprint.clone(),
                InvestigationRecord {
                    fingerprint: record.fingerprint,
                    last_investigated: record.investigated_at,
                    state: RecordState::Ready(Arc::new(record.result)),
                    expires_at: now + remaining,
                    seen: record.seen,
                },
            );
            restored += 1;
        }
        restored
    }
}
