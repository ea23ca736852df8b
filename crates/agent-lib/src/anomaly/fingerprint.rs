//! Anomaly fingerprints for deduplication

use crate::models::{AnomalyCategory, Fingerprint};
use sha2::{Digest, Sha256};

/// Field separator that cannot appear in metric or category names
const SEP: &[u8] = &[0x1f];

/// Deterministic fingerprint over metric, category, subject and bucket
pub fn fingerprint(
    metric: &str,
    category: AnomalyCategory,
    subject: Option<&str>,
    bucket: i64,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(metric.as_bytes());
    hasher.update(SEP);
    hasher.update(category.as_str().as_bytes());
    hasher.update(SEP);
    hasher.update(subject.unwrap_or("").as_bytes());
    hasher.update(SEP);
    hasher.update(bucket.to_le_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Coarse bucket of `value` at the given width
pub fn value_bucket(value: f64, width: f64) -> i64 {
    if !value.is_finite() || width <= 0.0 {
        return 0;
    }
    (value / width).floor() as i64
}
