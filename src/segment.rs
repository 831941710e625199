//! Segment keys and discovery of the segments a request needs.
//!
//! A segment is one gzip object holding one minute of capture for one
//! exchange. Minutes are grouped into buckets (10 minutes by default); a
//! snapshot replays from the start of the bucket containing the target
//! minute through the target minute itself.
use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::error::StorageError;
use crate::manifest::{ManifestEntry, read_manifest_file};

pub const MINUTE_NANOS: i64 = 60 * 1_000_000_000;
pub const DEFAULT_BUCKET_MINUTES: i64 = 10;

/// Identifies one compressed segment object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey(String);

impl SegmentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// `<exchange>_<minute>.gz`
    pub fn for_minute(exchange: &str, minute: i64) -> Self {
        Self(format!("{exchange}_{minute}.gz"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Minute index of a nanosecond timestamp.
pub fn minute_of(nanosec: i64) -> i64 {
    nanosec.div_euclid(MINUTE_NANOS)
}

/// First minute of the bucket containing `minute`.
pub fn bucket_start(minute: i64, bucket_minutes: i64) -> i64 {
    minute.div_euclid(bucket_minutes) * bucket_minutes
}

/// Resolves the ordered list of segment keys covering a request.
pub trait SegmentDiscovery: Send + Sync {
    fn segment_keys(&self, exchange: &str, nanosec: i64) -> Result<Vec<SegmentKey>, StorageError>;
}

/// Derives keys deterministically, one per minute.
#[derive(Debug, Clone, Copy)]
pub struct MinuteBucketDiscovery {
    bucket_minutes: i64,
}

impl MinuteBucketDiscovery {
    pub fn new(bucket_minutes: i64) -> Self {
        Self { bucket_minutes: bucket_minutes.max(1) }
    }
}

impl Default for MinuteBucketDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_MINUTES)
    }
}

impl SegmentDiscovery for MinuteBucketDiscovery {
    fn segment_keys(&self, exchange: &str, nanosec: i64) -> Result<Vec<SegmentKey>, StorageError> {
        let minute = minute_of(nanosec);
        let first = bucket_start(minute, self.bucket_minutes);
        Ok((first..=minute).map(|m| SegmentKey::for_minute(exchange, m)).collect())
    }
}

/// Looks keys up in a segment manifest.
///
/// Returns the segment that was live at the bucket start (the latest one
/// starting before it) followed by every segment starting inside
/// `[bucket start, target]`.
#[derive(Debug, Clone, Default)]
pub struct ManifestDiscovery {
    entries: Vec<ManifestEntry>,
    bucket_minutes: i64,
}

impl ManifestDiscovery {
    pub fn new(mut entries: Vec<ManifestEntry>, bucket_minutes: i64) -> Self {
        entries.sort_by(|a, b| (&a.exchange, a.first_timestamp, &a.key).cmp(&(&b.exchange, b.first_timestamp, &b.key)));
        Self { entries, bucket_minutes: bucket_minutes.max(1) }
    }

    pub fn load(path: &Path, bucket_minutes: i64) -> Result<Self, StorageError> {
        let entries = read_manifest_file(path)?;
        debug!(path = %path.display(), entries = entries.len(), "loaded segment manifest");
        Ok(Self::new(entries, bucket_minutes))
    }
}

impl SegmentDiscovery for ManifestDiscovery {
    fn segment_keys(&self, exchange: &str, nanosec: i64) -> Result<Vec<SegmentKey>, StorageError> {
        let start_ns = bucket_start(minute_of(nanosec), self.bucket_minutes).saturating_mul(MINUTE_NANOS);
        let candidates: Vec<&ManifestEntry> = self
            .entries
            .iter()
            .filter(|e| e.exchange == exchange && e.first_timestamp <= nanosec)
            .collect();
        // candidates are in timestamp order; step back one to the segment live at the bucket start
        let in_bucket = candidates.partition_point(|e| e.first_timestamp < start_ns);
        let from = in_bucket.saturating_sub(1);
        Ok(candidates[from..].iter().map(|e| SegmentKey::new(e.key.clone())).collect())
    }
}
