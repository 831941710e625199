//! Service configuration.
//!
//! Everything the request handler needs is carried in [`ServiceConfig`] and
//! handed to [`crate::service::SnapshotService`] at setup; replay never reads
//! process-wide state.
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::manifest::MANIFEST_FILE;
use crate::replay::CutoffPolicy;
use crate::segment::{DEFAULT_BUCKET_MINUTES, ManifestDiscovery, MinuteBucketDiscovery, SegmentDiscovery};

/// How segment keys are found for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryKind {
    /// `<exchange>_<minute>.gz` for every minute of the bucket.
    #[default]
    Minute,
    /// Entries of the segment manifest.
    Manifest,
}

impl FromStr for DiscoveryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(DiscoveryKind::Minute),
            "manifest" => Ok(DiscoveryKind::Manifest),
            other => Err(format!("unknown discovery {other:?} (expected minute or manifest)")),
        }
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscoveryKind::Minute => "minute",
            DiscoveryKind::Manifest => "manifest",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding segment objects (and the manifest).
    pub data_dir: PathBuf,
    pub discovery: DiscoveryKind,
    /// Manifest path; defaults to `<data_dir>/manifest.bin`.
    pub manifest: Option<PathBuf>,
    pub bucket_minutes: i64,
    pub cutoff: CutoffPolicy,
    /// Fetch the next segment while the current one is replayed.
    pub prefetch: bool,
    /// Production deployments log key lists and stage timings at debug.
    pub production: bool,
    /// `[start, end)` nanosecond range demo callers may request.
    pub demo_window: Option<(i64, i64)>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            discovery: DiscoveryKind::default(),
            manifest: None,
            bucket_minutes: DEFAULT_BUCKET_MINUTES,
            cutoff: CutoffPolicy::default(),
            prefetch: false,
            production: false,
            demo_window: None,
        }
    }
}

impl ServiceConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest.clone().unwrap_or_else(|| self.data_dir.join(MANIFEST_FILE))
    }

    /// Build the configured discovery collaborator.
    pub fn build_discovery(&self) -> Result<Arc<dyn SegmentDiscovery>, StorageError> {
        let discovery: Arc<dyn SegmentDiscovery> = match self.discovery {
            DiscoveryKind::Minute => Arc::new(MinuteBucketDiscovery::new(self.bucket_minutes)),
            DiscoveryKind::Manifest => Arc::new(ManifestDiscovery::load(&self.manifest_path(), self.bucket_minutes)?),
        };
        Ok(discovery)
    }
}
