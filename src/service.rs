//! Snapshot request handler.
//!
//! [`SnapshotService::handle`] runs one request end to end:
//! - authorize the caller and validate parameters
//! - build the formatter and engine for the exchange (unsupported is a 400)
//! - discover segment keys, replay them until the cutoff
//! - assemble the snapshot and charge the scanned bytes
//!
//! Stage timings go to `info` outside production and to `debug` in it.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::engine::EngineRegistry;
use crate::error::{Result, SnapshotError, merge_close};
use crate::replay::{CancelToken, Dispatcher};
use crate::request::{RequestParams, SnapshotRequest, SnapshotResponse, Status, format_nanos};
use crate::segment::SegmentDiscovery;
use crate::snapshot::assemble;
use crate::source::SegmentSource;
use crate::store::{FsObjectStore, ObjectStore};

/// Authenticated identity of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    /// Demo callers are restricted to the demo window and never charged.
    pub demo: bool,
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> std::result::Result<Caller, String>;
}

/// Accepts every request as one anonymous caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAccess;

impl Authorizer for OpenAccess {
    fn authorize(&self, _token: Option<&str>) -> std::result::Result<Caller, String> {
        Ok(Caller { id: "anonymous".into(), demo: false })
    }
}

/// Fixed token table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, Caller>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, caller: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), Caller { id: caller.into(), demo: false });
        self
    }

    pub fn with_demo_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.tokens.insert(token.clone(), Caller { id: format!("demo:{token}"), demo: true });
        self
    }
}

impl Authorizer for StaticTokens {
    fn authorize(&self, token: Option<&str>) -> std::result::Result<Caller, String> {
        let token = token.ok_or_else(|| "API key is required".to_string())?;
        self.tokens.get(token).cloned().ok_or_else(|| "API key is invalid".to_string())
    }
}

/// Records scanned bytes against a caller and returns the units billed.
pub trait UsageMeter: Send + Sync {
    fn charge(&self, caller: &Caller, scanned: u64) -> std::result::Result<u64, String>;
}

/// One unit per started KiB of decompressed data, totals kept in memory.
#[derive(Debug, Default)]
pub struct FlatUsage {
    totals: Mutex<HashMap<String, u64>>,
}

impl FlatUsage {
    pub const UNIT_BYTES: u64 = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(scanned: u64) -> u64 {
        scanned.div_ceil(Self::UNIT_BYTES)
    }

    pub fn total(&self, caller_id: &str) -> u64 {
        self.totals.lock().ok().and_then(|t| t.get(caller_id).copied()).unwrap_or(0)
    }
}

impl UsageMeter for FlatUsage {
    fn charge(&self, caller: &Caller, scanned: u64) -> std::result::Result<u64, String> {
        let units = Self::units(scanned);
        if caller.demo {
            return Ok(units);
        }
        let mut totals = self.totals.lock().map_err(|_| "usage table poisoned".to_string())?;
        *totals.entry(caller.id.clone()).or_default() += units;
        Ok(units)
    }
}

pub struct SnapshotService {
    config: ServiceConfig,
    registry: EngineRegistry,
    discovery: Arc<dyn SegmentDiscovery>,
    store: Arc<dyn ObjectStore>,
    auth: Arc<dyn Authorizer>,
    usage: Arc<dyn UsageMeter>,
}

impl SnapshotService {
    pub fn new(
        config: ServiceConfig,
        registry: EngineRegistry,
        discovery: Arc<dyn SegmentDiscovery>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            registry,
            discovery,
            store,
            auth: Arc::new(OpenAccess),
            usage: Arc::new(FlatUsage::new()),
        }
    }

    /// Local segment directory with the configured discovery.
    pub fn from_config(config: ServiceConfig, registry: EngineRegistry) -> Result<Self> {
        let discovery = config.build_discovery()?;
        let store = Arc::new(FsObjectStore::new(config.data_dir.clone()));
        Ok(Self::new(config, registry, discovery, store))
    }

    pub fn with_authorizer(mut self, auth: Arc<dyn Authorizer>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_usage(mut self, usage: Arc<dyn UsageMeter>) -> Self {
        self.usage = usage;
        self
    }

    pub fn handle(&self, params: &RequestParams, cancel: &CancelToken) -> SnapshotResponse {
        let started = Instant::now();
        let mut scanned = 0u64;
        match self.execute(params, cancel, started, &mut scanned) {
            Ok(response) => {
                info!(
                    status = response.status.code(),
                    scanned = response.scanned,
                    billed = response.billed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "snapshot served"
                );
                response
            }
            Err(err) => {
                let status = err.status();
                if status == Status::Internal {
                    error!(error = %err, scanned, "snapshot failed");
                } else {
                    warn!(error = %err, status = status.code(), "snapshot rejected");
                }
                SnapshotResponse::error(&err, scanned)
            }
        }
    }

    fn stage(&self, stage: &'static str, started: Instant) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        if self.config.production {
            debug!(stage, elapsed_us, "stage done");
        } else {
            info!(stage, elapsed_us, "stage done");
        }
    }

    fn execute(
        &self,
        params: &RequestParams,
        cancel: &CancelToken,
        started: Instant,
        scanned: &mut u64,
    ) -> Result<SnapshotResponse> {
        let caller = self.auth.authorize(params.token.as_deref()).map_err(SnapshotError::Auth)?;
        self.stage("auth", started);

        let req = SnapshotRequest::from_params(params)?;
        if caller.demo {
            if let Some((start, end)) = self.config.demo_window {
                if !(start..end).contains(&req.nanosec) {
                    return Err(SnapshotError::validation("nanosec is out of range for a demo API key"));
                }
            }
        }
        debug!(
            caller = %caller.id,
            exchange = %req.exchange,
            nanosec = req.nanosec,
            at = %format_nanos(req.nanosec),
            channels = ?req.channels,
            format = %req.format,
            "snapshot request"
        );

        let mut formatter = self.registry.formatter(&req.exchange, &req.format, &req.channels)?;
        let factory = self.registry.engine_factory(&req.exchange)?;
        let mut dispatcher =
            Dispatcher::new(req.nanosec, self.config.cutoff, req.channels.clone(), factory, cancel.clone())?;
        self.stage("setup", started);

        let keys = self.discovery.segment_keys(&req.exchange, req.nanosec)?;
        if self.config.production {
            debug!(count = keys.len(), keys = ?keys, "segments discovered");
        } else {
            info!(count = keys.len(), keys = ?keys, "segments discovered");
        }

        let mut source = SegmentSource::open(self.store.clone(), keys, self.config.prefetch, cancel.clone())?;
        let replayed = dispatcher.run(&mut source);
        *scanned = dispatcher.scanned().bytes();
        let summary = merge_close(replayed, source.close())?;
        debug!(
            opened = summary.opened,
            skipped = summary.skipped,
            segments_read = dispatcher.scanned().segments(),
            stopped_at = ?summary.stopped_at,
            scanned = *scanned,
            "replay finished"
        );
        self.stage("replay", started);

        let snapshots = dispatcher.take_snapshot()?;
        let assembled = assemble(req.nanosec, &snapshots, formatter.as_deref_mut(), req.filter.as_ref())?;
        debug!(lines = assembled.lines, suppressed = assembled.suppressed, "snapshot assembled");
        self.stage("snapshot", started);

        let billed = self.usage.charge(&caller, *scanned).map_err(SnapshotError::Usage)?;
        self.stage("usage", started);

        let status = if assembled.is_empty() { Status::Empty } else { Status::Ok };
        Ok(SnapshotResponse { status, body: assembled.body, scanned: *scanned, billed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::segment::{MINUTE_NANOS, MinuteBucketDiscovery, SegmentKey};
    use crate::store::MemoryObjectStore;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn service(store: MemoryObjectStore) -> SnapshotService {
        let mut registry = EngineRegistry::new();
        registry.bind("x", EngineKind::LastValue);
        SnapshotService::new(
            ServiceConfig::default(),
            registry,
            Arc::new(MinuteBucketDiscovery::default()),
            Arc::new(store),
        )
    }

    fn params(nanosec: i64) -> RequestParams {
        RequestParams {
            exchange: Some("x".into()),
            nanosec: Some(nanosec.to_string()),
            channels: vec!["book".into()],
            token: Some("secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn serves_last_value_snapshot() {
        let mut store = MemoryObjectStore::new();
        store.insert(SegmentKey::for_minute("x", 0), gz(b"start\tu\nmsg\t5\tbook\tA\nmsg\t50\tbook\tB\n"));
        let resp = service(store).handle(&params(10), &CancelToken::new());
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.body, b"10\tbook\tA\n");
        assert_eq!(resp.billed, 1);
    }

    #[test]
    fn auth_checked_before_validation() {
        let svc = service(MemoryObjectStore::new())
            .with_authorizer(Arc::new(StaticTokens::new().with_token("secret", "alice")));
        let mut p = params(10);
        p.token = Some("wrong".into());
        p.exchange = None;
        assert_eq!(svc.handle(&p, &CancelToken::new()).status, Status::Auth);

        p.token = Some("secret".into());
        assert_eq!(svc.handle(&p, &CancelToken::new()).status, Status::Validation);
    }

    #[test]
    fn demo_callers_restricted_and_not_accumulated() {
        let usage = Arc::new(FlatUsage::new());
        let mut store = MemoryObjectStore::new();
        store.insert(SegmentKey::for_minute("x", 0), gz(b"msg\t5\tbook\tA\n"));
        let mut svc = service(store)
            .with_authorizer(Arc::new(StaticTokens::new().with_demo_token("demo")))
            .with_usage(usage.clone());
        svc.config.demo_window = Some((0, MINUTE_NANOS));

        let mut p = params(10);
        p.token = Some("demo".into());
        let resp = svc.handle(&p, &CancelToken::new());
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.billed, 1);
        assert_eq!(usage.total("demo:demo"), 0);

        p.nanosec = Some(MINUTE_NANOS.to_string());
        assert_eq!(svc.handle(&p, &CancelToken::new()).status, Status::Validation);
    }

    #[test]
    fn flat_usage_rounds_up_to_kib() {
        assert_eq!(FlatUsage::units(0), 0);
        assert_eq!(FlatUsage::units(1), 1);
        assert_eq!(FlatUsage::units(1024), 1);
        assert_eq!(FlatUsage::units(1025), 2);

        let usage = FlatUsage::new();
        let alice = Caller { id: "alice".into(), demo: false };
        usage.charge(&alice, 2048).unwrap();
        usage.charge(&alice, 1).unwrap();
        assert_eq!(usage.total("alice"), 3);
    }
}
