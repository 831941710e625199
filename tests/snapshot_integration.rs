use flate2::Compression;
use flate2::write::GzEncoder;
use market_snapshot::config::{DiscoveryKind, ServiceConfig};
use market_snapshot::engine::{EngineKind, EngineRegistry, LastValueEngine, StateEngine};
use market_snapshot::error::EngineError;
use market_snapshot::replay::{CancelToken, CutoffPolicy};
use market_snapshot::request::{RequestParams, SnapshotResponse, Status};
use market_snapshot::segment::{MINUTE_NANOS, MinuteBucketDiscovery, SegmentKey};
use market_snapshot::service::{SnapshotService, StaticTokens};
use market_snapshot::store::MemoryObjectStore;
use market_snapshot::writer::pack;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

fn gz(text: &str) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap()
}

fn write_segment(dir: &Path, exchange: &str, minute: i64, text: &str) {
    fs::write(dir.join(SegmentKey::for_minute(exchange, minute).as_str()), gz(text)).unwrap();
}

fn config(dir: &Path) -> ServiceConfig {
    ServiceConfig { data_dir: dir.to_path_buf(), ..Default::default() }
}

fn service_with(cfg: ServiceConfig, kind: EngineKind) -> SnapshotService {
    let mut registry = EngineRegistry::new();
    registry.bind("x", kind);
    SnapshotService::from_config(cfg, registry).unwrap()
}

fn params(nanosec: i64, channels: &[&str]) -> RequestParams {
    RequestParams {
        exchange: Some("x".into()),
        nanosec: Some(nanosec.to_string()),
        channels: channels.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn run(svc: &SnapshotService, p: &RequestParams) -> SnapshotResponse {
    svc.handle(p, &CancelToken::new())
}

fn body(resp: &SnapshotResponse) -> String {
    String::from_utf8(resp.body.clone()).unwrap()
}

#[test]
fn replay_stops_before_first_record_at_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "x", 0, "start\thttp://x\nmsg\t100\tbook\tINIT\nmsg\t200\tbook\tUPDATE\n");
    let svc = service_with(config(dir.path()), EngineKind::LastValue);

    let resp = run(&svc, &params(150, &["book"]));
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(body(&resp), "150\tbook\tINIT\n");
    // start line + first msg line + "msg\t200\t"
    assert_eq!(resp.scanned, 15 + 18 + 8);
    assert_eq!(resp.billed, 1);
}

#[test]
fn depth_book_rebuilt_across_segments_with_gaps() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "x", 10, "start\twss://feed\nstate\tbook\tb 100 1;b 99 1;a 101 1\n");
    // minute 11 missing
    write_segment(dir.path(), "x", 12, &format!("msg\t{}\tbook\tb 100 0;a 102 4\n", 12 * MINUTE_NANOS + 1));
    let svc = service_with(config(dir.path()), EngineKind::Depth);

    let at = 12 * MINUTE_NANOS + 30;
    let resp = run(&svc, &params(at, &["book"]));
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(body(&resp), format!("{at}\tbook\tb 99 1;a 101 1;a 102 4\n"));

    let first = "start\twss://feed\nstate\tbook\tb 100 1;b 99 1;a 101 1\n".len();
    let second = format!("msg\t{}\tbook\tb 100 0;a 102 4\n", 12 * MINUTE_NANOS + 1).len();
    assert_eq!(resp.scanned, (first + second) as u64);
}

#[test]
fn segments_after_the_stop_are_never_fetched() {
    let mut store = MemoryObjectStore::new();
    store.insert(SegmentKey::for_minute("x", 0), gz("start\tu\nmsg\t10\tbook\tA\n"));
    let late = format!("msg\t{}\tbook\tB\nmsg\t{}\tbook\tC\n", 2 * MINUTE_NANOS + 1, 3 * MINUTE_NANOS + 7);
    store.insert(SegmentKey::for_minute("x", 2), gz(&late));
    store.insert(SegmentKey::for_minute("x", 3), gz(&format!("msg\t{}\tbook\tD\n", 3 * MINUTE_NANOS + 1)));
    let store = Arc::new(store);

    let mut registry = EngineRegistry::new();
    registry.bind("x", EngineKind::LastValue);
    let discovery = Arc::new(MinuteBucketDiscovery::default());
    let svc = SnapshotService::new(ServiceConfig::default(), registry, discovery, store.clone());

    let at = 3 * MINUTE_NANOS + 5;
    let resp = run(&svc, &params(at, &["book"]));
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(body(&resp), format!("{at}\tbook\tB\n"));
    assert_eq!(
        store.fetched(),
        vec![SegmentKey::for_minute("x", 0), SegmentKey::for_minute("x", 1), SegmentKey::for_minute("x", 2)]
    );
    let expected = "start\tu\nmsg\t10\tbook\tA\n".len()
        + format!("msg\t{}\tbook\tB\n", 2 * MINUTE_NANOS + 1).len()
        + format!("msg\t{}\t", 3 * MINUTE_NANOS + 7).len();
    assert_eq!(resp.scanned, expected as u64);
}

#[test]
fn prefetch_gives_identical_results() {
    let dir = tempfile::tempdir().unwrap();
    for minute in 0..5 {
        let ts = minute * MINUTE_NANOS + 1;
        let text = format!("msg\t{ts}\tbook\tb {} 1\nstate\ttrade\tT{minute}\n", 100 + minute);
        write_segment(dir.path(), "x", minute, &text);
    }
    let at = 3 * MINUTE_NANOS + 2;
    let p = params(at, &["book", "trade"]);

    let direct = run(&service_with(config(dir.path()), EngineKind::LastValue), &p);
    let prefetched = run(
        &service_with(ServiceConfig { prefetch: true, ..config(dir.path()) }, EngineKind::LastValue),
        &p,
    );
    assert_eq!(direct.status, Status::Ok);
    assert_eq!(prefetched.status, direct.status);
    assert_eq!(prefetched.body, direct.body);
    assert_eq!(prefetched.scanned, direct.scanned);
    assert_eq!(body(&direct), format!("{at}\tbook\tb 103 1\n{at}\ttrade\tT3\n"));
}

fn eight_minute_store() -> Arc<MemoryObjectStore> {
    let mut store = MemoryObjectStore::new();
    let first = format!("start\tu\nmsg\t10\tbook\tA\nmsg\t{}\tbook\tLATE\n", 8 * MINUTE_NANOS);
    store.insert(SegmentKey::for_minute("x", 0), gz(&first));
    for minute in 1..8 {
        let text = format!("msg\t{}\tbook\tM{minute}\n", minute * MINUTE_NANOS);
        store.insert(SegmentKey::for_minute("x", minute), gz(&text));
    }
    Arc::new(store)
}

#[test]
fn prefetch_stop_in_first_segment_discards_read_ahead() {
    let at = 7 * MINUTE_NANOS + 5;
    let p = params(at, &["book"]);
    let mut responses = Vec::new();
    for prefetch in [false, true] {
        let store = eight_minute_store();
        let mut registry = EngineRegistry::new();
        registry.bind("x", EngineKind::LastValue);
        let cfg = ServiceConfig { prefetch, ..Default::default() };
        let svc = SnapshotService::new(cfg, registry, Arc::new(MinuteBucketDiscovery::default()), store.clone());
        let resp = run(&svc, &p);
        let fetched = store.fetched();
        if prefetch {
            assert!(fetched.len() <= 3, "read ahead too far: {fetched:?}");
        } else {
            assert_eq!(fetched, vec![SegmentKey::for_minute("x", 0)]);
        }
        responses.push(resp);
    }
    let (direct, prefetched) = (&responses[0], &responses[1]);
    assert_eq!(direct.status, Status::Ok);
    assert_eq!(prefetched.status, Status::Ok);
    assert_eq!(body(direct), format!("{at}\tbook\tA\n"));
    assert_eq!(prefetched.body, direct.body);
    assert_eq!(prefetched.scanned, direct.scanned);
    let expected = "start\tu\nmsg\t10\tbook\tA\n".len() + format!("msg\t{}\t", 8 * MINUTE_NANOS).len();
    assert_eq!(direct.scanned, expected as u64);
}

#[test]
fn emptied_depth_book_still_renders_a_line() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "x", 0, "msg\t5\tbook\tb 100 1\nmsg\t6\tbook\tb 100 0\n");
    let svc = service_with(config(dir.path()), EngineKind::Depth);

    let raw = run(&svc, &params(10, &["book"]));
    assert_eq!(raw.status, Status::Ok);
    assert_eq!(body(&raw), "10\tbook\t\n");

    let mut p = params(10, &["book"]);
    p.format = Some("levels".into());
    let levels = run(&svc, &p);
    assert_eq!(levels.status, Status::Ok);
    assert_eq!(body(&levels), "10\tbook\t\n");
}

#[test]
fn levels_formatter_fans_out() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "x", 0, "msg\t10\tbook\tb 100 1;b 99 2;a 101 1\n");
    let svc = service_with(config(dir.path()), EngineKind::Depth);

    let mut p = params(20, &["book"]);
    p.format = Some("levels".into());
    let resp = run(&svc, &p);
    assert_eq!(body(&resp), "20\tbook\tbid 100 1\n20\tbook\tbid 99 2\n20\tbook\task 101 1\n");
}

#[test]
fn post_filter_and_empty_results() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "x", 0, "msg\t1\tbook\tB\nmsg\t2\ttrade\tT\n");
    let svc = service_with(config(dir.path()), EngineKind::LastValue);

    let mut p = params(50, &["book", "trade"]);
    p.filter = vec!["trade".into()];
    let resp = run(&svc, &p);
    assert_eq!(body(&resp), "50\ttrade\tT\n");

    p.filter = vec!["ticker".into()];
    let resp = run(&svc, &p);
    assert_eq!(resp.status, Status::Empty);
    assert_eq!(resp.status.code(), 404);
    assert!(resp.body.is_empty());

    let resp = run(&svc, &params(50, &["ticker"]));
    assert_eq!(resp.status, Status::Empty);
    // replay still happened and is accounted
    assert!(resp.scanned > 0);
}

#[test]
fn cutoff_policies_at_the_boundary() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "x", 0, "msg\t100\tbook\tA\nmsg\t150\tbook\tB\nmsg\t151\tbook\tC\n");

    let inclusive = service_with(config(dir.path()), EngineKind::LastValue);
    assert_eq!(body(&run(&inclusive, &params(150, &["book"]))), "150\tbook\tA\n");

    let strict_cfg = ServiceConfig { cutoff: CutoffPolicy::After, ..config(dir.path()) };
    let strict = service_with(strict_cfg, EngineKind::LastValue);
    assert_eq!(body(&run(&strict, &params(150, &["book"]))), "150\tbook\tB\n");
    assert_eq!(body(&run(&strict, &params(151, &["book"]))), "151\tbook\tC\n");
}

#[test]
fn setup_rejections_are_validation_errors() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service_with(config(dir.path()), EngineKind::LastValue);

    let mut p = params(1, &["book"]);
    p.exchange = Some("nope".into());
    assert_eq!(run(&svc, &p).status, Status::Validation);

    let mut p = params(1, &["book"]);
    p.format = Some("levels".into());
    let resp = run(&svc, &p);
    assert_eq!(resp.status, Status::Validation);
    assert!(body(&resp).contains("levels"));

    let mut p = params(1, &[]);
    p.nanosec = Some("12.5".into());
    assert_eq!(run(&svc, &p).status.code(), 400);
}

#[test]
fn unauthorized_requests_are_rejected_first() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service_with(config(dir.path()), EngineKind::LastValue)
        .with_authorizer(Arc::new(StaticTokens::new().with_token("k1", "alice")));

    let resp = run(&svc, &params(1, &["book"]));
    assert_eq!(resp.status, Status::Auth);
    assert_eq!(resp.status.code(), 401);

    let mut p = params(1, &["book"]);
    p.token = Some("k1".into());
    assert_eq!(run(&svc, &p).status, Status::Empty);
}

#[test]
fn manifest_discovery_includes_segment_live_at_bucket_start() {
    let dir = tempfile::tempdir().unwrap();
    let log = format!(
        "start\twss://feed\nstate\tbook\tb 100 1;a 101 1\nmsg\t{}\tbook\tb 100 2\nmsg\t{}\tbook\ta 101 0;a 102 3\nmsg\t{}\tbook\tb 99 1\n",
        MINUTE_NANOS + 1,
        12 * MINUTE_NANOS,
        12 * MINUTE_NANOS + 50,
    );
    let entries = pack(log.as_bytes(), dir.path(), "x").unwrap();
    assert_eq!(entries.len(), 2);

    let at = 12 * MINUTE_NANOS + 10;
    let manifest = service_with(
        ServiceConfig { discovery: DiscoveryKind::Manifest, ..config(dir.path()) },
        EngineKind::Depth,
    );
    let resp = run(&manifest, &params(at, &["book"]));
    assert_eq!(body(&resp), format!("{at}\tbook\tb 100 2;a 102 3\n"));

    // key derivation only sees the bucket, so the earlier baseline is missed
    let minute = service_with(config(dir.path()), EngineKind::Depth);
    assert_eq!(body(&run(&minute, &params(at, &["book"]))), format!("{at}\tbook\ta 102 3\n"));
}

#[test]
fn corrupt_segments_are_internal_errors() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("x_0.gz"), b"this is not gzip").unwrap();
    let svc = service_with(config(dir.path()), EngineKind::LastValue);
    let resp = run(&svc, &params(10, &["book"]));
    assert_eq!(resp.status, Status::Internal);
    assert_eq!(resp.status.code(), 500);
    assert_eq!(resp.billed, 0);

    write_segment(dir.path(), "x", 0, "start\tu\nmsg\t5\tbo");
    let resp = run(&svc, &params(10, &["book"]));
    assert_eq!(resp.status, Status::Internal);
    assert!(body(&resp).contains("truncated"), "{}", body(&resp));
    assert_eq!(resp.scanned, 16);
}

#[test]
fn cancelled_request_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "x", 0, "msg\t5\tbook\tA\n");
    let svc = service_with(config(dir.path()), EngineKind::LastValue);
    let cancel = CancelToken::new();
    cancel.cancel();
    let resp = svc.handle(&params(10, &["book"]), &cancel);
    assert_eq!(resp.status, Status::Internal);
    assert!(body(&resp).contains("cancelled"));
}

#[test]
fn engine_is_built_for_exactly_the_requested_channels() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(
        dir.path(),
        "x",
        0,
        "start\tu1\nmsg\t1\tbook\tB\nmsg\t2\tticker\tK\nstart\tu2\nmsg\t3\ttrade\tT\n",
    );
    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let record = seen.clone();
    let mut registry = EngineRegistry::new();
    registry.register_engine(
        "x",
        Arc::new(move |channels: &[String]| {
            record.lock().unwrap().push(channels.to_vec());
            Ok::<_, EngineError>(Box::new(LastValueEngine::new(channels)) as Box<dyn StateEngine>)
        }),
    );
    let svc = SnapshotService::from_config(config(dir.path()), registry).unwrap();

    let mut p = params(10, &["trade", "book", "trade"]);
    p.filter = vec!["trade".into()];
    let resp = run(&svc, &p);
    assert_eq!(body(&resp), "10\ttrade\tT\n");

    let seen = seen.lock().unwrap();
    // initial engine plus one per start record
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|c| *c == vec!["trade".to_string(), "book".to_string()]));
}
