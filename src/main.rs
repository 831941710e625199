use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;

use market_snapshot::config::{DiscoveryKind, ServiceConfig};
use market_snapshot::engine::{EngineKind, EngineRegistry, RAW_FORMAT};
use market_snapshot::logging;
use market_snapshot::replay::{CancelToken, CutoffPolicy};
use market_snapshot::request::{RequestParams, Status, format_nanos, parse_instant};
use market_snapshot::segment::DEFAULT_BUCKET_MINUTES;
use market_snapshot::service::{SnapshotService, StaticTokens};

#[derive(Debug, Parser)]
#[command(version, about = "Reconstruct a market data snapshot from segmented capture logs")]
struct Args {
    /// Directory holding `<exchange>_<minute>.gz` segments
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Exchange identifier (e.g., bitmex)
    #[arg(long, env = "EXCHANGE")]
    exchange: String,

    /// Target instant: integer nanoseconds or RFC 3339
    #[arg(long)]
    at: String,

    /// Channel to reconstruct (repeatable)
    #[arg(long = "channel", short = 'c', required = true)]
    channels: Vec<String>,

    /// Output format; `raw` emits engine state as is
    #[arg(long, default_value = RAW_FORMAT)]
    format: String,

    /// Only print lines for these channels (repeatable)
    #[arg(long = "filter")]
    filter: Vec<String>,

    /// Engine bound to the exchange: depth or last
    #[arg(long, env = "ENGINE", default_value = "depth")]
    engine: EngineKind,

    /// How segments are found: minute or manifest
    #[arg(long, env = "DISCOVERY", default_value = "minute")]
    discovery: DiscoveryKind,

    /// Manifest path (defaults to DATA_DIR/manifest.bin)
    #[arg(long, env = "MANIFEST")]
    manifest: Option<PathBuf>,

    /// Minutes per discovery bucket
    #[arg(long, env = "BUCKET_MINUTES", default_value_t = DEFAULT_BUCKET_MINUTES)]
    bucket_minutes: i64,

    /// Stop policy: at-or-after or after
    #[arg(long, env = "CUTOFF", default_value = "at-or-after")]
    cutoff: CutoffPolicy,

    /// Fetch the next segment while replaying the current one
    #[arg(long, env = "PREFETCH", default_value_t = false)]
    prefetch: bool,

    /// Production deployment (quieter stage logging)
    #[arg(long, env = "PRODUCTION", default_value_t = false)]
    production: bool,

    /// Accepted API key; when unset every caller is accepted
    #[arg(long, env = "API_KEY")]
    api_key: Option<String>,

    /// API key presented by this request
    #[arg(long, env = "TOKEN")]
    token: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,
}

fn run(args: Args) -> Result<ExitCode> {
    let nanosec = parse_instant(&args.at).map_err(anyhow::Error::msg).context("parse --at")?;

    let config = ServiceConfig {
        data_dir: args.data_dir.clone(),
        discovery: args.discovery,
        manifest: args.manifest.clone(),
        bucket_minutes: args.bucket_minutes,
        cutoff: args.cutoff,
        prefetch: args.prefetch,
        production: args.production,
        demo_window: None,
    };
    let mut registry = EngineRegistry::new();
    registry.bind(&args.exchange, args.engine);

    let mut service = SnapshotService::from_config(config, registry)
        .with_context(|| format!("set up {} discovery in {:?}", args.discovery, args.data_dir))?;
    if let Some(key) = &args.api_key {
        service = service.with_authorizer(Arc::new(StaticTokens::new().with_token(key.clone(), "cli")));
    }

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || on_signal.cancel()).context("install Ctrl+C handler")?;

    info!(
        exchange = %args.exchange,
        nanosec,
        at = %format_nanos(nanosec),
        engine = %args.engine,
        "requesting snapshot"
    );
    let params = RequestParams {
        exchange: Some(args.exchange),
        nanosec: Some(nanosec.to_string()),
        channels: args.channels,
        format: Some(args.format),
        filter: args.filter,
        token: args.token,
    };
    let response = service.handle(&params, &cancel);
    info!(status = %response.status, scanned = response.scanned, billed = response.billed, "done");

    if response.status.is_success() {
        let mut out = std::io::stdout().lock();
        out.write_all(&response.body).context("write snapshot")?;
        out.flush().context("flush stdout")?;
    } else {
        eprintln!("{}: {}", response.status, String::from_utf8_lossy(&response.body));
    }
    Ok(match response.status {
        Status::Ok => ExitCode::SUCCESS,
        Status::Empty => ExitCode::from(4),
        Status::Validation => ExitCode::from(2),
        Status::Auth => ExitCode::from(3),
        Status::Internal => ExitCode::FAILURE,
    })
}

fn main() -> Result<ExitCode> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);
    run(args)
}
