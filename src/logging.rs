//! Logging setup for the binaries.
//!
//! Output goes to stderr so stdout stays free for snapshot bodies. `RUST_LOG`
//! overrides the level given on the command line.
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(level: &str, json: bool) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
        let installed = if json {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt().with_target(false).with_writer(std::io::stderr).with_env_filter(filter).try_init()
        };
        match installed {
            Ok(()) => tracing::debug!(level, json, "logging initialized"),
            // another subscriber was installed first (tests)
            Err(e) => eprintln!("logging already initialized: {e}"),
        }
    });
}
