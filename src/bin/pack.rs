use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::fs::File;
use std::io::{BufReader, stdin};
use std::path::PathBuf;

use market_snapshot::logging;
use market_snapshot::request::format_nanos;
use market_snapshot::writer::pack;

#[derive(Debug, Parser)]
#[command(about = "Split a plain capture log into per-minute gzip segments and a manifest")]
struct Args {
    /// Plain capture log to read; `-` reads stdin
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Output segment directory
    #[arg(long, short = 'o', env = "DATA_DIR", default_value = "data")]
    out: PathBuf,

    /// Exchange identifier used in segment keys
    #[arg(long, env = "EXCHANGE")]
    exchange: String,

    /// Print every segment written
    #[arg(long, default_value_t = false)]
    list: bool,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let _ = dotenv();
    let args = Args::parse();
    logging::init(&args.log_level, false);

    let entries = if args.input.as_os_str() == "-" {
        pack(stdin().lock(), &args.out, &args.exchange)
    } else {
        let file = File::open(&args.input).with_context(|| format!("open {:?}", args.input))?;
        pack(BufReader::new(file), &args.out, &args.exchange)
    }
    .with_context(|| format!("pack {} into {:?}", args.exchange, args.out))?;

    if args.list {
        for e in &entries {
            println!("{}\t{}\t{}", e.key, e.first_timestamp, format_nanos(e.first_timestamp));
        }
    }
    eprintln!("wrote {} segments for {} into {:?}", entries.len(), args.exchange, args.out);
    Ok(())
}
