use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;

use crate::config::{Config, DEFAULT_CPU_LIMIT};
use crate::version::{CargoRebuilder, GuardPolicy};

mod columns;
mod config;
mod encoder;
mod error;
mod gtfs;
mod limiter;
mod parser;
mod precache;
mod progress;
mod resources;
mod version;

#[derive(Parser, Debug)]
#[command(
    name = "gtfs-precache",
    version,
    about = "Precompress a GTFS stop_times file into a MessagePack document",
    long_about = "Reads a GTFS stop_times file and writes a MessagePack document of the form \
                  {\"stop_times\": [{trip_id, stop_id, arrival_time, departure_time, stop_sequence}, ...]} \
                  for fast loading on memory-constrained devices.\n\n\
                  Rows that fail validation are logged and skipped. CPU usage is capped so the \
                  tool can run next to latency-sensitive services."
)]
struct Args {
    /// Input stop_times file (comma separated, with a header line)
    input: PathBuf,

    /// Output MessagePack file
    output: PathBuf,

    /// Maximum CPU usage in percent of one core
    #[arg(
        long,
        env = "GTFS_PRECACHE_CPU_LIMIT",
        default_value_t = DEFAULT_CPU_LIMIT,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    cpu_limit: u8,

    /// Cargo manifest declaring the expected tool version
    #[arg(long, env = "GTFS_PRECACHE_VERSION_FILE", default_value = version::DEFAULT_DECLARATION)]
    version_file: PathBuf,

    /// On a version mismatch, run `cargo build --release` and restart instead of exiting
    #[arg(long)]
    rebuild: bool,

    /// Seconds to wait for the rebuild before giving up
    #[arg(long, default_value_t = version::DEFAULT_REBUILD_TIMEOUT.as_secs())]
    rebuild_timeout: u64,

    /// Decode the written document and check its row count
    #[arg(long)]
    verify: bool,

    /// Hide the progress line
    #[arg(short, long)]
    quiet: bool,

    /// Verbose output (show debug messages)
    #[arg(short, long)]
    verbose: bool,
}

/// Help and version requests succeed; every other argument error is fatal.
fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

fn main() -> Result<()> {
    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(exit_code(err.kind()))
    });

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .format_timestamp(None)
    .init();

    log::info!("GTFS Precache Tool v{}", version::EMBEDDED_VERSION);

    let check = version::check(version::EMBEDDED_VERSION, &args.version_file);
    log::debug!("Version check against {}: {:?}", args.version_file.display(), check);
    let policy = GuardPolicy {
        rebuild: args.rebuild,
        restarted: std::env::var_os(version::RESTART_MARKER).is_some(),
    };
    let mut rebuilder =
        CargoRebuilder::new(&args.version_file, Duration::from_secs(args.rebuild_timeout));
    let restart_args: Vec<OsString> = std::env::args_os().skip(1).collect();
    version::enforce(check, policy, &mut rebuilder, &restart_args)?;

    let config = Config {
        cpu_limit: args.cpu_limit,
        show_progress: !args.quiet,
        verify: args.verify,
        ..Config::new(&args.input, &args.output)
    };
    log::info!("Starting with CPU limit: {}%", config.cpu_limit);

    precache::run(&config)
        .with_context(|| format!("Failed to precache {}", args.input.display()))?;
    Ok(())
}
