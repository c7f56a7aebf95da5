use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;

mod content;
mod misc;
mod numa;
mod orchestrator;
mod probe;
mod region;
mod stats;
mod worker;

const TOOL_NAME: &str = "ksmstress";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ksmstress: stress and verify kernel same-page merging (KSM).
///
/// Spawns a set of worker processes that each map a large private anonymous
/// region, fill one half with zeros and the other with tiled copies of a
/// filler file, and mark the whole region MADV_MERGEABLE. Every cycle each
/// worker re-checks the region byte for byte and then swaps the two halves,
/// forcing the kernel to re-scan and re-merge the relocated pages. The
/// supervisor polls the kernel merge counters and measures read latency
/// against every worker's region through a forked probe process.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of worker tasks to spawn.
    #[clap(short = 'n', long, default_value = "5")]
    ntasks: usize,

    /// Memory to map per worker, in megabytes.
    #[clap(short = 'm', long, default_value = "100")]
    mem: usize,

    /// File to tile into the mergeable regions (default: first /boot/initrd*).
    #[clap(short = 'f', long)]
    file_to_map: Option<PathBuf>,

    /// Seconds between verification / supervision cycles.
    #[clap(short = 'i', long, default_value = "60")]
    interval: u64,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,

    #[clap(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Worker process (internal use).
    #[clap(hide = true)]
    Worker(worker::WorkerConfig),
}

fn init_logging(verbose: bool) -> Result<()> {
    let loglevel = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} version {}", TOOL_NAME, VERSION);
        return Ok(());
    }

    init_logging(opts.verbose)?;

    match opts.command {
        Some(Cmd::Worker(cfg)) => worker::run(cfg),
        None => orchestrator::run(orchestrator::Config {
            ntasks: opts.ntasks,
            mem_mb: opts.mem,
            file_to_map: opts.file_to_map,
            interval: Duration::from_secs(opts.interval),
        }),
    }
}
