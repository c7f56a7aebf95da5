use std::convert::Infallible;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::error;
use log::info;

use crate::content::ReferenceContent;
use crate::misc::close_fd;
use crate::numa;
use crate::probe;
use crate::region::MergeableRegion;

/// Everything a worker needs, passed explicitly across the spawn boundary
/// instead of being inherited as process globals.
#[derive(Debug, clap::Args)]
pub struct WorkerConfig {
    /// Worker index within the task range.
    #[clap(long)]
    pub index: usize,

    /// Megabytes to map.
    #[clap(long)]
    pub mem: usize,

    /// Filler file tiled into the region.
    #[clap(long)]
    pub file_to_map: PathBuf,

    /// Seconds between verify/churn cycles.
    #[clap(long)]
    pub interval: u64,

    /// NUMA node to pin to, when pinning is enabled.
    #[clap(long)]
    pub numa_node: Option<usize>,

    /// Request-pipe read fd inherited from the supervisor.
    #[clap(long)]
    pub request_fd: i32,

    /// Response-pipe write fd inherited from the supervisor.
    #[clap(long)]
    pub response_fd: i32,
}

/// Worker entry point. Runs until signaled; any fatal setup error or
/// detected corruption logs a diagnostic and exits with status 1.
pub fn run(cfg: WorkerConfig) -> ! {
    let pid = unsafe { libc::getpid() };
    match run_inner(&cfg, pid) {
        Ok(never) => match never {},
        Err(e) => {
            error!("worker {} (pid {}): {:#}", cfg.index, pid, e);
            std::process::exit(1);
        }
    }
}

fn run_inner(cfg: &WorkerConfig, pid: i32) -> Result<Infallible> {
    // Placement first, so the region is allocated on the assigned node.
    if let Some(node) = cfg.numa_node {
        numa::pin_self(node);
    }

    let content = ReferenceContent::load(&cfg.file_to_map)?;
    info!(
        "worker {} (pid {}): read {:?} ({} bytes)",
        cfg.index,
        pid,
        cfg.file_to_map,
        content.len()
    );

    let mut region = MergeableRegion::map(cfg.mem, content)?;
    region.advise_mergeable()?;
    info!(
        "worker {} (pid {}): mapped {} mergeable bytes, {} content tiles",
        cfg.index,
        pid,
        region.len(),
        region.ncopies()
    );

    spawn_probe(&region, cfg.request_fd, cfg.response_fd)?;
    // Those fds belong to the probe now.
    close_fd(cfg.request_fd);
    close_fd(cfg.response_fd);

    let interval = Duration::from_secs(cfg.interval);
    loop {
        thread::sleep(interval);
        // Always validate the previous epoch before mutating the region.
        region.verify()?;
        region.churn();
        debug!(
            "worker {} (pid {}): epoch verified, zero half now {:?}",
            cfg.index,
            pid,
            region.zero_half()
        );
    }
}

/// Fork the latency probe. The child inherits the region mapping, serves
/// the request pipe until the supervisor closes it, and exits cleanly.
fn spawn_probe(region: &MergeableRegion, request_fd: i32, response_fd: i32) -> Result<()> {
    let base = region.base_ptr();
    match unsafe { libc::fork() } {
        -1 => bail!(
            "fork of latency probe failed: {}",
            io::Error::last_os_error()
        ),
        0 => {
            probe::serve(request_fd, response_fd, base);
            unsafe { libc::_exit(0) };
        }
        _ => Ok(()),
    }
}
