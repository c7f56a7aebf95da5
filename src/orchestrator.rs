use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::content;
use crate::misc::close_fd;
use crate::numa::NumaPlacement;
use crate::probe::ProbeChannel;
use crate::probe::ProbeHandle;
use crate::probe::LATENCY_WARN_MS;
use crate::probe::PROBE_REPLY;
use crate::stats::KsmSysfs;

/// Grace period for workers to react to SIGTERM during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra delay before spawning a suspiciously large task count.
const CAUTION_TASKS: usize = 100;

pub struct Config {
    pub ntasks: usize,
    pub mem_mb: usize,
    pub file_to_map: Option<PathBuf>,
    pub interval: Duration,
}

struct WorkerHandle {
    index: usize,
    pid: i32,
    child: Child,
    probe: ProbeHandle,
}

struct OrchestratorState {
    workers: Vec<WorkerHandle>,
}

/// Supervise the whole run. Diverges: the only way out is the interrupt
/// triggered teardown, after which the process exits with status 1.
pub fn run(cfg: Config) -> Result<()> {
    let ksm = KsmSysfs::new();
    info!("ksm enabled: {}", ksm.read_flag("run")? as u8);
    info!(
        "ksm merge across numa nodes enabled: {}",
        ksm.read_flag("merge_across_nodes")? as u8
    );

    let file_to_map = match cfg.file_to_map.clone().or_else(content::default_file_to_map) {
        Some(f) => f,
        None => bail!(
            "no {}/{}* found to map; provide one with --file-to-map",
            content::DEFAULT_FILE_DIR,
            content::DEFAULT_FILE_PREFIX
        ),
    };

    if cfg.ntasks > CAUTION_TASKS {
        warn!("are you sure you wanted {} tasks?", cfg.ntasks);
        warn!("sleeping 20 seconds so you can ctrl-c");
        thread::sleep(Duration::from_secs(20));
    }

    let numa = NumaPlacement::probe();
    if numa.enabled() {
        let (lo, hi) = numa.node_range();
        info!("NUMA nodes {}-{} reported, splitting workers two ways", lo, hi);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut state = OrchestratorState::spawn_workers(&cfg, &file_to_map, &numa)?;

    while !shutdown.load(Ordering::Relaxed) {
        ksm.snapshot().log();
        state.reap_exited();
        if sleep_interruptible(cfg.interval, &shutdown) {
            break;
        }
        state.probe_latency();
        if sleep_interruptible(cfg.interval, &shutdown) {
            break;
        }
    }

    info!("interrupted, stopping {} workers", state.workers.len());
    state.teardown();
    info!("shutdown complete");
    std::process::exit(1);
}

impl OrchestratorState {
    fn spawn_workers(cfg: &Config, file_to_map: &Path, numa: &NumaPlacement) -> Result<Self> {
        let exe = std::env::current_exe().context("failed to resolve own executable")?;
        let mut workers = Vec::with_capacity(cfg.ntasks);

        for index in 0..cfg.ntasks {
            let chan = ProbeChannel::new()?;

            let mut cmd = Command::new(&exe);
            cmd.arg("worker")
                .arg("--index")
                .arg(index.to_string())
                .arg("--mem")
                .arg(cfg.mem_mb.to_string())
                .arg("--file-to-map")
                .arg(file_to_map)
                .arg("--interval")
                .arg(cfg.interval.as_secs().to_string())
                .arg("--request-fd")
                .arg(chan.request_read.to_string())
                .arg("--response-fd")
                .arg(chan.response_write.to_string());
            if let Some(node) = numa.node_for_task(index, cfg.ntasks) {
                cmd.arg("--numa-node").arg(node.to_string());
            }

            let child = cmd
                .spawn()
                .with_context(|| format!("failed to spawn worker {}", index))?;

            // The child side of both pipes lives on in the worker's probe.
            close_fd(chan.request_read);
            close_fd(chan.response_write);

            let pid = child.id() as i32;
            info!("spawned worker {} (pid {})", index, pid);
            workers.push(WorkerHandle {
                index,
                pid,
                child,
                probe: ProbeHandle::new(chan.request_write, chan.response_read),
            });
        }

        Ok(Self { workers })
    }

    /// Non-blocking liveness check. A reaped pid gets one warning and is
    /// dropped from the table; the run continues with the rest. A dead
    /// worker is a signal to the operator, not a recoverable event.
    fn reap_exited(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            match ret {
                0 => return,
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ECHILD) {
                        warn!("waitpid returned error: {}", err);
                    }
                    return;
                }
                pid => {
                    warn!("worker pid {} exited", pid);
                    self.workers.retain(|w| w.pid != pid);
                }
            }
        }
    }

    /// One latency round trip per worker, strictly sequential. The response
    /// read has no timeout; a hung probe stalls the cycle and is itself the
    /// signal to go look at that worker.
    fn probe_latency(&self) {
        for w in &self.workers {
            let mut reply = [0u8; PROBE_REPLY];
            match w.probe.round_trip(&mut reply) {
                Ok(elapsed) => {
                    debug!(
                        "worker {} (pid {}) probe round trip {} us",
                        w.index,
                        w.pid,
                        elapsed.as_micros()
                    );
                    if elapsed > Duration::from_millis(LATENCY_WARN_MS) {
                        warn!(
                            "worker {} (pid {}) latency probe took {} ms",
                            w.index,
                            w.pid,
                            elapsed.as_millis()
                        );
                    }
                }
                Err(e) => warn!("worker {} (pid {}) latency probe: {:#}", w.index, w.pid, e),
            }
        }
    }

    /// SIGTERM every worker, then poll try_wait with a deadline. At most
    /// one warning per worker that did not exit in time.
    fn teardown(&mut self) {
        for w in &self.workers {
            unsafe {
                libc::kill(w.pid, libc::SIGTERM);
            }
        }

        for w in &mut self.workers {
            let deadline = Instant::now() + TEARDOWN_TIMEOUT;
            loop {
                match w.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            warn!("worker pid {} may not have exited properly", w.pid);
                            break;
                        }
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        warn!("wait for worker pid {} failed: {}", w.pid, e);
                        break;
                    }
                }
            }
        }
    }
}

/// Sleep in short slices so a pending shutdown is honored promptly instead
/// of waiting out a full interval. Returns true when shutdown is requested.
fn sleep_interruptible(dur: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + dur;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    shutdown.load(Ordering::Relaxed)
}
