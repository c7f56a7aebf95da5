use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;

pub const CPUSET_ROOT: &str = "/sys/fs/cgroup/cpuset";

/// Valid NUMA node range as reported by the root cpuset, read once at
/// startup. An unreadable or malformed range disables pinning for the
/// whole run.
#[derive(Debug, Clone)]
pub struct NumaPlacement {
    root: PathBuf,
    min_node: usize,
    max_node: usize,
}

impl NumaPlacement {
    pub fn probe() -> Self {
        Self::probe_at(CPUSET_ROOT)
    }

    fn probe_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let (min_node, max_node) = match fs::read_to_string(root.join("cpuset.mems"))
            .map_err(anyhow::Error::from)
            .and_then(|s| parse_node_range(&s))
        {
            Ok(range) => range,
            Err(e) => {
                warn!("NUMA pinning disabled: {:#}", e);
                (0, 0)
            }
        };
        Self {
            root,
            min_node,
            max_node,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_node > self.min_node
    }

    pub fn node_range(&self) -> (usize, usize) {
        (self.min_node, self.max_node)
    }

    /// Coarse two-way split: tasks in the lower half of the index range go
    /// to node 0, the rest to node 1. Assumes a two-node topology even
    /// when the range reports more nodes.
    pub fn node_for_task(&self, index: usize, ntasks: usize) -> Option<usize> {
        if !self.enabled() {
            return None;
        }
        Some(if index < ntasks / 2 { 0 } else { 1 })
    }
}

/// Parse a cpuset mems range like "0-1" or a bare "0".
fn parse_node_range(s: &str) -> Result<(usize, usize)> {
    let s = s.trim();
    match s.split_once('-') {
        Some((lo, hi)) => {
            let lo = lo.trim().parse().context("bad lower node bound")?;
            let hi = hi.trim().parse().context("bad upper node bound")?;
            Ok((lo, hi))
        }
        None => {
            let v = s.trim().parse().context("bad node id")?;
            Ok((v, v))
        }
    }
}

/// Move the calling process into a fresh cpuset bound to `node`. Best
/// effort: the worker keeps going unpinned on any failure.
pub fn pin_self(node: usize) {
    let pid = unsafe { libc::getpid() };
    match pin_pid_at(Path::new(CPUSET_ROOT), pid, node) {
        Ok(()) => info!("pid {} pinned to NUMA node {}", pid, node),
        Err(e) => warn!("pid {} proceeding unpinned: {:#}", pid, e),
    }
}

fn pin_pid_at(root: &Path, pid: i32, node: usize) -> Result<()> {
    // The cpuset needs cpus and mems populated before a task can join.
    let cpus = fs::read_to_string(root.join("cpuset.cpus"))
        .context("failed to read root cpuset.cpus")?;

    let group = root.join(format!("ksmstress-{}", pid));
    fs::create_dir(&group).with_context(|| format!("failed to create cpuset {:?}", group))?;
    fs::write(group.join("cpuset.cpus"), cpus.trim()).context("failed to write cpuset.cpus")?;
    fs::write(group.join("cpuset.mems"), format!("{}", node))
        .context("failed to write cpuset.mems")?;
    fs::write(group.join("tasks"), format!("{}", pid)).context("failed to join cpuset")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpuset(mems: Option<&str>) -> (tempfile::TempDir, NumaPlacement) {
        let dir = tempfile::tempdir().unwrap();
        if let Some(mems) = mems {
            fs::write(dir.path().join("cpuset.mems"), mems).unwrap();
        }
        let numa = NumaPlacement::probe_at(dir.path());
        (dir, numa)
    }

    #[test]
    fn two_node_range_enables_pinning() {
        let (_dir, numa) = cpuset(Some("0-1\n"));
        assert!(numa.enabled());
        assert_eq!(numa.node_range(), (0, 1));
    }

    #[test]
    fn single_node_or_bad_range_disables_pinning() {
        let (_dir, numa) = cpuset(Some("0\n"));
        assert!(!numa.enabled());

        let (_dir, numa) = cpuset(Some("garbage\n"));
        assert!(!numa.enabled());
        assert_eq!(numa.node_range(), (0, 0));

        let (_dir, numa) = cpuset(None);
        assert!(!numa.enabled());
    }

    #[test]
    fn tasks_split_two_ways_by_index() {
        let (_dir, numa) = cpuset(Some("0-1\n"));
        assert_eq!(numa.node_for_task(0, 4), Some(0));
        assert_eq!(numa.node_for_task(1, 4), Some(0));
        assert_eq!(numa.node_for_task(2, 4), Some(1));
        assert_eq!(numa.node_for_task(3, 4), Some(1));

        // odd counts put the middle task on node 1
        assert_eq!(numa.node_for_task(1, 3), Some(1));
    }

    // The split stays two-way even when the range reports more nodes.
    #[test]
    fn wide_ranges_still_split_two_ways() {
        let (_dir, numa) = cpuset(Some("0-3\n"));
        assert!(numa.enabled());
        assert_eq!(numa.node_for_task(7, 8), Some(1));
    }

    #[test]
    fn disabled_placement_assigns_no_node() {
        let (_dir, numa) = cpuset(None);
        assert_eq!(numa.node_for_task(0, 4), None);
    }

    #[test]
    fn pin_writes_the_placement_group() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpuset.cpus"), "0-7\n").unwrap();
        fs::write(dir.path().join("cpuset.mems"), "0-1\n").unwrap();

        pin_pid_at(dir.path(), 1234, 1).unwrap();

        let group = dir.path().join("ksmstress-1234");
        assert_eq!(fs::read_to_string(group.join("cpuset.cpus")).unwrap(), "0-7");
        assert_eq!(fs::read_to_string(group.join("cpuset.mems")).unwrap(), "1");
        assert_eq!(fs::read_to_string(group.join("tasks")).unwrap(), "1234");
    }

    #[test]
    fn pin_without_root_cpus_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pin_pid_at(dir.path(), 1234, 0).is_err());
    }
}
