use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Result;
use log::info;

use crate::misc::read_from_file;

pub const KSM_SYSFS: &str = "/sys/kernel/mm/ksm";

/// Point-in-time read of the kernel's merge counters. Missing or malformed
/// counter files silently read as zero; only the feature flags are load
/// bearing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub full_scans: u64,
    pub pages_shared: u64,
    pub pages_sharing: u64,
    pub pages_unshared: u64,
    pub pages_volatile: u64,
}

impl StatsSnapshot {
    pub fn log(&self) {
        info!("KSM status:");
        info!("  Full scans: {}", self.full_scans);
        info!("  Pages shared: {}", self.pages_shared);
        info!("  Pages unshared: {}", self.pages_unshared);
        info!("  Pages sharing: {}", self.pages_sharing);
        info!("  Pages volatile: {}", self.pages_volatile);
    }
}

pub struct KsmSysfs {
    root: PathBuf,
}

impl KsmSysfs {
    pub fn new() -> Self {
        Self::at(KSM_SYSFS)
    }

    fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Feature flags must exist and read 0 or 1. Anything else means the
    /// kernel interface is not what we expect, which is fatal at startup.
    pub fn read_flag(&self, name: &str) -> Result<bool> {
        let path = self.root.join(name);
        match read_from_file::<u64>(&path) {
            Ok(0) => Ok(false),
            Ok(1) => Ok(true),
            Ok(v) => bail!("{:?} seems bogus (read {})", path, v),
            Err(_) => bail!("{:?} seems bogus (missing or unparsable)", path),
        }
    }

    fn counter(&self, name: &str) -> u64 {
        read_from_file(&self.root.join(name)).unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            full_scans: self.counter("full_scans"),
            pages_shared: self.counter("pages_shared"),
            pages_sharing: self.counter("pages_sharing"),
            pages_unshared: self.counter("pages_unshared"),
            pages_volatile: self.counter("pages_volatile"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sysfs(files: &[(&str, &str)]) -> (tempfile::TempDir, KsmSysfs) {
        let dir = tempfile::tempdir().unwrap();
        for (name, val) in files {
            fs::write(dir.path().join(name), val).unwrap();
        }
        let ksm = KsmSysfs::at(dir.path());
        (dir, ksm)
    }

    #[test]
    fn snapshot_reads_all_counters() {
        let (_dir, ksm) = sysfs(&[
            ("full_scans", "3\n"),
            ("pages_shared", "100\n"),
            ("pages_sharing", "4200\n"),
            ("pages_unshared", "7\n"),
            ("pages_volatile", "9\n"),
        ]);
        assert_eq!(
            ksm.snapshot(),
            StatsSnapshot {
                full_scans: 3,
                pages_shared: 100,
                pages_sharing: 4200,
                pages_unshared: 7,
                pages_volatile: 9,
            }
        );
    }

    #[test]
    fn missing_or_malformed_counters_read_zero() {
        let (_dir, ksm) = sysfs(&[("pages_shared", "12\n"), ("full_scans", "bogus\n")]);
        let snap = ksm.snapshot();
        assert_eq!(snap.pages_shared, 12);
        assert_eq!(snap.full_scans, 0);
        assert_eq!(snap.pages_volatile, 0);
    }

    #[test]
    fn flags_parse_zero_and_one() {
        let (_dir, ksm) = sysfs(&[("run", "1\n"), ("merge_across_nodes", "0\n")]);
        assert!(ksm.read_flag("run").unwrap());
        assert!(!ksm.read_flag("merge_across_nodes").unwrap());
    }

    #[test]
    fn bogus_or_missing_flag_is_fatal() {
        let (_dir, ksm) = sysfs(&[("run", "7\n")]);
        assert!(ksm.read_flag("run").is_err());
        assert!(ksm.read_flag("merge_across_nodes").is_err());
    }
}
