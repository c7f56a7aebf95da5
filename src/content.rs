use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

pub const DEFAULT_FILE_DIR: &str = "/boot";
pub const DEFAULT_FILE_PREFIX: &str = "initrd";

/// Immutable filler data, read once per worker and tiled into the content
/// half of its mergeable region.
pub struct ReferenceContent {
    data: Vec<u8>,
}

impl ReferenceContent {
    pub fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("failed to read filler file {:?}", path))?;
        if data.is_empty() {
            bail!("filler file {:?} is empty, nothing to tile", path);
        }
        Ok(Self { data })
    }

    #[cfg(test)]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Default filler: the first /boot/initrd* directory entry, same as the
/// kernel image most machines booted from.
pub fn default_file_to_map() -> Option<PathBuf> {
    find_in_dir(Path::new(DEFAULT_FILE_DIR), DEFAULT_FILE_PREFIX)
}

fn find_in_dir(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            return Some(entry.path());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_reads_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filler");
        fs::write(&path, b"abcdef").unwrap();

        let content = ReferenceContent::load(&path).unwrap();
        assert_eq!(content.as_slice(), b"abcdef");
        assert_eq!(content.len(), 6);
    }

    #[test]
    fn load_rejects_empty_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        assert!(ReferenceContent::load(&path).is_err());
        assert!(ReferenceContent::load(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn discovery_matches_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vmlinuz-6.1"), b"x").unwrap();
        fs::write(dir.path().join("initrd.img-6.1"), b"x").unwrap();

        let found = find_in_dir(dir.path(), "initrd").unwrap();
        assert_eq!(found.file_name().unwrap(), "initrd.img-6.1");
        assert!(find_in_dir(dir.path(), "grub").is_none());
    }

    #[test]
    fn discovery_handles_missing_dir() {
        assert!(find_in_dir(Path::new("/nonexistent-dir"), "initrd").is_none());
    }
}
