//! Filesystem layout and primitive operations for a tablet server root.
//!
//! Every tablet keeps its state under well-known children of the server
//! root:
//!
//! ```text
//! <root>/wal/<tablet_id>/            active WAL segments
//! <root>/wal-recovery/<tablet_id>/   set-aside segments during bootstrap
//! <root>/tablet-meta/<tablet_id>     tablet superblock
//! <root>/consensus-meta/<tablet_id>  consensus metadata
//! ```
//!
//! `FsManager` owns the layout and exposes the small set of primitive
//! operations the rest of the system performs on it. Renames are atomic on
//! the same filesystem, which the recovery flow relies on.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const WAL_DIR: &str = "wal";
const WAL_RECOVERY_DIR: &str = "wal-recovery";
const TABLET_META_DIR: &str = "tablet-meta";
const CONSENSUS_META_DIR: &str = "consensus-meta";

/// Owns the on-disk layout of a tablet server root.
#[derive(Debug)]
pub struct FsManager {
    root: PathBuf,
}

impl FsManager {
    /// Open a server root, creating the layout directories if missing.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        for child in [WAL_DIR, WAL_RECOVERY_DIR, TABLET_META_DIR, CONSENSUS_META_DIR] {
            std::fs::create_dir_all(root.join(child))?;
        }
        debug!(target: "plateau::fs", root = %root.display(), "opened filesystem root");
        Ok(FsManager { root })
    }

    /// The server root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// WAL directory for a tablet.
    pub fn tablet_wal_dir(&self, tablet_id: &str) -> PathBuf {
        self.root.join(WAL_DIR).join(tablet_id)
    }

    /// WAL recovery directory for a tablet.
    pub fn tablet_wal_recovery_dir(&self, tablet_id: &str) -> PathBuf {
        self.root.join(WAL_RECOVERY_DIR).join(tablet_id)
    }

    /// Path of a tablet's superblock file.
    pub fn tablet_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.root.join(TABLET_META_DIR).join(tablet_id)
    }

    /// Path of a tablet's consensus metadata file.
    pub fn consensus_metadata_path(&self, tablet_id: &str) -> PathBuf {
        self.root.join(CONSENSUS_META_DIR).join(tablet_id)
    }

    /// Whether a path exists.
    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Create a directory (and parents) unless it already exists.
    pub fn create_dir_if_missing(&self, path: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(path)
    }

    /// File names of a directory's children, in unspecified order.
    pub fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Atomically rename `src` to `dst`. Both must be on this root's
    /// filesystem.
    pub fn rename(&self, src: &Path, dst: &Path) -> std::io::Result<()> {
        std::fs::rename(src, dst)
    }

    /// Delete a single file.
    pub fn delete_file(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }

    /// Delete a directory and everything under it.
    pub fn delete_recursively(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    /// Write a file using write-fsync-rename so a crash never leaves a
    /// partially written file at `path`.
    pub fn write_file_atomic(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, path)?;

        if let Some(parent) = path.parent() {
            if parent.exists() {
                let dir = File::open(parent)?;
                dir.sync_all()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        assert!(fs.exists(&dir.path().join("wal")));
        assert!(fs.exists(&dir.path().join("wal-recovery")));
        assert!(fs.exists(&dir.path().join("tablet-meta")));
        assert!(fs.exists(&dir.path().join("consensus-meta")));
    }

    #[test]
    fn test_tablet_paths() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        assert_eq!(fs.tablet_wal_dir("t1"), dir.path().join("wal").join("t1"));
        assert_eq!(
            fs.tablet_wal_recovery_dir("t1"),
            dir.path().join("wal-recovery").join("t1")
        );
    }

    #[test]
    fn test_write_file_atomic_roundtrip() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let path = fs.tablet_metadata_path("t1");
        fs.write_file_atomic(&path, b"hello").unwrap();
        assert_eq!(fs.read_file(&path).unwrap(), b"hello");

        // No temp file left behind.
        assert!(!fs.exists(&path.with_extension("tmp")));
    }

    #[test]
    fn test_rename_moves_directory() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let src = fs.tablet_wal_dir("t1");
        fs.create_dir_if_missing(&src).unwrap();
        std::fs::write(src.join("marker"), b"x").unwrap();

        let dst = fs.tablet_wal_recovery_dir("t1");
        fs.rename(&src, &dst).unwrap();

        assert!(!fs.exists(&src));
        assert!(fs.exists(&dst.join("marker")));
    }
}
