//! Recovery directory handling.
//!
//! Before replay, the tablet's live WAL directory is atomically renamed to
//! a sibling recovery directory and a fresh, empty WAL directory is created
//! in its place. The rename is the crash-consistency pivot: before it,
//! nothing has changed; after it, bootstrap is restartable from the
//! recovery directory no matter where it is interrupted. The recovery
//! directory is only removed once the new WAL is fully written.

use crate::bootstrap::BootstrapOptions;
use crate::error::{Result, TabletError};
use plateau_core::FsManager;
use plateau_durability::segment::is_segment_file_name;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Stage the tablet's WAL for replay.
///
/// Returns whether there is anything to replay. On return with `true`,
/// every segment to replay lives under the recovery directory and the WAL
/// directory exists and holds no segments.
pub(crate) fn prepare_recovery_dir(fs: &FsManager, tablet_id: &str) -> Result<bool> {
    let wal_dir = fs.tablet_wal_dir(tablet_id);
    let recovery_dir = fs.tablet_wal_recovery_dir(tablet_id);

    if fs.exists(&recovery_dir) {
        // A previous bootstrap was interrupted mid-replay. The recovery
        // directory is the source of truth; anything the aborted attempt
        // wrote into the WAL directory is stale.
        info!(
            target: "plateau::bootstrap",
            tablet_id,
            recovery_dir = %recovery_dir.display(),
            "replaying from previous recovery directory"
        );
        if fs.exists(&wal_dir) {
            let children = fs
                .list_dir(&wal_dir)
                .map_err(|e| TabletError::from(e).prepend("Couldn't list log segments"))?;
            for child in children {
                if !is_segment_file_name(&child) {
                    continue;
                }
                let path = wal_dir.join(&child);
                info!(
                    target: "plateau::bootstrap",
                    tablet_id,
                    path = %path.display(),
                    "removing stale log file from previous aborted recovery attempt"
                );
                fs.delete_file(&path)?;
            }
        } else {
            fs.create_dir_if_missing(&wal_dir)
                .map_err(|e| TabletError::from(e).prepend("Failed to create log dir"))?;
        }
        return Ok(true);
    }

    if !fs.exists(&wal_dir) {
        fs.create_dir_if_missing(&wal_dir)
            .map_err(|e| TabletError::from(e).prepend("Failed to create log dir"))?;
        return Ok(false);
    }

    let children = fs
        .list_dir(&wal_dir)
        .map_err(|e| TabletError::from(e).prepend("Couldn't list log segments"))?;
    let needs_recovery = children.iter().any(|child| is_segment_file_name(child));

    if needs_recovery {
        // Atomically rename the WAL directory to the recovery directory,
        // then re-create an empty WAL directory.
        fs.rename(&wal_dir, &recovery_dir).map_err(|e| {
            TabletError::from(e).prepend(format!(
                "Could not move log directory {} to recovery dir {}",
                wal_dir.display(),
                recovery_dir.display()
            ))
        })?;
        info!(
            target: "plateau::bootstrap",
            tablet_id,
            wal_dir = %wal_dir.display(),
            recovery_dir = %recovery_dir.display(),
            "moved log directory to recovery directory"
        );
        fs.create_dir_if_missing(&wal_dir).map_err(|e| {
            TabletError::from(e)
                .prepend(format!("Failed to recreate log directory {}", wal_dir.display()))
        })?;
    }
    Ok(needs_recovery)
}

/// Remove the recovery directory after a successful replay.
///
/// The directory is renamed aside with a timestamp suffix first, making
/// removal observationally atomic, then deleted unless the options ask to
/// keep it for inspection.
pub(crate) fn remove_recovery_dir(
    fs: &FsManager,
    tablet_id: &str,
    options: &BootstrapOptions,
) -> Result<()> {
    let recovery_dir = fs.tablet_wal_recovery_dir(tablet_id);
    if !fs.exists(&recovery_dir) {
        return Err(TabletError::Internal(format!(
            "tablet WAL recovery dir {} does not exist",
            recovery_dir.display()
        )));
    }

    let tmp_path = recovery_dir.with_file_name(format!(
        "{}-{}",
        recovery_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| tablet_id.to_string()),
        now_micros()
    ));
    fs.rename(&recovery_dir, &tmp_path).map_err(|e| {
        TabletError::from(e).prepend(format!(
            "Could not rename old recovery dir from {} to {}",
            recovery_dir.display(),
            tmp_path.display()
        ))
    })?;
    info!(
        target: "plateau::bootstrap",
        tablet_id,
        renamed = %tmp_path.display(),
        "renamed old recovery directory"
    );

    if options.skip_remove_old_recovery_dir {
        info!(
            target: "plateau::bootstrap",
            tablet_id,
            kept = %tmp_path.display(),
            "skip_remove_old_recovery_dir set, keeping renamed recovery directory"
        );
        return Ok(());
    }

    fs.delete_recursively(&tmp_path)
        .map_err(|e| TabletError::from(e).prepend("Could not remove renamed recovery dir"))?;
    info!(
        target: "plateau::bootstrap",
        tablet_id,
        removed = %tmp_path.display(),
        "removed renamed recovery directory"
    );
    Ok(())
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn segment_marker(fs: &FsManager, dir: &std::path::Path, name: &str) {
        fs.create_dir_if_missing(dir).unwrap();
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_no_wal_dir_creates_one() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let needs = prepare_recovery_dir(&fs, "t1").unwrap();
        assert!(!needs);
        assert!(fs.exists(&fs.tablet_wal_dir("t1")));
        assert!(!fs.exists(&fs.tablet_wal_recovery_dir("t1")));
    }

    #[test]
    fn test_wal_dir_without_segments_needs_no_recovery() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();
        segment_marker(&fs, &fs.tablet_wal_dir("t1"), "notes.txt");

        let needs = prepare_recovery_dir(&fs, "t1").unwrap();
        assert!(!needs);
        assert!(!fs.exists(&fs.tablet_wal_recovery_dir("t1")));
    }

    #[test]
    fn test_wal_dir_with_segments_is_staged() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();
        segment_marker(&fs, &fs.tablet_wal_dir("t1"), "wal-000001.seg");

        let needs = prepare_recovery_dir(&fs, "t1").unwrap();
        assert!(needs);

        // Segments moved to the recovery dir; the WAL dir is empty again.
        assert!(fs.exists(&fs.tablet_wal_recovery_dir("t1").join("wal-000001.seg")));
        assert!(fs.exists(&fs.tablet_wal_dir("t1")));
        assert!(fs.list_dir(&fs.tablet_wal_dir("t1")).unwrap().is_empty());
    }

    #[test]
    fn test_existing_recovery_dir_wins_and_strays_are_deleted() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();
        segment_marker(&fs, &fs.tablet_wal_recovery_dir("t1"), "wal-000001.seg");
        segment_marker(&fs, &fs.tablet_wal_dir("t1"), "wal-000002.seg");
        segment_marker(&fs, &fs.tablet_wal_dir("t1"), "keep.txt");

        let needs = prepare_recovery_dir(&fs, "t1").unwrap();
        assert!(needs);

        // The stray segment from the aborted attempt is gone, non-segment
        // files are untouched, and the recovery dir still holds the source.
        let wal_children = fs.list_dir(&fs.tablet_wal_dir("t1")).unwrap();
        assert_eq!(wal_children, vec!["keep.txt".to_string()]);
        assert!(fs.exists(&fs.tablet_wal_recovery_dir("t1").join("wal-000001.seg")));
    }

    #[test]
    fn test_remove_renames_then_deletes() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();
        segment_marker(&fs, &fs.tablet_wal_recovery_dir("t1"), "wal-000001.seg");

        remove_recovery_dir(&fs, "t1", &BootstrapOptions::default()).unwrap();
        assert!(!fs.exists(&fs.tablet_wal_recovery_dir("t1")));

        // Nothing left behind under wal-recovery.
        let parent = fs.tablet_wal_recovery_dir("t1");
        let parent = parent.parent().unwrap();
        assert!(fs.list_dir(parent).unwrap().is_empty());
    }

    #[test]
    fn test_remove_can_keep_renamed_dir() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();
        segment_marker(&fs, &fs.tablet_wal_recovery_dir("t1"), "wal-000001.seg");

        let options = BootstrapOptions {
            skip_remove_old_recovery_dir: true,
            ..Default::default()
        };
        remove_recovery_dir(&fs, "t1", &options).unwrap();

        // Original name gone, timestamped sibling kept.
        assert!(!fs.exists(&fs.tablet_wal_recovery_dir("t1")));
        let parent = fs.tablet_wal_recovery_dir("t1");
        let parent = parent.parent().unwrap();
        let children = fs.list_dir(parent).unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].starts_with("t1-"));
    }

    #[test]
    fn test_remove_without_recovery_dir_is_internal_error() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();
        let err = remove_recovery_dir(&fs, "t1", &BootstrapOptions::default()).unwrap_err();
        assert!(matches!(err, TabletError::Internal(_)));
    }
}
