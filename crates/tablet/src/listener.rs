//! Tablet status reporting.

use crate::metadata::TabletMetadata;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Receives human-readable progress messages for one tablet.
///
/// Bootstrap reports its milestones here; the server's status pages read
/// the latest message back. May be called from the bootstrap thread while
/// readers poll, so the last-status field sits behind a lock.
pub struct TabletStatusListener {
    meta: Arc<TabletMetadata>,
    last_status: RwLock<String>,
}

impl TabletStatusListener {
    /// A listener for the given tablet.
    pub fn new(meta: Arc<TabletMetadata>) -> Self {
        TabletStatusListener {
            meta,
            last_status: RwLock::new(String::new()),
        }
    }

    /// The tablet this listener reports on.
    pub fn tablet_id(&self) -> String {
        self.meta.oid()
    }

    /// Name of the owning table.
    pub fn table_name(&self) -> String {
        self.meta.table_name()
    }

    /// Record and log a new status message.
    pub fn status_message(&self, status: impl Into<String>) {
        let status = status.into();
        info!(
            target: "plateau::tablet",
            tablet_id = %self.meta.oid(),
            status = %status,
            "tablet status"
        );
        *self.last_status.write() = status;
    }

    /// The most recent status message.
    pub fn last_status(&self) -> String {
        self.last_status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TabletSuperBlock;
    use plateau_core::FsManager;
    use tempfile::tempdir;

    #[test]
    fn test_last_status_tracks_messages() {
        let dir = tempdir().unwrap();
        let fs = Arc::new(FsManager::open(dir.path()).unwrap());
        let meta =
            TabletMetadata::create(fs, TabletSuperBlock::new_empty("t1", "orders")).unwrap();

        let listener = TabletStatusListener::new(meta);
        assert_eq!(listener.last_status(), "");

        listener.status_message("Bootstrap starting.");
        assert_eq!(listener.last_status(), "Bootstrap starting.");

        listener.status_message("Bootstrap complete.");
        assert_eq!(listener.last_status(), "Bootstrap complete.");
        assert_eq!(listener.tablet_id(), "t1");
    }
}
