//! Consensus metadata persistence.
//!
//! Consensus metadata records the committed replica configuration for a
//! tablet. Bootstrap loads it up front, may overwrite the committed quorum
//! in memory while replaying CHANGE_CONFIG operations, and flushes it
//! exactly once at the end.

use crate::error::{Result, TabletError};
use plateau_core::quorum::Quorum;
use plateau_core::FsManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsensusState {
    committed_quorum: Quorum,
}

/// A tablet's consensus metadata.
pub struct ConsensusMetadata {
    fs: Arc<FsManager>,
    tablet_id: String,
    state: ConsensusState,
}

impl ConsensusMetadata {
    /// Create consensus metadata for a new tablet and persist it.
    pub fn create(
        fs: Arc<FsManager>,
        tablet_id: impl Into<String>,
        committed_quorum: Quorum,
    ) -> Result<Self> {
        let cmeta = ConsensusMetadata {
            fs,
            tablet_id: tablet_id.into(),
            state: ConsensusState { committed_quorum },
        };
        cmeta.flush()?;
        Ok(cmeta)
    }

    /// Load a tablet's consensus metadata from disk.
    pub fn load(fs: Arc<FsManager>, tablet_id: &str) -> Result<Self> {
        let path = fs.consensus_metadata_path(tablet_id);
        if !fs.exists(&path) {
            return Err(TabletError::NotFound(format!(
                "consensus metadata for {} not found at {}",
                tablet_id,
                path.display()
            )));
        }
        let bytes = fs.read_file(&path)?;
        let state: ConsensusState = serde_json::from_slice(&bytes).map_err(|e| {
            TabletError::Corruption(format!(
                "consensus metadata for {} is unreadable: {}",
                tablet_id, e
            ))
        })?;
        Ok(ConsensusMetadata {
            fs,
            tablet_id: tablet_id.to_string(),
            state,
        })
    }

    /// The tablet this metadata belongs to.
    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// The committed replica configuration.
    pub fn committed_quorum(&self) -> &Quorum {
        &self.state.committed_quorum
    }

    /// Replace the committed configuration in memory. Persisted by the
    /// next `flush`.
    pub fn set_committed_quorum(&mut self, quorum: Quorum) {
        self.state.committed_quorum = quorum;
    }

    /// Persist the current state.
    pub fn flush(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state).map_err(|e| {
            TabletError::Internal(format!("could not encode consensus metadata: {}", e))
        })?;
        let path = self.fs.consensus_metadata_path(&self.tablet_id);
        self.fs.write_file_atomic(&path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let fs = Arc::new(FsManager::open(dir.path()).unwrap());

        ConsensusMetadata::create(Arc::clone(&fs), "t1", Quorum::single(3, "peer-a")).unwrap();

        let loaded = ConsensusMetadata::load(fs, "t1").unwrap();
        assert_eq!(loaded.committed_quorum().seqno, 3);
        assert_eq!(loaded.committed_quorum().peers[0].uuid, "peer-a");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let fs = Arc::new(FsManager::open(dir.path()).unwrap());
        assert!(matches!(
            ConsensusMetadata::load(fs, "absent"),
            Err(TabletError::NotFound(_))
        ));
    }

    #[test]
    fn test_mutation_visible_after_flush_and_reload() {
        let dir = tempdir().unwrap();
        let fs = Arc::new(FsManager::open(dir.path()).unwrap());

        let mut cmeta =
            ConsensusMetadata::create(Arc::clone(&fs), "t1", Quorum::single(1, "peer-a")).unwrap();
        cmeta.set_committed_quorum(Quorum::single(2, "peer-b"));

        // Not yet flushed: disk still has the old quorum.
        let before = ConsensusMetadata::load(Arc::clone(&fs), "t1").unwrap();
        assert_eq!(before.committed_quorum().seqno, 1);

        cmeta.flush().unwrap();
        let after = ConsensusMetadata::load(fs, "t1").unwrap();
        assert_eq!(after.committed_quorum().seqno, 2);
    }
}
