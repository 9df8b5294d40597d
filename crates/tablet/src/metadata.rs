//! Tablet metadata (superblock) persistence.
//!
//! The superblock records everything the bootstrap filter needs to know
//! about persisted row data: which memrowsets were flushed into rowsets and
//! how far each rowset's redo delta stores were compacted. It is persisted
//! as JSON through `FsManager::write_file_atomic`, so a crash never leaves
//! a half-written superblock behind.
//!
//! Store id conventions: memrowset and delta-memstore ids start at 1, and a
//! `last_durable_*` value of 0 means nothing has been flushed yet.

use crate::error::{Result, TabletError};
use parking_lot::RwLock;
use plateau_core::schema::Schema;
use plateau_core::FsManager;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Progress of a remote (cross-node) bootstrap for this tablet.
///
/// Local WAL bootstrap refuses to run unless the state is `Done`: any other
/// value means the on-disk files may be a partial copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteBootstrapState {
    /// All files were copied (or the tablet was created locally).
    Done,
    /// A copy from another replica was still in flight.
    Copying,
}

/// Durable metadata of one on-disk rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSetMetadata {
    /// Rowset id.
    pub rs_id: u64,
    /// Highest delta-memstore id compacted into this rowset's on-disk
    /// delta files. 0 if none.
    pub last_durable_redo_dms_id: u64,
}

/// The persisted root of a tablet's durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletSuperBlock {
    /// Tablet id (the oid).
    pub tablet_id: String,
    /// Name of the owning table.
    pub table_name: String,
    /// Current schema.
    pub schema: Schema,
    /// Highest memrowset id flushed into a rowset. 0 if none.
    pub last_durable_mrs_id: u64,
    /// Metadata of every live rowset.
    pub rowsets: Vec<RowSetMetadata>,
    /// Remote bootstrap progress.
    pub remote_bootstrap_state: RemoteBootstrapState,
}

impl TabletSuperBlock {
    /// A brand-new empty tablet.
    pub fn new_empty(tablet_id: impl Into<String>, table_name: impl Into<String>) -> Self {
        TabletSuperBlock {
            tablet_id: tablet_id.into(),
            table_name: table_name.into(),
            schema: Schema::simple(),
            last_durable_mrs_id: 0,
            rowsets: Vec::new(),
            remote_bootstrap_state: RemoteBootstrapState::Done,
        }
    }
}

/// Shared handle on a tablet's metadata.
///
/// Flushes can be pinned for the duration of bootstrap so the replay filter
/// never races a concurrent durable change.
pub struct TabletMetadata {
    fs: Arc<FsManager>,
    state: RwLock<TabletSuperBlock>,
    flush_pins: AtomicU32,
}

impl TabletMetadata {
    /// Create metadata for a new tablet and persist it.
    pub fn create(fs: Arc<FsManager>, superblock: TabletSuperBlock) -> Result<Arc<Self>> {
        let meta = Arc::new(TabletMetadata {
            fs,
            state: RwLock::new(superblock),
            flush_pins: AtomicU32::new(0),
        });
        meta.flush()?;
        Ok(meta)
    }

    /// Load a tablet's metadata from disk.
    pub fn load(fs: Arc<FsManager>, tablet_id: &str) -> Result<Arc<Self>> {
        let path = fs.tablet_metadata_path(tablet_id);
        if !fs.exists(&path) {
            return Err(TabletError::NotFound(format!(
                "tablet metadata for {} not found at {}",
                tablet_id,
                path.display()
            )));
        }
        let bytes = fs.read_file(&path)?;
        let superblock: TabletSuperBlock = serde_json::from_slice(&bytes).map_err(|e| {
            TabletError::Corruption(format!(
                "tablet metadata for {} is unreadable: {}",
                tablet_id, e
            ))
        })?;
        Ok(Arc::new(TabletMetadata {
            fs,
            state: RwLock::new(superblock),
            flush_pins: AtomicU32::new(0),
        }))
    }

    /// The tablet id.
    pub fn oid(&self) -> String {
        self.state.read().tablet_id.clone()
    }

    /// The owning table's name.
    pub fn table_name(&self) -> String {
        self.state.read().table_name.clone()
    }

    /// The filesystem this tablet lives on.
    pub fn fs_manager(&self) -> &Arc<FsManager> {
        &self.fs
    }

    /// Remote bootstrap progress recorded in the superblock.
    pub fn remote_bootstrap_state(&self) -> RemoteBootstrapState {
        self.state.read().remote_bootstrap_state
    }

    /// Highest memrowset id flushed into a rowset. 0 if none.
    pub fn last_durable_mrs_id(&self) -> u64 {
        self.state.read().last_durable_mrs_id
    }

    /// Metadata of one rowset, or `None` if it was compacted away.
    pub fn rowset_metadata(&self, rs_id: u64) -> Option<RowSetMetadata> {
        self.state
            .read()
            .rowsets
            .iter()
            .find(|rs| rs.rs_id == rs_id)
            .copied()
    }

    /// Number of live rowsets.
    pub fn num_rowsets(&self) -> usize {
        self.state.read().rowsets.len()
    }

    /// The current schema.
    pub fn schema(&self) -> Schema {
        self.state.read().schema.clone()
    }

    /// Replace the schema in memory. Persisted by the next flush.
    pub fn set_schema(&self, schema: Schema) {
        self.state.write().schema = schema;
    }

    /// Snapshot the full superblock.
    pub fn to_superblock(&self) -> TabletSuperBlock {
        self.state.read().clone()
    }

    /// Prevent flushes until a matching `unpin_flush`.
    pub fn pin_flush(&self) {
        self.flush_pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one flush pin.
    pub fn unpin_flush(&self) -> Result<()> {
        let previous = self.flush_pins.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            self.flush_pins.fetch_add(1, Ordering::AcqRel);
            return Err(TabletError::Internal(
                "unpin_flush without matching pin_flush".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether flushes are currently pinned.
    pub fn is_flush_pinned(&self) -> bool {
        self.flush_pins.load(Ordering::Acquire) > 0
    }

    /// Persist the superblock.
    pub fn flush(&self) -> Result<()> {
        if self.is_flush_pinned() {
            return Err(TabletError::IllegalState(
                "tablet metadata flush attempted while pinned".to_string(),
            ));
        }
        let state = self.state.read();
        let bytes = serde_json::to_vec_pretty(&*state)
            .map_err(|e| TabletError::Internal(format!("could not encode superblock: {}", e)))?;
        let path = self.fs.tablet_metadata_path(&state.tablet_id);
        self.fs.write_file_atomic(&path, &bytes)?;
        Ok(())
    }
}
