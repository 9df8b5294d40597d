//! Tablet WAL bootstrap.
//!
//! Rebuilds a tablet's in-memory state after a restart by replaying its
//! write-ahead log against the last persisted row data.
//!
//! Replay algorithm:
//! 1. Load consensus metadata; refuse to run over a half-copied remote
//!    bootstrap.
//! 2. Open the tablet from its superblock and stage the WAL into the
//!    recovery directory (see `recovery`).
//! 3. Stream entries from the recovery directory in segment order. Each
//!    REPLICATE is checked for sequence, re-appended to a fresh WAL, and
//!    parked in the pending map; each COMMIT raises the committed
//!    watermark and is matched against its pending REPLICATE.
//! 4. Matched pairs are dispatched by operation type. Committed writes run
//!    through the replay filter: row operations already captured by
//!    persisted rowsets are skipped, the rest are re-applied.
//! 5. Flush consensus metadata once, remove the recovery directory, and
//!    hand the caller the rebuilt tablet, the fresh WAL, and the replay
//!    watermarks plus any orphaned replicates.
//!
//! # Recovery Properties
//!
//! - **Idempotent**: bootstrapping the output of a bootstrap reaches the
//!   same state.
//! - **Resumable**: interrupting after the WAL directory rename leaves a
//!   recovery directory a later bootstrap picks up transparently.
//! - **Loud**: out-of-sequence ids, unmatched state, and unreadable
//!   segments all fail the bootstrap with `Corruption`; the recovery
//!   directory is retained for the retry.

mod recovery;
mod state;

use crate::anchor::OpIdAnchorRegistry;
use crate::consensus_meta::ConsensusMetadata;
use crate::error::{Result, TabletError};
use crate::listener::TabletStatusListener;
use crate::metadata::{RemoteBootstrapState, TabletMetadata};
use crate::tablet::{AlterSchemaTransactionState, Tablet, WriteTransactionState};
use plateau_core::clock::{Clock, Timestamp};
use plateau_core::row_ops::{RowOpKind, RowOperation};
use plateau_core::schema::Schema;
use plateau_core::{FsManager, MetricContext, OpId};
use plateau_durability::entry::{
    AlterSchemaRequest, ChangeConfigRequest, CommitMsg, LogEntry, MemStoreTarget, OpResult,
    OpType, OperationBody, ReplicateMsg, TxResult, WriteRequest,
};
use plateau_durability::reader::LogReader;
use plateau_durability::writer::Log;
use plateau_durability::LogOptions;
use state::ReplayState;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Configuration for one bootstrap run.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Keep the timestamped recovery directory on disk after bootstrap
    /// instead of deleting it. Useful when debugging replay problems.
    pub skip_remove_old_recovery_dir: bool,

    /// Options for the fresh WAL opened during bootstrap.
    pub log_options: LogOptions,
}

/// What replay observed, for the consensus layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapResult {
    /// Id of the last REPLICATE seen.
    pub last_id: OpId,
    /// Highest committed op id seen.
    pub last_committed_id: OpId,
    /// REPLICATE messages with no matching COMMIT/ABORT. Their outcome was
    /// in flight when the server went down; the consensus layer resolves
    /// them.
    pub orphaned_replicates: Vec<ReplicateMsg>,
}

impl BootstrapResult {
    fn empty() -> Self {
        BootstrapResult {
            last_id: OpId::MIN,
            last_committed_id: OpId::MIN,
            orphaned_replicates: Vec::new(),
        }
    }
}

/// Everything a successful bootstrap hands back.
pub struct BootstrappedTablet {
    /// The rebuilt tablet.
    pub tablet: Tablet,
    /// The fresh WAL, positioned after the replayed entries.
    pub log: Log,
    /// Anchor registry shared by the tablet and the log.
    pub anchor_registry: Arc<OpIdAnchorRegistry>,
    /// Replay watermarks and orphans.
    pub result: BootstrapResult,
}

impl std::fmt::Debug for BootstrappedTablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrappedTablet")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Bootstrap a tablet from its local durable state.
///
/// On success the returned log has sync re-enabled and the recovery
/// directory is gone. On failure nothing is published and the recovery
/// directory is retained, so a retry resumes from it.
pub fn bootstrap_tablet(
    meta: Arc<TabletMetadata>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricContext>,
    listener: &TabletStatusListener,
    options: BootstrapOptions,
) -> Result<BootstrappedTablet> {
    let engine = TabletBootstrap {
        meta,
        clock,
        metrics,
        options,
    };
    let mut bootstrapped = engine.bootstrap(listener)?;
    // The new log is opened with sync disabled to speed up replay appends.
    bootstrapped
        .log
        .re_enable_sync_if_required()
        .map_err(TabletError::from)?;
    Ok(bootstrapped)
}

struct TabletBootstrap {
    meta: Arc<TabletMetadata>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricContext>,
    options: BootstrapOptions,
}

impl TabletBootstrap {
    fn bootstrap(self, listener: &TabletStatusListener) -> Result<BootstrappedTablet> {
        let tablet_id = self.meta.oid();
        let fs = Arc::clone(self.meta.fs_manager());

        // Replay needs consensus metadata to compare committed quorum
        // seqnos against replayed config changes and to persist committed
        // but unflushed changes.
        let cmeta = ConsensusMetadata::load(Arc::clone(&fs), &tablet_id)
            .map_err(|e| e.prepend("Unable to load consensus metadata"))?;

        let remote_state = self.meta.remote_bootstrap_state();
        if remote_state != RemoteBootstrapState::Done {
            return Err(TabletError::Corruption(format!(
                "Unable to locally bootstrap tablet {}: tablet metadata bootstrap state is {:?}",
                tablet_id, remote_state
            )));
        }

        self.meta.pin_flush();
        listener.status_message("Bootstrap starting.");
        debug!(
            target: "plateau::bootstrap",
            tablet_id = %tablet_id,
            superblock = ?self.meta.to_superblock(),
            "tablet metadata at bootstrap start"
        );

        let anchor_registry = Arc::new(OpIdAnchorRegistry::new());
        let tablet = Tablet::new(
            Arc::clone(&self.meta),
            Arc::clone(&self.clock),
            Arc::clone(&anchor_registry),
        );
        tablet.open()?;
        let fetched_blocks = tablet.num_rowsets() != 0;

        let needs_recovery = recovery::prepare_recovery_dir(&fs, &tablet_id)?;

        if !fetched_blocks && !needs_recovery {
            info!(
                target: "plateau::bootstrap",
                tablet_id = %tablet_id,
                "no previous blocks or log segments found, creating new tablet"
            );
            let log = self
                .open_new_log(&fs, &tablet_id)
                .map_err(|e| e.prepend("Failed to open new log"))?;
            self.meta.unpin_flush()?;
            listener.status_message("No bootstrap required, opened a new log");
            return Ok(BootstrappedTablet {
                tablet,
                log,
                anchor_registry,
                result: BootstrapResult::empty(),
            });
        }

        // Rowsets cannot exist without the log that created them: segments
        // are not GC'd past unflushed state, so an empty WAL here means
        // lost files.
        if fetched_blocks && !needs_recovery {
            return Err(TabletError::IllegalState(format!(
                "Tablet {} had rowsets but no log segments could be found",
                tablet_id
            )));
        }

        let reader = LogReader::open_from_recovery_dir(&fs, &tablet_id)
            .map_err(|e| TabletError::from(e).prepend("Could not open log reader"))?;
        let log = self
            .open_new_log(&fs, &tablet_id)
            .map_err(|e| e.prepend("Failed to open new log"))?;

        let mut driver = ReplayDriver {
            tablet,
            log,
            cmeta,
            reader,
            clock: Arc::clone(&self.clock),
            listener,
        };
        let result = driver
            .play_segments()
            .map_err(|e| e.prepend("Failed log replay"))?;

        // Flush the consensus metadata once at the end to persist any
        // replayed config changes.
        driver.cmeta.flush()?;
        self.meta.unpin_flush()?;
        recovery::remove_recovery_dir(&fs, &tablet_id, &self.options)?;
        listener.status_message("Bootstrap complete.");

        Ok(BootstrappedTablet {
            tablet: driver.tablet,
            log: driver.log,
            anchor_registry,
            result,
        })
    }

    fn open_new_log(&self, fs: &FsManager, tablet_id: &str) -> Result<Log> {
        let mut log = Log::open(
            self.options.log_options.clone(),
            fs,
            tablet_id,
            Arc::clone(&self.metrics),
        )?;
        // Sync is re-enabled by `bootstrap_tablet` once replay finishes;
        // until then the recovery directory still holds the originals.
        log.disable_sync();
        Ok(log)
    }
}

struct ReplayDriver<'a> {
    tablet: Tablet,
    log: Log,
    cmeta: ConsensusMetadata,
    reader: LogReader,
    clock: Arc<dyn Clock>,
    listener: &'a TabletStatusListener,
}

impl ReplayDriver<'_> {
    fn play_segments(&mut self) -> Result<BootstrapResult> {
        let mut state = ReplayState::new();
        let tablet_id = self.tablet.tablet_id();
        let num_segments = self.reader.num_segments();
        let segments = self.reader.segments_snapshot().to_vec();

        for (segment_count, segment) in segments.iter().enumerate() {
            let (entries, read_status) = segment.read_entries();
            let entries_read = entries.len();

            for (entry_idx, entry) in entries.into_iter().enumerate() {
                let entry_desc = entry.short_debug();
                self.handle_entry(&mut state, entry).map_err(|e| {
                    e.prepend(format!(
                        "Error playing entry {} of segment {} of tablet {}. Segment path: {}. Entry: {}",
                        entry_idx,
                        segment.header().sequence_number(),
                        tablet_id,
                        segment.path().display(),
                        entry_desc
                    ))
                })?;
            }

            // The reader hands back every entry it could decode before a
            // failure; replay them all, then surface the failure.
            if let Err(read_err) = read_status {
                return Err(TabletError::Corruption(format!(
                    "Error reading log segment of tablet {}: {} (read up to entry {} of segment {}, in path {})",
                    tablet_id,
                    read_err,
                    entries_read,
                    segment.header().sequence_number(),
                    segment.path().display()
                )));
            }

            self.listener.status_message(format!(
                "Bootstrap replayed {}/{} log segments.",
                segment_count + 1,
                num_segments
            ));
        }

        let mut orphaned = Vec::new();
        for (_, entry) in std::mem::take(&mut state.pending_replicates) {
            if let LogEntry::Replicate(msg) = entry {
                orphaned.push(msg);
            }
        }
        if !orphaned.is_empty() {
            self.dump_orphaned_replicates(&orphaned);
        }

        Ok(BootstrapResult {
            last_id: state.prev_op_id,
            last_committed_id: state.committed_op_id,
            orphaned_replicates: orphaned,
        })
    }

    fn handle_entry(&mut self, state: &mut ReplayState, entry: LogEntry) -> Result<()> {
        match entry {
            LogEntry::Replicate(msg) => self.handle_replicate(state, msg),
            LogEntry::Commit(msg) => self.handle_commit(state, msg),
        }
    }

    /// Accept a REPLICATE: sequence-check it, append it verbatim to the
    /// new WAL so recovery is itself durable, and park it until its
    /// COMMIT/ABORT arrives.
    fn handle_replicate(&mut self, state: &mut ReplayState, msg: ReplicateMsg) -> Result<()> {
        state.check_sequential_replicate_id(&msg)?;

        let id = msg.id;
        let entry = LogEntry::Replicate(msg);
        self.log.append(&entry)?;

        if let Some(existing) = state.pending_replicates.insert(id, entry) {
            return Err(TabletError::Corruption(format!(
                "Found previous entry with the same id: {}",
                existing.short_debug()
            )));
        }
        Ok(())
    }

    /// Consume a COMMIT: raise the committed watermark, then either pair
    /// it with its pending REPLICATE or validate it as an orphan.
    fn handle_commit(&mut self, state: &mut ReplayState, commit: CommitMsg) -> Result<()> {
        state.update_committed_op_id(commit.committed_op_id);

        match state.pending_replicates.remove(&commit.committed_op_id) {
            Some(replicate_entry) => self.handle_entry_pair(replicate_entry, &commit)?,
            None => {
                // The replicate was in a GC'd segment. That is legitimate
                // only if everything this commit claims to have written
                // was already persisted.
                for op_result in &commit.result.ops {
                    for store in &op_result.mutated_stores {
                        if !self.was_store_already_flushed(store) {
                            warn!(
                                target: "plateau::bootstrap",
                                tablet_id = %self.tablet.tablet_id(),
                                op_id = %commit.committed_op_id,
                                pending = state.pending_replicates.len(),
                                "orphan commit references an unflushed store"
                            );
                            return Err(TabletError::Corruption(format!(
                                "Orphan commit for op {} has a mutated store {:?} that was NOT already flushed",
                                commit.committed_op_id, store
                            )));
                        }
                    }
                }
                debug!(
                    target: "plateau::bootstrap",
                    op_id = %commit.committed_op_id,
                    "ignoring orphan commit whose stores were all flushed"
                );
            }
        }
        Ok(())
    }

    /// Dispatch a matched (REPLICATE, COMMIT) pair by operation type.
    fn handle_entry_pair(&mut self, replicate_entry: LogEntry, commit: &CommitMsg) -> Result<()> {
        let replicate = match replicate_entry {
            LogEntry::Replicate(msg) => msg,
            LogEntry::Commit(_) => {
                return Err(TabletError::Internal(
                    "pending replicate map held a commit entry".to_string(),
                ))
            }
        };

        match (commit.op_type, &replicate.body) {
            (OpType::Abort, _) => {
                debug!(
                    target: "plateau::bootstrap",
                    op_id = %commit.committed_op_id,
                    "skipping replicate that was originally aborted"
                );
                // Aborts carry no valid timestamp, so no clock update.
                return Ok(());
            }
            (OpType::Write, OperationBody::Write(write)) => self
                .play_write_request(&replicate, write, commit)
                .map_err(|e| {
                    e.prepend(format!("Failed to play write request for op {}", replicate.id))
                })?,
            (OpType::AlterSchema, OperationBody::AlterSchema(alter)) => self
                .play_alter_schema_request(alter, commit)
                .map_err(|e| {
                    e.prepend(format!(
                        "Failed to play alter schema request for op {}",
                        replicate.id
                    ))
                })?,
            (OpType::ChangeConfig, OperationBody::ChangeConfig(change)) => self
                .play_change_config_request(change, commit)
                .map_err(|e| {
                    e.prepend(format!(
                        "Failed to play change config request for op {}",
                        replicate.id
                    ))
                })?,
            (op_type, body) => {
                return Err(TabletError::Corruption(format!(
                    "Commit type {:?} does not match replicate body {} for op {}",
                    op_type,
                    body.kind_name(),
                    replicate.id
                )))
            }
        }

        self.update_clock(commit.timestamp)
    }

    /// Replay a committed write: re-apply its unflushed row operations and
    /// append a commit with the freshly recomputed result set to the new
    /// WAL (the stores chosen now may differ from the original ones).
    fn play_write_request(
        &mut self,
        replicate: &ReplicateMsg,
        write: &WriteRequest,
        commit: &CommitMsg,
    ) -> Result<()> {
        let mut tx = WriteTransactionState::new(replicate.id);
        self.tablet.start_transaction(&mut tx);

        if !write.row_operations.is_empty() {
            self.play_row_operations(&mut tx, &write.schema, &write.row_operations, &commit.result)?;
        }

        let new_commit = LogEntry::Commit(CommitMsg {
            committed_op_id: commit.committed_op_id,
            op_type: commit.op_type,
            timestamp: commit.timestamp,
            result: tx.take_result(),
        });
        self.log.append(&new_commit)?;
        Ok(())
    }

    /// Replay a committed schema change and append the unchanged commit.
    fn play_alter_schema_request(
        &mut self,
        alter: &AlterSchemaRequest,
        commit: &CommitMsg,
    ) -> Result<()> {
        let mut tx = AlterSchemaTransactionState::new(alter.schema.clone());
        self.tablet.create_prepared_alter_schema(&mut tx)?;
        self.tablet
            .alter_schema(&tx)
            .map_err(|e| e.prepend("Failed to alter schema"))?;

        self.log.append(&LogEntry::Commit(commit.clone()))?;
        Ok(())
    }

    /// Replay a committed config change and append the unchanged commit.
    ///
    /// The change is applied in memory only when its seqno beats the
    /// committed quorum's; consensus metadata is flushed once at the end
    /// of bootstrap.
    fn play_change_config_request(
        &mut self,
        change: &ChangeConfigRequest,
        commit: &CommitMsg,
    ) -> Result<()> {
        let quorum = &change.new_config;
        let committed_seqno = self.cmeta.committed_quorum().seqno;
        if quorum.seqno > committed_seqno {
            debug!(
                target: "plateau::bootstrap",
                replayed_seqno = quorum.seqno,
                committed_seqno,
                "applying replayed quorum configuration change"
            );
            self.cmeta.set_committed_quorum(quorum.clone());
        } else {
            debug!(
                target: "plateau::bootstrap",
                replayed_seqno = quorum.seqno,
                committed_seqno,
                "skipping stale quorum configuration change"
            );
        }

        self.log.append(&LogEntry::Commit(commit.clone()))?;
        Ok(())
    }

    /// Decode and lock the write's row operations, then run the filter.
    fn play_row_operations(
        &mut self,
        tx: &mut WriteTransactionState,
        schema: &Schema,
        row_operations: &[RowOperation],
        orig_result: &TxResult,
    ) -> Result<()> {
        self.tablet
            .decode_write_operations(schema, tx, row_operations)
            .map_err(|e| e.prepend("Could not decode row operations"))?;

        if tx.row_ops().len() != orig_result.ops.len() {
            return Err(TabletError::Corruption(format!(
                "Write op {} has {} row operations but its commit result has {} outcomes",
                tx.op_id(),
                tx.row_ops().len(),
                orig_result.ops.len()
            )));
        }

        self.tablet
            .acquire_row_locks(tx)
            .map_err(|e| e.prepend("Failed to acquire row locks"))?;

        self.filter_and_apply_operations(tx, orig_result)
    }

    /// Pass over the decoded operations. Each one is marked failed if it
    /// originally failed, marked already-present if its stores were
    /// flushed, and re-applied otherwise.
    fn filter_and_apply_operations(
        &self,
        tx: &mut WriteTransactionState,
        orig_result: &TxResult,
    ) -> Result<()> {
        for idx in 0..tx.row_ops().len() {
            let op_result = &orig_result.ops[idx];

            if op_result.is_failed() {
                debug!(
                    target: "plateau::bootstrap",
                    op_id = %tx.op_id(),
                    op_index = idx,
                    original_error = op_result.failed_status.as_deref().unwrap_or(""),
                    "skipping row operation that originally resulted in an error"
                );
                tx.row_ops_mut()[idx].set_failed("Row operation failed previously.");
                continue;
            }

            match tx.row_ops()[idx].op.kind {
                RowOpKind::Insert => self.filter_insert(tx, idx, op_result)?,
                RowOpKind::Update | RowOpKind::Delete => self.filter_mutate(tx, idx, op_result)?,
            }
            if tx.row_ops()[idx].result.is_some() {
                continue;
            }

            self.tablet.apply_row_operation(tx, idx)?;

            // The operation durably committed before the restart, so
            // re-applying it must succeed; a failure means the tablet has
            // diverged from the log.
            match &tx.row_ops()[idx].result {
                Some(result) if result.is_failed() => {
                    return Err(TabletError::Corruption(format!(
                        "Operation which previously succeeded failed during log replay. Op {} index {}: {}",
                        tx.op_id(),
                        idx,
                        result.failed_status.clone().unwrap_or_default()
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(TabletError::Internal(format!(
                        "apply recorded no result for op {} index {}",
                        tx.op_id(),
                        idx
                    )));
                }
            }
        }
        Ok(())
    }

    /// Skip an insert whose memrowset was already flushed.
    fn filter_insert(
        &self,
        tx: &mut WriteTransactionState,
        idx: usize,
        op_result: &OpResult,
    ) -> Result<()> {
        let target = match op_result.mutated_stores.as_slice() {
            [target @ MemStoreTarget::MemRowSet { .. }] => *target,
            _ => {
                return Err(TabletError::Corruption(format!(
                    "Insert operation result must have a single memrowset target: {:?}",
                    op_result
                )))
            }
        };

        if self.was_store_already_flushed(&target) {
            debug!(
                target: "plateau::bootstrap",
                op_id = %tx.op_id(),
                op_index = idx,
                flushed_to = ?target,
                last_durable_mrs_id = self.tablet.metadata().last_durable_mrs_id(),
                "skipping insert that was already flushed"
            );
            tx.row_ops_mut()[idx].set_failed("Row to insert was already flushed.");
        }
        Ok(())
    }

    /// Skip a mutation all of whose target stores were already flushed.
    ///
    /// A mutation lands in one store, or in two when it raced a flush or
    /// compaction that duplicated the row between stores.
    fn filter_mutate(
        &self,
        tx: &mut WriteTransactionState,
        idx: usize,
        op_result: &OpResult,
    ) -> Result<()> {
        let stores = &op_result.mutated_stores;
        if stores.is_empty() || stores.len() > 2 {
            return Err(TabletError::Corruption(format!(
                "Mutations must have one or two mutated stores: {:?}",
                op_result
            )));
        }

        let num_unflushed = stores
            .iter()
            .filter(|store| !self.was_store_already_flushed(store))
            .count();

        if num_unflushed == 0 {
            debug!(
                target: "plateau::bootstrap",
                op_id = %tx.op_id(),
                op_index = idx,
                "skipping mutation that was already flushed"
            );
            tx.row_ops_mut()[idx].set_failed("Update was already flushed.");
            return Ok(());
        }

        if num_unflushed == 2 {
            // A crash between a flush and its metadata write can leave the
            // mutation unflushed in both duplicated targets. Applying it
            // is correct; leave a loud trace that this path was taken.
            error!(
                target: "plateau::bootstrap",
                op_id = %tx.op_id(),
                op_index = idx,
                stores = ?stores,
                "mutation is unflushed in both duplicated targets, applying it"
            );
        }
        Ok(())
    }

    /// The flushed predicate: whether the contents of `store` already made
    /// it into persistent rowset state.
    fn was_store_already_flushed(&self, store: &MemStoreTarget) -> bool {
        match *store {
            MemStoreTarget::MemRowSet { mrs_id } => {
                // Flushed iff a memrowset with at least this id was flushed.
                mrs_id <= self.tablet.metadata().last_durable_mrs_id()
            }
            MemStoreTarget::DeltaMemStore { rs_id, dms_id } => {
                match self.tablet.metadata().rowset_metadata(rs_id) {
                    // The rowset was compacted away, taking the deltas with it.
                    None => true,
                    Some(rowset) => dms_id <= rowset.last_durable_redo_dms_id,
                }
            }
        }
    }

    fn update_clock(&self, timestamp: Timestamp) -> Result<()> {
        self.clock.update(timestamp).map_err(TabletError::from)
    }

    fn dump_orphaned_replicates(&self, orphaned: &[ReplicateMsg]) {
        info!(
            target: "plateau::bootstrap",
            tablet_id = %self.tablet.tablet_id(),
            count = orphaned.len(),
            "WAL included REPLICATE entries with no matching commit or abort; \
             these were probably in flight when the server went down"
        );
        for msg in orphaned {
            info!(
                target: "plateau::bootstrap",
                op_id = %msg.id,
                kind = msg.body.kind_name(),
                "orphaned replicate"
            );
        }
    }
}
