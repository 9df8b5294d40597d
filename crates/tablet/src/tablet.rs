//! The tablet engine.
//!
//! This is the storage collaborator the bootstrap engine drives: it holds
//! the live in-memory write state of one tablet. Flushed row data is owned
//! by the rowset layer and is not materialized here; what bootstrap needs
//! is the write path (decode, lock, apply) and the store ids that applied
//! operations land in.
//!
//! Store routing during replay:
//! - inserts always land in the active memrowset
//! - a mutation whose key is present in the memrowset mutates it there
//! - a mutation that misses the memrowset is recorded as a redo delta
//!   against the newest rowset

use crate::anchor::OpIdAnchorRegistry;
use crate::error::{Result, TabletError};
use crate::metadata::TabletMetadata;
use parking_lot::{Mutex, RwLock};
use plateau_core::clock::{Clock, Timestamp};
use plateau_core::row_ops::{RowOpKind, RowOperation};
use plateau_core::schema::Schema;
use plateau_core::OpId;
use plateau_durability::entry::{MemStoreTarget, OpResult, TxResult};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One row operation inside a transaction, plus its outcome once decided.
#[derive(Debug)]
pub struct RowOp {
    /// The decoded operation.
    pub op: RowOperation,
    /// Outcome, set either by the replay filter or by application.
    pub result: Option<OpResult>,
}

impl RowOp {
    fn new(op: RowOperation) -> Self {
        RowOp { op, result: None }
    }

    /// Mark the operation failed without applying it.
    pub fn set_failed(&mut self, status: impl Into<String>) {
        self.result = Some(OpResult::failed(status));
    }
}

/// State of one write transaction.
pub struct WriteTransactionState {
    op_id: OpId,
    timestamp: Option<Timestamp>,
    row_ops: Vec<RowOp>,
    locks: Option<TxRowLocks>,
}

impl WriteTransactionState {
    /// A transaction tagged with the given operation id.
    pub fn new(op_id: OpId) -> Self {
        WriteTransactionState {
            op_id,
            timestamp: None,
            row_ops: Vec::new(),
            locks: None,
        }
    }

    /// The operation id this transaction replays.
    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    /// The transaction timestamp, once started.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// The decoded row operations.
    pub fn row_ops(&self) -> &[RowOp] {
        &self.row_ops
    }

    /// Mutable access to the decoded row operations.
    pub fn row_ops_mut(&mut self) -> &mut [RowOp] {
        &mut self.row_ops
    }

    /// Collect the per-op outcomes into a result set.
    pub fn take_result(&mut self) -> TxResult {
        let ops = self
            .row_ops
            .iter_mut()
            .map(|row_op| {
                row_op
                    .result
                    .take()
                    .unwrap_or_else(|| OpResult::failed("row operation was never applied"))
            })
            .collect();
        TxResult { ops }
    }
}

/// State of one schema-change transaction.
pub struct AlterSchemaTransactionState {
    schema: Schema,
    prepared: bool,
}

impl AlterSchemaTransactionState {
    /// A transaction carrying the requested schema.
    pub fn new(schema: Schema) -> Self {
        AlterSchemaTransactionState {
            schema,
            prepared: false,
        }
    }

    /// The requested schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[derive(Debug, Default)]
struct LockManager {
    held: Mutex<HashSet<String>>,
}

/// Row locks held by one transaction. Released on drop.
pub struct TxRowLocks {
    manager: Arc<LockManager>,
    keys: Vec<String>,
}

impl Drop for TxRowLocks {
    fn drop(&mut self) {
        let mut held = self.manager.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
    }
}

#[derive(Debug, Default)]
struct MemRowSet {
    mrs_id: u64,
    rows: BTreeMap<String, String>,
}

#[derive(Debug)]
struct DeltaMemStore {
    dms_id: u64,
    // Key to new value; `None` records a delete.
    changes: BTreeMap<String, Option<String>>,
}

/// The live in-memory state of one tablet.
pub struct Tablet {
    meta: Arc<TabletMetadata>,
    clock: Arc<dyn Clock>,
    anchor_registry: Arc<OpIdAnchorRegistry>,
    schema: RwLock<Schema>,
    mem: RwLock<MemRowSet>,
    deltas: RwLock<BTreeMap<u64, DeltaMemStore>>,
    lock_manager: Arc<LockManager>,
    opened: AtomicBool,
}

impl Tablet {
    /// Create a tablet over its metadata. Call `open` before using it.
    pub fn new(
        meta: Arc<TabletMetadata>,
        clock: Arc<dyn Clock>,
        anchor_registry: Arc<OpIdAnchorRegistry>,
    ) -> Self {
        Tablet {
            meta,
            clock,
            anchor_registry,
            schema: RwLock::new(Schema::simple()),
            mem: RwLock::new(MemRowSet::default()),
            deltas: RwLock::new(BTreeMap::new()),
            lock_manager: Arc::new(LockManager::default()),
            opened: AtomicBool::new(false),
        }
    }

    /// Open the tablet: load the schema and start a fresh memrowset right
    /// after the last durable one.
    pub fn open(&self) -> Result<()> {
        let superblock = self.meta.to_superblock();
        *self.schema.write() = superblock.schema.clone();
        self.mem.write().mrs_id = superblock.last_durable_mrs_id + 1;
        self.opened.store(true, Ordering::Release);
        debug!(
            target: "plateau::tablet",
            tablet_id = %superblock.tablet_id,
            rowsets = superblock.rowsets.len(),
            mrs_id = superblock.last_durable_mrs_id + 1,
            "opened tablet"
        );
        Ok(())
    }

    /// Whether `open` has been called.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// The tablet id.
    pub fn tablet_id(&self) -> String {
        self.meta.oid()
    }

    /// This tablet's metadata handle.
    pub fn metadata(&self) -> &Arc<TabletMetadata> {
        &self.meta
    }

    /// This tablet's anchor registry.
    pub fn anchor_registry(&self) -> &Arc<OpIdAnchorRegistry> {
        &self.anchor_registry
    }

    /// Number of on-disk rowsets.
    pub fn num_rowsets(&self) -> usize {
        self.meta.num_rowsets()
    }

    /// The current schema.
    pub fn schema(&self) -> Schema {
        self.schema.read().clone()
    }

    /// Begin a write transaction: assign it a fresh timestamp.
    pub fn start_transaction(&self, tx: &mut WriteTransactionState) {
        tx.timestamp = Some(self.clock.now());
    }

    /// Decode a write request's row operations into the transaction,
    /// validating them against the client schema.
    pub fn decode_write_operations(
        &self,
        client_schema: &Schema,
        tx: &mut WriteTransactionState,
        row_operations: &[RowOperation],
    ) -> Result<()> {
        if !client_schema.has_key_column() {
            return Err(TabletError::Corruption(
                "write request schema has no key column".to_string(),
            ));
        }
        let mut row_ops = Vec::with_capacity(row_operations.len());
        for op in row_operations {
            match op.kind {
                RowOpKind::Insert | RowOpKind::Update => {
                    if op.value.is_none() {
                        return Err(TabletError::Corruption(format!(
                            "{} for key {:?} carries no value",
                            op.kind, op.key
                        )));
                    }
                }
                RowOpKind::Delete => {
                    if op.value.is_some() {
                        return Err(TabletError::Corruption(format!(
                            "DELETE for key {:?} carries a value",
                            op.key
                        )));
                    }
                }
            }
            row_ops.push(RowOp::new(op.clone()));
        }
        tx.row_ops = row_ops;
        Ok(())
    }

    /// Take row locks for every operation in the transaction. The locks
    /// are held by the transaction and released when it is dropped.
    pub fn acquire_row_locks(&self, tx: &mut WriteTransactionState) -> Result<()> {
        let keys: Vec<String> = tx.row_ops.iter().map(|r| r.op.key.clone()).collect();
        {
            let mut held = self.lock_manager.held.lock();
            for key in &keys {
                if !held.insert(key.clone()) {
                    return Err(TabletError::Internal(format!(
                        "row lock for key {:?} is already held",
                        key
                    )));
                }
            }
        }
        tx.locks = Some(TxRowLocks {
            manager: Arc::clone(&self.lock_manager),
            keys,
        });
        Ok(())
    }

    /// Apply the `idx`-th row operation of the transaction, recording its
    /// outcome (including the mutated store) in the transaction state.
    pub fn apply_row_operation(&self, tx: &mut WriteTransactionState, idx: usize) -> Result<()> {
        let op = match tx.row_ops.get(idx) {
            Some(row_op) => row_op.op.clone(),
            None => {
                return Err(TabletError::Internal(format!(
                    "row operation index {} out of bounds ({} ops)",
                    idx,
                    tx.row_ops.len()
                )))
            }
        };

        let result = match op.kind {
            RowOpKind::Insert => self.apply_insert(&op),
            RowOpKind::Update | RowOpKind::Delete => self.apply_mutation(&op),
        };
        tx.row_ops[idx].result = Some(result);
        Ok(())
    }

    fn apply_insert(&self, op: &RowOperation) -> OpResult {
        let mut mem = self.mem.write();
        if mem.rows.contains_key(&op.key) {
            return OpResult::failed(format!("key {:?} already present in memrowset", op.key));
        }
        let value = op.value.clone().unwrap_or_default();
        mem.rows.insert(op.key.clone(), value);
        OpResult::success(vec![MemStoreTarget::MemRowSet { mrs_id: mem.mrs_id }])
    }

    fn apply_mutation(&self, op: &RowOperation) -> OpResult {
        {
            let mut mem = self.mem.write();
            if mem.rows.contains_key(&op.key) {
                let mrs_id = mem.mrs_id;
                match op.kind {
                    RowOpKind::Update => {
                        let value = op.value.clone().unwrap_or_default();
                        mem.rows.insert(op.key.clone(), value);
                    }
                    RowOpKind::Delete => {
                        mem.rows.remove(&op.key);
                    }
                    RowOpKind::Insert => {}
                }
                return OpResult::success(vec![MemStoreTarget::MemRowSet { mrs_id }]);
            }
        }

        // The key is not in the memrowset, so the row (if it exists) lives
        // in a flushed rowset. Record a redo delta against the newest one.
        let target_rowset = self
            .meta
            .to_superblock()
            .rowsets
            .iter()
            .max_by_key(|rs| rs.rs_id)
            .copied();
        let rowset = match target_rowset {
            Some(rs) => rs,
            None => {
                return OpResult::failed(format!(
                    "key {:?} not found in an empty tablet",
                    op.key
                ))
            }
        };

        let mut deltas = self.deltas.write();
        let dms = deltas.entry(rowset.rs_id).or_insert_with(|| DeltaMemStore {
            dms_id: rowset.last_durable_redo_dms_id + 1,
            changes: BTreeMap::new(),
        });
        let change = match op.kind {
            RowOpKind::Update => Some(op.value.clone().unwrap_or_default()),
            _ => None,
        };
        dms.changes.insert(op.key.clone(), change);
        OpResult::success(vec![MemStoreTarget::DeltaMemStore {
            rs_id: rowset.rs_id,
            dms_id: dms.dms_id,
        }])
    }

    /// Validate a schema change before applying it.
    pub fn create_prepared_alter_schema(
        &self,
        tx: &mut AlterSchemaTransactionState,
    ) -> Result<()> {
        if !tx.schema.has_key_column() {
            return Err(TabletError::Corruption(
                "altered schema has no key column".to_string(),
            ));
        }
        tx.prepared = true;
        Ok(())
    }

    /// Apply a prepared schema change.
    ///
    /// A schema whose version is behind the current one is skipped, which
    /// makes re-replaying an already-applied change a no-op.
    pub fn alter_schema(&self, tx: &AlterSchemaTransactionState) -> Result<()> {
        if !tx.prepared {
            return Err(TabletError::Internal(
                "alter_schema called without create_prepared_alter_schema".to_string(),
            ));
        }
        let mut schema = self.schema.write();
        if tx.schema.version < schema.version {
            debug!(
                target: "plateau::tablet",
                current = schema.version,
                requested = tx.schema.version,
                "skipping stale schema change"
            );
            return Ok(());
        }
        *schema = tx.schema.clone();
        self.meta.set_schema(tx.schema.clone());
        Ok(())
    }

    /// The memrowset's value for `key`, if present. Test observability.
    pub fn mem_row(&self, key: &str) -> Option<String> {
        self.mem.read().rows.get(key).cloned()
    }

    /// Number of rows in the live memrowset. Test observability.
    pub fn num_mem_rows(&self) -> usize {
        self.mem.read().rows.len()
    }

    /// The redo delta recorded for `key` against rowset `rs_id`, if any.
    /// `Some(None)` is a recorded delete. Test observability.
    pub fn redo_delta(&self, rs_id: u64, key: &str) -> Option<Option<String>> {
        self.deltas
            .read()
            .get(&rs_id)
            .and_then(|dms| dms.changes.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{RowSetMetadata, TabletSuperBlock};
    use plateau_core::clock::LogicalClock;
    use plateau_core::FsManager;
    use tempfile::tempdir;

    fn test_tablet(superblock: TabletSuperBlock) -> (tempfile::TempDir, Tablet) {
        let dir = tempdir().unwrap();
        let fs = Arc::new(FsManager::open(dir.path()).unwrap());
        let meta = TabletMetadata::create(fs, superblock).unwrap();
        let tablet = Tablet::new(
            meta,
            Arc::new(LogicalClock::new(0)),
            Arc::new(OpIdAnchorRegistry::new()),
        );
        tablet.open().unwrap();
        (dir, tablet)
    }

    fn decoded_tx(tablet: &Tablet, ops: &[RowOperation]) -> WriteTransactionState {
        let mut tx = WriteTransactionState::new(OpId::new(1, 1));
        tablet.start_transaction(&mut tx);
        tablet
            .decode_write_operations(&tablet.schema(), &mut tx, ops)
            .unwrap();
        tablet.acquire_row_locks(&mut tx).unwrap();
        tx
    }

    #[test]
    fn test_insert_lands_in_live_memrowset() {
        let mut superblock = TabletSuperBlock::new_empty("t1", "orders");
        superblock.last_durable_mrs_id = 5;
        let (_dir, tablet) = test_tablet(superblock);

        let mut tx = decoded_tx(&tablet, &[RowOperation::insert("a", "1")]);
        tablet.apply_row_operation(&mut tx, 0).unwrap();

        let result = tx.row_ops()[0].result.clone().unwrap();
        assert!(!result.is_failed());
        assert_eq!(
            result.mutated_stores,
            vec![MemStoreTarget::MemRowSet { mrs_id: 6 }]
        );
        assert_eq!(tablet.mem_row("a"), Some("1".to_string()));
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let (_dir, tablet) = test_tablet(TabletSuperBlock::new_empty("t1", "orders"));

        let mut tx = decoded_tx(&tablet, &[RowOperation::insert("a", "1")]);
        tablet.apply_row_operation(&mut tx, 0).unwrap();
        drop(tx);

        let mut tx = decoded_tx(&tablet, &[RowOperation::insert("a", "2")]);
        tablet.apply_row_operation(&mut tx, 0).unwrap();
        let result = tx.row_ops()[0].result.clone().unwrap();
        assert!(result.is_failed());
        assert_eq!(tablet.mem_row("a"), Some("1".to_string()));
    }

    #[test]
    fn test_update_of_memrowset_row_stays_in_memrowset() {
        let (_dir, tablet) = test_tablet(TabletSuperBlock::new_empty("t1", "orders"));

        let mut tx = decoded_tx(&tablet, &[RowOperation::insert("a", "1")]);
        tablet.apply_row_operation(&mut tx, 0).unwrap();
        drop(tx);

        let mut tx = decoded_tx(&tablet, &[RowOperation::update("a", "2")]);
        tablet.apply_row_operation(&mut tx, 0).unwrap();
        let result = tx.row_ops()[0].result.clone().unwrap();
        assert_eq!(
            result.mutated_stores,
            vec![MemStoreTarget::MemRowSet { mrs_id: 1 }]
        );
        assert_eq!(tablet.mem_row("a"), Some("2".to_string()));
    }

    #[test]
    fn test_update_missing_from_memrowset_becomes_redo_delta() {
        let mut superblock = TabletSuperBlock::new_empty("t1", "orders");
        superblock.last_durable_mrs_id = 2;
        superblock.rowsets.push(RowSetMetadata {
            rs_id: 1,
            last_durable_redo_dms_id: 4,
        });
        let (_dir, tablet) = test_tablet(superblock);

        let mut tx = decoded_tx(&tablet, &[RowOperation::update("cold", "9")]);
        tablet.apply_row_operation(&mut tx, 0).unwrap();

        let result = tx.row_ops()[0].result.clone().unwrap();
        assert_eq!(
            result.mutated_stores,
            vec![MemStoreTarget::DeltaMemStore { rs_id: 1, dms_id: 5 }]
        );
        assert_eq!(tablet.redo_delta(1, "cold"), Some(Some("9".to_string())));
    }

    #[test]
    fn test_delete_missing_from_empty_tablet_fails() {
        let (_dir, tablet) = test_tablet(TabletSuperBlock::new_empty("t1", "orders"));

        let mut tx = decoded_tx(&tablet, &[RowOperation::delete("ghost")]);
        tablet.apply_row_operation(&mut tx, 0).unwrap();
        assert!(tx.row_ops()[0].result.clone().unwrap().is_failed());
    }

    #[test]
    fn test_decode_rejects_valueless_insert() {
        let (_dir, tablet) = test_tablet(TabletSuperBlock::new_empty("t1", "orders"));

        let bad = RowOperation {
            kind: RowOpKind::Insert,
            key: "a".to_string(),
            value: None,
        };
        let mut tx = WriteTransactionState::new(OpId::new(1, 1));
        let err = tablet
            .decode_write_operations(&tablet.schema(), &mut tx, &[bad])
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_row_locks_released_on_tx_drop() {
        let (_dir, tablet) = test_tablet(TabletSuperBlock::new_empty("t1", "orders"));

        let tx = decoded_tx(&tablet, &[RowOperation::insert("a", "1")]);
        drop(tx);

        // Same key can be locked again once the first transaction is gone.
        let _tx = decoded_tx(&tablet, &[RowOperation::insert("a", "1")]);
    }

    #[test]
    fn test_alter_schema_applies_and_skips_stale() {
        let (_dir, tablet) = test_tablet(TabletSuperBlock::new_empty("t1", "orders"));

        let mut new_schema = Schema::simple();
        new_schema.version = 3;
        let mut tx = AlterSchemaTransactionState::new(new_schema.clone());
        tablet.create_prepared_alter_schema(&mut tx).unwrap();
        tablet.alter_schema(&tx).unwrap();
        assert_eq!(tablet.schema().version, 3);

        let mut stale = Schema::simple();
        stale.version = 1;
        let mut tx = AlterSchemaTransactionState::new(stale);
        tablet.create_prepared_alter_schema(&mut tx).unwrap();
        tablet.alter_schema(&tx).unwrap();
        assert_eq!(tablet.schema().version, 3);
    }

    #[test]
    fn test_take_result_preserves_order_and_failures() {
        let (_dir, tablet) = test_tablet(TabletSuperBlock::new_empty("t1", "orders"));

        let mut tx = decoded_tx(
            &tablet,
            &[RowOperation::insert("a", "1"), RowOperation::insert("b", "2")],
        );
        tx.row_ops_mut()[0].set_failed("filtered");
        tablet.apply_row_operation(&mut tx, 1).unwrap();

        let result = tx.take_result();
        assert_eq!(result.ops.len(), 2);
        assert!(result.ops[0].is_failed());
        assert!(!result.ops[1].is_failed());
    }
}
