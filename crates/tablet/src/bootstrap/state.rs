//! In-memory state kept while replaying a tablet's WAL.

use crate::error::{Result, TabletError};
use plateau_core::OpId;
use plateau_durability::entry::{LogEntry, ReplicateMsg};
use std::collections::BTreeMap;

/// State of one replay pass. Lifetime is a single bootstrap.
///
/// The pending map owns every REPLICATE entry whose COMMIT or ABORT has not
/// been consumed yet. Handling a matching commit moves the entry out;
/// whatever is left at the end of replay is drained by move into the
/// bootstrap result as orphaned replicates.
pub(crate) struct ReplayState {
    /// Id of the last REPLICATE accepted.
    pub prev_op_id: OpId,
    /// Highest committed op id seen so far. Every operation with a lower
    /// id is also committed.
    pub committed_op_id: OpId,
    /// REPLICATE entries whose COMMIT/ABORT has not yet been seen,
    /// keyed by op id.
    pub pending_replicates: BTreeMap<OpId, LogEntry>,
}

impl ReplayState {
    pub fn new() -> Self {
        ReplayState {
            prev_op_id: OpId::MIN,
            committed_op_id: OpId::MIN,
            pending_replicates: BTreeMap::new(),
        }
    }

    /// Whether `b` is allowed to immediately follow `a` in the log.
    fn valid_sequence(a: OpId, b: OpId) -> bool {
        if a.is_min() {
            // Not initialized, can start with any id.
            return true;
        }
        // Within the same term, each entry's index is exactly one higher
        // than the previous.
        if b.term == a.term && b.index != a.index + 1 {
            return false;
        }
        // Across terms, the term can only grow.
        if b.term < a.term {
            return false;
        }
        true
    }

    /// Check that `msg` is in sequence with the previous replicate and
    /// advance `prev_op_id` past it.
    pub fn check_sequential_replicate_id(&mut self, msg: &ReplicateMsg) -> Result<()> {
        if !Self::valid_sequence(self.prev_op_id, msg.id) {
            return Err(TabletError::Corruption(format!(
                "Unexpected opid following opid {}. Operation: {} REPLICATE ({})",
                self.prev_op_id,
                msg.id,
                msg.body.kind_name()
            )));
        }
        self.prev_op_id = msg.id;
        Ok(())
    }

    /// Raise the committed watermark to `id` if it is higher.
    pub fn update_committed_op_id(&mut self, id: OpId) {
        if id > self.committed_op_id {
            self.committed_op_id = id;
        }
    }
}
