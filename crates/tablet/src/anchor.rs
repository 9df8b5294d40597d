//! Operation id anchors.
//!
//! Log garbage collection may only reclaim segments whose operations are no
//! longer needed by anyone. Components that still depend on an operation
//! (an unflushed memrowset, an in-flight transaction) register an anchor on
//! its id; GC keeps every segment at or past the minimum anchored id.

use parking_lot::Mutex;
use plateau_core::OpId;
use std::collections::BTreeMap;

/// Registry of op id anchors, keyed by owner name.
///
/// One registry is shared between a tablet and its log.
#[derive(Debug, Default)]
pub struct OpIdAnchorRegistry {
    anchors: Mutex<BTreeMap<String, OpId>>,
}

impl OpIdAnchorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        OpIdAnchorRegistry::default()
    }

    /// Anchor `op_id` under `owner`, replacing any previous anchor with the
    /// same owner.
    pub fn register(&self, owner: impl Into<String>, op_id: OpId) {
        self.anchors.lock().insert(owner.into(), op_id);
    }

    /// Remove `owner`'s anchor. Returns whether one existed.
    pub fn unregister(&self, owner: &str) -> bool {
        self.anchors.lock().remove(owner).is_some()
    }

    /// The smallest anchored op id, or `None` if nothing is anchored.
    pub fn min_anchored_op_id(&self) -> Option<OpId> {
        self.anchors.lock().values().min().copied()
    }

    /// Number of live anchors.
    pub fn num_anchors(&self) -> usize {
        self.anchors.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_has_no_minimum() {
        let registry = OpIdAnchorRegistry::new();
        assert_eq!(registry.min_anchored_op_id(), None);
        assert_eq!(registry.num_anchors(), 0);
    }

    #[test]
    fn test_minimum_tracks_registrations() {
        let registry = OpIdAnchorRegistry::new();
        registry.register("mrs-1", OpId::new(2, 5));
        registry.register("tx-7", OpId::new(1, 9));
        assert_eq!(registry.min_anchored_op_id(), Some(OpId::new(1, 9)));

        assert!(registry.unregister("tx-7"));
        assert_eq!(registry.min_anchored_op_id(), Some(OpId::new(2, 5)));
    }

    #[test]
    fn test_reregister_replaces_owner_anchor() {
        let registry = OpIdAnchorRegistry::new();
        registry.register("mrs-1", OpId::new(1, 1));
        registry.register("mrs-1", OpId::new(3, 1));
        assert_eq!(registry.num_anchors(), 1);
        assert_eq!(registry.min_anchored_op_id(), Some(OpId::new(3, 1)));
    }
}
