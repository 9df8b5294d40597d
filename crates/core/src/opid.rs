//! Consensus operation identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by the consensus layer to every replicated operation.
///
/// Ordered lexicographically: a higher term always dominates, and within a
/// term the index increases by exactly one for each appended operation. The
/// derived `Ord` gives exactly that ordering because `term` is declared
/// first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpId {
    /// Leadership term the operation was proposed in.
    pub term: u64,
    /// Position within the term.
    pub index: u64,
}

impl OpId {
    /// The uninitialized sentinel `(0, 0)`.
    ///
    /// No real operation ever carries it: terms start at 1.
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    /// Create an id from a term and an index.
    pub fn new(term: u64, index: u64) -> Self {
        OpId { term, index }
    }

    /// Whether this is the uninitialized sentinel.
    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}
