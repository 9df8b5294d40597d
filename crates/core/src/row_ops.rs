//! Decoded row operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of change a row operation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOpKind {
    /// Insert a new row.
    Insert,
    /// Mutate an existing row.
    Update,
    /// Remove an existing row.
    Delete,
}

impl fmt::Display for RowOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RowOpKind::Insert => "INSERT",
            RowOpKind::Update => "UPDATE",
            RowOpKind::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// One row operation inside a write request.
///
/// Inserts and updates carry the new value; deletes carry only the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOperation {
    /// What the operation does.
    pub kind: RowOpKind,
    /// Encoded row key.
    pub key: String,
    /// New value for inserts and updates, `None` for deletes.
    pub value: Option<String>,
}

impl RowOperation {
    /// An insert of `key -> value`.
    pub fn insert(key: impl Into<String>, value: impl Into<String>) -> Self {
        RowOperation {
            kind: RowOpKind::Insert,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// An update of `key -> value`.
    pub fn update(key: impl Into<String>, value: impl Into<String>) -> Self {
        RowOperation {
            kind: RowOpKind::Update,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A delete of `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        RowOperation {
            kind: RowOpKind::Delete,
            key: key.into(),
            value: None,
        }
    }
}
