//! Table schema types.
//!
//! The bootstrap engine only needs enough schema to validate replayed row
//! operations and to apply ALTER_SCHEMA records, so columns carry a name and
//! a key marker rather than a full type system.

use serde::{Deserialize, Serialize};

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name, unique within a schema.
    pub name: String,
    /// Whether the column participates in the row key.
    pub is_key: bool,
}

impl ColumnSchema {
    /// A key column.
    pub fn key(name: impl Into<String>) -> Self {
        ColumnSchema {
            name: name.into(),
            is_key: true,
        }
    }

    /// A value column.
    pub fn value(name: impl Into<String>) -> Self {
        ColumnSchema {
            name: name.into(),
            is_key: false,
        }
    }
}

/// A versioned table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Columns in declaration order. At least one must be a key column.
    pub columns: Vec<ColumnSchema>,
    /// Schema version, bumped by every ALTER_SCHEMA.
    pub version: u32,
}

impl Schema {
    /// Create a schema from columns and a version.
    pub fn new(columns: Vec<ColumnSchema>, version: u32) -> Self {
        Schema { columns, version }
    }

    /// A single key column plus a single value column, version 0.
    ///
    /// The shape every test tablet starts from.
    pub fn simple() -> Self {
        Schema::new(
            vec![ColumnSchema::key("key"), ColumnSchema::value("value")],
            0,
        )
    }

    /// Whether the schema has at least one key column.
    pub fn has_key_column(&self) -> bool {
        self.columns.iter().any(|c| c.is_key)
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}
