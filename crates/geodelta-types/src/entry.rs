use std::sync::Arc;

use crate::Value;

/// Row-change operation codes.
///
/// The numeric codes are part of the wire format and match the
/// session-extension changeset convention (SQLITE_INSERT / SQLITE_UPDATE /
/// SQLITE_DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Operation {
    /// Add a row (code 18).
    Insert,
    /// Rewrite columns of an existing row (code 23).
    Update,
    /// Remove a row (code 9).
    Delete,
}

impl Operation {
    /// The wire code for this operation.
    pub const fn code(self) -> u8 {
        match self {
            Self::Insert => 18,
            Self::Update => 23,
            Self::Delete => 9,
        }
    }

    /// Decode a wire code; `None` for anything outside 9/18/23.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            18 => Some(Self::Insert),
            23 => Some(Self::Update),
            9 => Some(Self::Delete),
            _ => None,
        }
    }

    /// Upper-case SQL-style name, for messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Table metadata stored in a changeset table record.
///
/// `primary_keys` carries one flag per column in declaration order. Column
/// names are not part of the changeset format; consumers resolve them from
/// the target database schema.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangesetTable {
    /// Name of the table.
    pub name: String,
    /// Whether each column (in order) is part of the primary key.
    pub primary_keys: Vec<bool>,
}

impl ChangesetTable {
    pub fn new(name: impl Into<String>, primary_keys: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            primary_keys,
        }
    }

    /// Number of columns in this table.
    pub fn column_count(&self) -> usize {
        self.primary_keys.len()
    }

    /// True if at least one column is flagged as primary key.
    pub fn has_primary_key(&self) -> bool {
        self.primary_keys.iter().any(|&pk| pk)
    }

    /// Indexes of the primary-key columns, in declaration order.
    pub fn pk_indexes(&self) -> Vec<usize> {
        self.primary_keys
            .iter()
            .enumerate()
            .filter_map(|(i, &pk)| pk.then_some(i))
            .collect()
    }
}

/// One row-level change bound to the table section it appeared in.
///
/// Which rows are populated depends on the operation:
/// - INSERT: `new_values` holds the full row, `old_values` is empty.
/// - DELETE: `old_values` holds the full row, `new_values` is empty.
/// - UPDATE: both rows are populated; unchanged non-pk columns are
///   [`Value::Undefined`] on both sides, old pk columns always carry the key,
///   and new pk columns carry a value only when the key itself changes.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangesetEntry {
    pub op: Operation,
    pub old_values: Vec<Value>,
    pub new_values: Vec<Value>,
    /// Handle to the table section this entry belongs to. Entries of one
    /// section share the same allocation; a new table record installs a new
    /// one.
    pub table: Arc<ChangesetTable>,
}

impl ChangesetEntry {
    /// Build an INSERT entry with a full new row.
    pub fn insert(table: Arc<ChangesetTable>, new_values: Vec<Value>) -> Self {
        Self {
            op: Operation::Insert,
            old_values: Vec::new(),
            new_values,
            table,
        }
    }

    /// Build a DELETE entry with a full old row.
    pub fn delete(table: Arc<ChangesetTable>, old_values: Vec<Value>) -> Self {
        Self {
            op: Operation::Delete,
            old_values,
            new_values: Vec::new(),
            table,
        }
    }

    /// Build an UPDATE entry from old and new rows.
    pub fn update(
        table: Arc<ChangesetTable>,
        old_values: Vec<Value>,
        new_values: Vec<Value>,
    ) -> Self {
        Self {
            op: Operation::Update,
            old_values,
            new_values,
            table,
        }
    }
}
