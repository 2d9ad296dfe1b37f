use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for geodelta operations.
///
/// Structured variants for the common failure cases of the changeset codec,
/// the reader/writer pair, and the database drivers. Every variant renders a
/// human-readable message suitable for logs.
#[derive(Error, Debug)]
pub enum DeltaError {
    // === Changeset input errors ===
    /// Changeset file does not exist.
    #[error("changeset not found: '{path}'")]
    ChangesetNotFound { path: PathBuf },

    /// Changeset file exists but contains no bytes.
    #[error("changeset is empty: '{path}'")]
    EmptyChangeset { path: PathBuf },

    /// The stream ended in the middle of a record.
    #[error("truncated changeset: needed {needed} more byte(s) at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// A varint ran past the 5-byte limit.
    #[error("varint at offset {offset} exceeds 5 bytes")]
    VarintTooLong { offset: usize },

    /// A value carried a type tag outside 0..=5.
    #[error("unknown value tag {tag} at offset {offset}")]
    UnknownValueTag { tag: u8, offset: usize },

    /// An entry carried an operation code outside 9/18/23.
    #[error("unknown operation code {code} at offset {offset}")]
    UnknownOperation { code: u8, offset: usize },

    /// An entry record appeared before any table record.
    #[error("entry at offset {offset} appears before any table record")]
    EntryBeforeTable { offset: usize },

    /// A text value holds bytes that are not valid UTF-8.
    #[error("text value at offset {offset} is not valid UTF-8")]
    InvalidText { offset: usize },

    // === Schema errors ===
    /// Base and modified databases disagree on schema.
    #[error("schemas of base and modified databases differ: {detail}")]
    SchemaMismatch { detail: String },

    /// A row's length disagrees with the current table's column count.
    #[error("row has {actual} value(s) but table '{table}' has {expected} column(s)")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    // === I/O and database errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the underlying database engine.
    #[error("database error: {0}")]
    Database(String),

    // === Apply-time conflicts ===
    /// INSERT found a row with the same primary key already present.
    #[error("insert conflict in table '{table}': primary key already exists")]
    InsertConflict { table: String },

    /// DELETE addressed a row that no longer exists.
    #[error("delete conflict in table '{table}': row not found")]
    DeleteConflict { table: String },

    /// UPDATE found a missing row or stale old values.
    #[error("update conflict in table '{table}': {detail}")]
    UpdateConflict { table: String, detail: String },

    // === Usage errors ===
    /// `write_entry` was called before any `begin_table`.
    #[error("write_entry called before begin_table")]
    NoCurrentTable,

    /// The entry's old/new rows do not match its operation.
    #[error("entry shape does not match {op}: {detail}")]
    EntryShape { op: &'static str, detail: String },

    /// A table was handed to the writer without any primary-key column.
    #[error("table '{table}' has no primary key column")]
    NoPrimaryKey { table: String },

    /// A table name carries an interior NUL byte and cannot be serialized.
    #[error("table name contains a NUL byte: {name:?}")]
    InvalidTableName { name: String },

    /// Too many columns for the 32-bit wire format.
    #[error("too many columns: {count} (max {max})")]
    TooManyColumns { count: usize, max: usize },

    /// A text or blob value exceeds the 32-bit length prefix.
    #[error("value of {len} bytes exceeds the wire format limit")]
    ValueTooLarge { len: usize },

    /// A required connection key is absent.
    #[error("missing required connection key '{key}'")]
    MissingConnectionKey { key: &'static str },

    /// The requested driver name is not registered.
    #[error("unknown driver: {name}")]
    UnknownDriver { name: String },

    /// The driver is recognized but not compiled into this build.
    #[error("driver '{name}' is not supported in this build")]
    DriverUnsupported { name: String },

    /// No table with this name exists in the opened database.
    #[error("no such table: {name}")]
    NoSuchTable { name: String },
}

/// Coarse error taxonomy: which part of the contract was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaErrorKind {
    /// Malformed changeset bytes.
    Input,
    /// Base/modified schema disagreement or column-count mismatch.
    Schema,
    /// File or database failure.
    Io,
    /// Apply-time mismatch between changeset and target database.
    Conflict,
    /// The API was called incorrectly.
    Usage,
}

impl DeltaError {
    /// Map this error to its taxonomy kind.
    pub const fn kind(&self) -> DeltaErrorKind {
        match self {
            Self::EmptyChangeset { .. }
            | Self::Truncated { .. }
            | Self::VarintTooLong { .. }
            | Self::UnknownValueTag { .. }
            | Self::UnknownOperation { .. }
            | Self::EntryBeforeTable { .. }
            | Self::InvalidText { .. } => DeltaErrorKind::Input,
            Self::SchemaMismatch { .. } | Self::ColumnCountMismatch { .. } => {
                DeltaErrorKind::Schema
            }
            Self::ChangesetNotFound { .. } | Self::Io(_) | Self::Database(_) => DeltaErrorKind::Io,
            Self::InsertConflict { .. }
            | Self::DeleteConflict { .. }
            | Self::UpdateConflict { .. } => DeltaErrorKind::Conflict,
            Self::NoCurrentTable
            | Self::EntryShape { .. }
            | Self::NoPrimaryKey { .. }
            | Self::InvalidTableName { .. }
            | Self::TooManyColumns { .. }
            | Self::ValueTooLarge { .. }
            | Self::MissingConnectionKey { .. }
            | Self::UnknownDriver { .. }
            | Self::DriverUnsupported { .. }
            | Self::NoSuchTable { .. } => DeltaErrorKind::Usage,
        }
    }

    /// Whether applying the same changeset again could succeed after the
    /// target database is repaired (conflicts), as opposed to a broken file.
    pub const fn is_conflict(&self) -> bool {
        matches!(self.kind(), DeltaErrorKind::Conflict)
    }

    /// Create a database error from any displayable engine error.
    pub fn database(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }

    /// Create a schema mismatch error.
    pub fn schema_mismatch(detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            detail: detail.into(),
        }
    }

    /// Create an update conflict error.
    pub fn update_conflict(table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UpdateConflict {
            table: table.into(),
            detail: detail.into(),
        }
    }
}

/// Result type alias using `DeltaError`.
pub type Result<T> = std::result::Result<T, DeltaError>;
