//! The driver contract: how a concrete database backend plugs into the
//! changeset subsystem.
//!
//! A driver bridges one backend (SQLite, PostgreSQL, ...) to the changeset
//! reader and writer. Opened on a `base` database alone it can apply
//! changesets; opened on a `base` + `modified` pair it can also produce them.

use std::collections::BTreeMap;

use geodelta_changeset::{ChangesetReader, ChangesetWriter};
use geodelta_error::{DeltaError, Result};
use geodelta_types::TableSchema;

/// Connection key naming the base data store. Required.
pub const KEY_BASE: &str = "base";

/// Connection key naming the modified data store. Optional; required only
/// for producing diffs.
pub const KEY_MODIFIED: &str = "modified";

/// Driver connection configuration: a string-keyed map of options.
///
/// The core recognizes [`KEY_BASE`] and [`KEY_MODIFIED`]; backend-specific
/// keys are preserved for the concrete driver and unrecognized keys never
/// cause failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DriverConnection {
    options: BTreeMap<String, String>,
}

impl DriverConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of one option.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up an arbitrary option.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// The required base location.
    pub fn base(&self) -> Result<&str> {
        self.get(KEY_BASE)
            .ok_or(DeltaError::MissingConnectionKey { key: KEY_BASE })
    }

    /// The optional modified location.
    pub fn modified(&self) -> Option<&str> {
        self.get(KEY_MODIFIED)
    }
}

/// Capability set every backend driver exposes.
///
/// Implementations own their database connection(s) for their lifetime and
/// are not required to be thread-safe; callers serialize access externally.
/// Concrete drivers provide an `open(&DriverConnection)` constructor that
/// validates the configured locations and verifies base/modified schema
/// equality before any of these methods are called.
pub trait Driver: std::fmt::Debug {
    /// Backend name, e.g. `"sqlite"`.
    fn name(&self) -> &'static str;

    /// User tables of the base database, ascending by name, excluding
    /// backend-internal tables.
    fn list_tables(&self) -> Result<Vec<String>>;

    /// Ordered column metadata of one table.
    fn table_schema(&self, table: &str) -> Result<TableSchema>;

    /// Emit the complete base→modified diff through `writer`.
    ///
    /// Requires the driver to have been opened with both `base` and
    /// `modified`. Tables are visited in ascending name order; a table with
    /// no changed rows emits nothing, not even a table record. Output is
    /// deterministic for a given database pair.
    fn create_changeset(&self, writer: &mut ChangesetWriter) -> Result<()>;

    /// Consume entries from `reader` and apply them to the base database.
    ///
    /// Stops at the first conflict (duplicate insert key, missing delete
    /// row, stale update values); the concrete driver decides how its own
    /// transaction unwinds.
    fn apply_changeset(&mut self, reader: &mut ChangesetReader) -> Result<()>;
}
