//! Public API facade for geodelta.
//!
//! geodelta diffs and patches spatial SQLite databases at the row level: a
//! binary changeset file records INSERT/UPDATE/DELETE entries per table, and
//! backend drivers turn a database pair into a changeset or replay one onto a
//! target database.
//!
//! ```no_run
//! use geodelta::{open_driver, ChangesetWriter, DriverConnection};
//!
//! # fn main() -> geodelta::Result<()> {
//! let conn = DriverConnection::new()
//!     .with("base", "survey_v1.gpkg")
//!     .with("modified", "survey_v2.gpkg");
//! let driver = open_driver("sqlite", &conn)?;
//! let mut writer = ChangesetWriter::open("survey.diff")?;
//! driver.create_changeset(&mut writer)?;
//! writer.finish()?;
//! # Ok(())
//! # }
//! ```

pub use geodelta_changeset::{ChangesetReader, ChangesetWriter};
pub use geodelta_driver::{Driver, DriverConnection, KEY_BASE, KEY_MODIFIED};
pub use geodelta_driver_sqlite::SqliteDriver;
pub use geodelta_error::{DeltaError, DeltaErrorKind, Result};
pub use geodelta_types::{
    ChangesetEntry, ChangesetTable, Operation, TableColumn, TableSchema, Value,
};

/// Open a driver by backend name.
///
/// `"sqlite"` covers plain SQLite and GeoPackage files. `"postgres"` is a
/// recognized backend name but its driver is not part of this build.
pub fn open_driver(name: &str, config: &DriverConnection) -> Result<Box<dyn Driver>> {
    match name {
        "sqlite" => Ok(Box::new(SqliteDriver::open(config)?)),
        "postgres" => Err(DeltaError::DriverUnsupported {
            name: name.to_owned(),
        }),
        other => Err(DeltaError::UnknownDriver {
            name: other.to_owned(),
        }),
    }
}
