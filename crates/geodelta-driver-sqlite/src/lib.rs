//! SQLite-backed implementation of the geodelta driver contract.
//!
//! The driver owns one rusqlite connection. The base database is opened as
//! schema `main`; when a modified database is configured it is ATTACHed as
//! schema `modified`, which lets the diff queries join both sides without
//! loading tables into memory. Opening a pair verifies that every user table
//! has an identical schema in both databases.

mod apply;
mod diff;

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use geodelta_changeset::{ChangesetReader, ChangesetWriter};
use geodelta_driver::{Driver, DriverConnection, KEY_MODIFIED};
use geodelta_error::{DeltaError, Result};
use geodelta_types::{TableColumn, TableSchema};

/// Schema name the modified database is attached under.
const MODIFIED_SCHEMA: &str = "modified";

/// Driver for SQLite-format databases (plain SQLite and GeoPackage files).
#[derive(Debug)]
pub struct SqliteDriver {
    pub(crate) conn: Connection,
    pub(crate) has_modified: bool,
}

impl SqliteDriver {
    /// Open the driver from connection configuration.
    ///
    /// `base` is required and must be an existing, readable SQLite database.
    /// When `modified` is present it must be one too, and the user-table
    /// schemas of both databases must match exactly.
    pub fn open(config: &DriverConnection) -> Result<Self> {
        let base = config.base()?;
        let conn = Connection::open_with_flags(base, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(DeltaError::database)?;
        // A failed header read only surfaces on first use; force it now.
        db(conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        }))?;

        let has_modified = match config.modified() {
            Some(modified) => {
                // ATTACH would create a missing file; reject it up front.
                if !Path::new(modified).is_file() {
                    return Err(DeltaError::database(format!(
                        "unable to open database file: '{modified}'"
                    )));
                }
                db(conn.execute(
                    &format!("ATTACH DATABASE ?1 AS {MODIFIED_SCHEMA}"),
                    [modified],
                ))?;
                db(conn.query_row(
                    &format!("SELECT count(*) FROM {MODIFIED_SCHEMA}.sqlite_master"),
                    [],
                    |row| row.get::<_, i64>(0),
                ))?;
                check_schemas_match(&conn)?;
                true
            }
            None => false,
        };

        debug!(base, has_modified, "sqlite driver opened");
        Ok(Self { conn, has_modified })
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        user_tables(&self.conn, "main")
    }

    fn table_schema(&self, table: &str) -> Result<TableSchema> {
        let columns = table_columns(&self.conn, "main", table)?;
        if columns.is_empty() {
            return Err(DeltaError::NoSuchTable {
                name: table.to_owned(),
            });
        }
        Ok(TableSchema::new(table, columns))
    }

    fn create_changeset(&self, writer: &mut ChangesetWriter) -> Result<()> {
        if !self.has_modified {
            return Err(DeltaError::MissingConnectionKey { key: KEY_MODIFIED });
        }
        diff::create_changeset(self, writer)
    }

    fn apply_changeset(&mut self, reader: &mut ChangesetReader) -> Result<()> {
        apply::apply_changeset(self, reader)
    }
}

/// Map a rusqlite result into the geodelta error type.
pub(crate) fn db<T>(result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(DeltaError::database)
}

/// Quote an identifier for embedding in SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// User tables of one schema, ascending by name. Internal `sqlite_*` tables
/// are excluded.
pub(crate) fn user_tables(conn: &Connection, schema: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {}.sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
         ORDER BY name",
        quote_ident(schema)
    );
    let mut stmt = db(conn.prepare(&sql))?;
    let names = db(stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(Iterator::collect))?;
    Ok(names)
}

/// Ordered column metadata of one table in one schema. Empty when the table
/// does not exist.
pub(crate) fn table_columns(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> Result<Vec<TableColumn>> {
    let sql = format!(
        "PRAGMA {}.table_info({})",
        quote_ident(schema),
        quote_ident(table)
    );
    let mut stmt = db(conn.prepare(&sql))?;
    let columns = db(stmt
        .query_map([], |row| {
            Ok(TableColumn {
                name: row.get("name")?,
                type_name: row.get("type")?,
                is_primary_key: row.get::<_, i64>("pk")? != 0,
                is_not_null: row.get::<_, i64>("notnull")? != 0,
            })
        })
        .and_then(Iterator::collect))?;
    Ok(columns)
}

/// Verify that `main` and `modified` agree on every user table's schema.
fn check_schemas_match(conn: &Connection) -> Result<()> {
    let base_tables = user_tables(conn, "main")?;
    let modified_tables = user_tables(conn, MODIFIED_SCHEMA)?;
    if base_tables != modified_tables {
        return Err(DeltaError::schema_mismatch(format!(
            "table lists differ: base [{}] vs modified [{}]",
            base_tables.join(", "),
            modified_tables.join(", ")
        )));
    }
    for table in &base_tables {
        let base_columns = table_columns(conn, "main", table)?;
        let modified_columns = table_columns(conn, MODIFIED_SCHEMA, table)?;
        if base_columns != modified_columns {
            return Err(DeltaError::schema_mismatch(format!(
                "columns of table '{table}' differ"
            )));
        }
    }
    Ok(())
}
