//! Changeset application: replay entries onto the base database.
//!
//! The whole changeset runs inside one transaction. The first conflict
//! (duplicate insert key, missing delete row, stale update values) aborts
//! the run and the transaction rolls back on drop, leaving the base
//! untouched.

use std::collections::HashMap;

use rusqlite::ffi::ErrorCode;
use rusqlite::{params_from_iter, OptionalExtension, Transaction};
use tracing::debug;

use geodelta_changeset::ChangesetReader;
use geodelta_error::{DeltaError, Result};
use geodelta_types::{ChangesetEntry, ChangesetTable, Operation, Value};

use crate::diff::row_values;
use crate::{db, quote_ident, table_columns, SqliteDriver};

pub(crate) fn apply_changeset(
    driver: &mut SqliteDriver,
    reader: &mut ChangesetReader,
) -> Result<()> {
    let tx = db(driver.conn.transaction())?;
    let mut columns_by_table: HashMap<String, Vec<String>> = HashMap::new();
    let mut counts = (0u64, 0u64, 0u64);

    while let Some(entry) = reader.next_entry()? {
        let table = &entry.table;
        if !columns_by_table.contains_key(&table.name) {
            columns_by_table.insert(table.name.clone(), target_columns(&tx, table)?);
        }
        let columns = &columns_by_table[&table.name];

        match entry.op {
            Operation::Insert => {
                apply_insert(&tx, table, columns, &entry)?;
                counts.0 += 1;
            }
            Operation::Update => {
                apply_update(&tx, table, columns, &entry)?;
                counts.1 += 1;
            }
            Operation::Delete => {
                apply_delete(&tx, table, columns, &entry)?;
                counts.2 += 1;
            }
        }
    }

    db(tx.commit())?;
    debug!(
        inserted = counts.0,
        updated = counts.1,
        deleted = counts.2,
        "changeset applied"
    );
    Ok(())
}

/// Column names of the target table, verified against the changeset's
/// column count.
fn target_columns(tx: &Transaction<'_>, table: &ChangesetTable) -> Result<Vec<String>> {
    let columns = table_columns(tx, "main", &table.name)?;
    if columns.is_empty() {
        return Err(DeltaError::NoSuchTable {
            name: table.name.clone(),
        });
    }
    if columns.len() != table.column_count() {
        return Err(DeltaError::schema_mismatch(format!(
            "table '{}' has {} column(s) in the target database but {} in the changeset",
            table.name,
            columns.len(),
            table.column_count()
        )));
    }
    Ok(columns.into_iter().map(|c| c.name).collect())
}

fn apply_insert(
    tx: &Transaction<'_>,
    table: &ChangesetTable,
    columns: &[String],
    entry: &ChangesetEntry,
) -> Result<()> {
    let params: Vec<rusqlite::types::Value> = entry
        .new_values
        .iter()
        .map(|v| bind_value(Operation::Insert, v))
        .collect::<Result<_>>()?;
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO main.{} ({column_list}) VALUES ({placeholders})",
        quote_ident(&table.name)
    );

    tx.execute(&sql, params_from_iter(params)).map_err(|err| {
        if is_constraint_violation(&err) {
            DeltaError::InsertConflict {
                table: table.name.clone(),
            }
        } else {
            DeltaError::database(err)
        }
    })?;
    Ok(())
}

fn apply_delete(
    tx: &Transaction<'_>,
    table: &ChangesetTable,
    columns: &[String],
    entry: &ChangesetEntry,
) -> Result<()> {
    let (predicate, params) = pk_predicate(table, columns, &entry.old_values, Operation::Delete)?;
    let sql = format!(
        "DELETE FROM main.{} WHERE {predicate}",
        quote_ident(&table.name)
    );
    let affected = db(tx.execute(&sql, params_from_iter(params)))?;
    if affected == 0 {
        return Err(DeltaError::DeleteConflict {
            table: table.name.clone(),
        });
    }
    Ok(())
}

fn apply_update(
    tx: &Transaction<'_>,
    table: &ChangesetTable,
    columns: &[String],
    entry: &ChangesetEntry,
) -> Result<()> {
    let (predicate, pk_params) =
        pk_predicate(table, columns, &entry.old_values, Operation::Update)?;

    // Fetch the current row and verify the recorded old values against it.
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let select_sql = format!(
        "SELECT {column_list} FROM main.{} WHERE {predicate}",
        quote_ident(&table.name)
    );
    let current: Option<Vec<Value>> = db(tx
        .query_row(&select_sql, params_from_iter(pk_params.clone()), |row| {
            // Defer decoding errors; collect raw values first.
            Ok(row_values(row, 0, columns.len()))
        })
        .optional())?
    .transpose()?;
    let Some(current) = current else {
        return Err(DeltaError::update_conflict(&table.name, "row not found"));
    };

    for (i, old) in entry.old_values.iter().enumerate() {
        if table.primary_keys[i] || old.is_undefined() {
            continue;
        }
        if current[i] != *old {
            return Err(DeltaError::update_conflict(
                &table.name,
                format!("column '{}' does not match the recorded old value", columns[i]),
            ));
        }
    }

    // Overwrite the non-Undefined new values; a non-Undefined new pk rewrites
    // the key itself.
    let mut sets = Vec::new();
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    for (i, new) in entry.new_values.iter().enumerate() {
        if new.is_undefined() {
            continue;
        }
        let position = params.len() + 1;
        sets.push(format!("{} = ?{position}", quote_ident(&columns[i])));
        params.push(bind_value(Operation::Update, new)?);
    }
    if sets.is_empty() {
        return Err(DeltaError::EntryShape {
            op: Operation::Update.as_str(),
            detail: "no non-undefined new value".to_owned(),
        });
    }

    // Re-number the pk predicate after the SET parameters.
    let offset = params.len();
    let predicate = renumber_predicate(table, columns, offset);
    params.extend(pk_params);

    let sql = format!(
        "UPDATE main.{} SET {} WHERE {predicate}",
        quote_ident(&table.name),
        sets.join(", ")
    );
    let affected = tx.execute(&sql, params_from_iter(params)).map_err(|err| {
        if is_constraint_violation(&err) {
            DeltaError::update_conflict(&table.name, "new primary key already exists")
        } else {
            DeltaError::database(err)
        }
    })?;
    if affected == 0 {
        return Err(DeltaError::update_conflict(&table.name, "row not found"));
    }
    Ok(())
}

/// `pk1 = ?1 AND pk2 = ?2 ...` plus the bound key values from `row`.
fn pk_predicate(
    table: &ChangesetTable,
    columns: &[String],
    row: &[Value],
    op: Operation,
) -> Result<(String, Vec<rusqlite::types::Value>)> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for (i, &pk) in table.primary_keys.iter().enumerate() {
        if !pk {
            continue;
        }
        let position = params.len() + 1;
        clauses.push(format!("{} = ?{position}", quote_ident(&columns[i])));
        params.push(bind_value(op, &row[i])?);
    }
    if clauses.is_empty() {
        return Err(DeltaError::NoPrimaryKey {
            table: table.name.clone(),
        });
    }
    Ok((clauses.join(" AND "), params))
}

/// The pk predicate with parameter numbers shifted past `offset`.
fn renumber_predicate(table: &ChangesetTable, columns: &[String], offset: usize) -> String {
    let mut clauses = Vec::new();
    let mut position = offset;
    for (i, &pk) in table.primary_keys.iter().enumerate() {
        if !pk {
            continue;
        }
        position += 1;
        clauses.push(format!("{} = ?{position}", quote_ident(&columns[i])));
    }
    clauses.join(" AND ")
}

/// Convert a changeset value into a bindable SQLite value. `Undefined` never
/// reaches the database.
fn bind_value(op: Operation, value: &Value) -> Result<rusqlite::types::Value> {
    Ok(match value {
        Value::Undefined => {
            return Err(DeltaError::EntryShape {
                op: op.as_str(),
                detail: "undefined value where a concrete value is required".to_owned(),
            })
        }
        Value::Null => rusqlite::types::Value::Null,
        Value::Int(i) => rusqlite::types::Value::Integer(*i),
        Value::Double(d) => rusqlite::types::Value::Real(*d),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation)
    )
}
