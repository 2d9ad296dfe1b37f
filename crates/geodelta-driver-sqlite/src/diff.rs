//! Changeset production: diff `main` against the attached `modified` schema.
//!
//! Per table, three pk-ordered queries drive the diff: rows only in the
//! modified database, rows only in the base database, and pk-matched rows
//! whose non-pk columns differ. Rows that changed primary key show up in the
//! first two sets; they are re-paired by identical non-pk content into UPDATE
//! entries that rewrite the key. Entries are emitted grouped by operation
//! (INSERTs, UPDATEs, DELETEs), each group in ascending key order, so output
//! bytes are deterministic for a given database pair.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::debug;

use geodelta_changeset::codec::write_value;
use geodelta_changeset::ChangesetWriter;
use geodelta_driver::Driver;
use geodelta_error::{DeltaError, Result};
use geodelta_types::{ChangesetEntry, ChangesetTable, TableSchema, Value};

use crate::{db, quote_ident, SqliteDriver};

pub(crate) fn create_changeset(
    driver: &SqliteDriver,
    writer: &mut ChangesetWriter,
) -> Result<()> {
    for table_name in driver.list_tables()? {
        let schema = driver.table_schema(&table_name)?;
        diff_table(&driver.conn, &schema, writer)?;
    }
    Ok(())
}

fn diff_table(
    conn: &Connection,
    schema: &TableSchema,
    writer: &mut ChangesetWriter,
) -> Result<()> {
    let table = Arc::new(schema.to_changeset_table());
    if !table.has_primary_key() {
        debug!(table = %schema.name, "skipping table without primary key");
        return Ok(());
    }

    let sql = TableQueries::build(schema);
    let modified_only = query_rows(conn, &sql.modified_only, schema.column_count())?;
    let base_only = query_rows(conn, &sql.base_only, schema.column_count())?;

    let (inserts, key_updates, deletes) = pair_key_changes(&table, modified_only, base_only)?;

    let mut begun = false;
    let mut counts = (0u64, 0u64, 0u64);

    for row in inserts {
        ensure_table(writer, &table, &mut begun)?;
        writer.write_entry(&ChangesetEntry::insert(Arc::clone(&table), row))?;
        counts.0 += 1;
    }

    // pk-matched updates stream straight from the join query.
    if let Some(update_sql) = &sql.updates {
        let mut stmt = db(conn.prepare(update_sql))?;
        let mut rows = db(stmt.query([]))?;
        while let Some(row) = db(rows.next())? {
            let old_full = row_values(row, 0, schema.column_count())?;
            let new_full = row_values(row, schema.column_count(), schema.column_count())?;
            if let Some(entry) = build_update(&table, &old_full, &new_full) {
                ensure_table(writer, &table, &mut begun)?;
                writer.write_entry(&entry)?;
                counts.1 += 1;
            }
        }
    }

    for (old_values, new_values) in key_updates {
        ensure_table(writer, &table, &mut begun)?;
        writer.write_entry(&ChangesetEntry::update(
            Arc::clone(&table),
            old_values,
            new_values,
        ))?;
        counts.1 += 1;
    }

    for row in deletes {
        ensure_table(writer, &table, &mut begun)?;
        writer.write_entry(&ChangesetEntry::delete(Arc::clone(&table), row))?;
        counts.2 += 1;
    }

    if begun {
        debug!(
            table = %schema.name,
            inserts = counts.0,
            updates = counts.1,
            deletes = counts.2,
            "table diffed"
        );
    }
    Ok(())
}

/// The three per-table diff queries.
struct TableQueries {
    modified_only: String,
    base_only: String,
    /// None for tables where every column is part of the primary key.
    updates: Option<String>,
}

impl TableQueries {
    fn build(schema: &TableSchema) -> Self {
        let qtable = quote_ident(&schema.name);
        let pk_names = schema.pk_column_names();
        let non_pk: Vec<&str> = schema
            .columns
            .iter()
            .filter(|c| !c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect();

        let select = |alias: &str| -> String {
            schema
                .columns
                .iter()
                .map(|c| format!("{alias}.{}", quote_ident(&c.name)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let order_by = |alias: &str| -> String {
            pk_names
                .iter()
                .map(|c| format!("{alias}.{}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let pk_join = pk_names
            .iter()
            .map(|c| format!("b.{0} = m.{0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let first_pk = quote_ident(pk_names[0]);

        let modified_only = format!(
            "SELECT {} FROM {MODIFIED}.{qtable} m LEFT JOIN main.{qtable} b ON {pk_join} \
             WHERE b.{first_pk} IS NULL ORDER BY {}",
            select("m"),
            order_by("m"),
            MODIFIED = crate::MODIFIED_SCHEMA,
        );
        let base_only = format!(
            "SELECT {} FROM main.{qtable} b LEFT JOIN {MODIFIED}.{qtable} m ON {pk_join} \
             WHERE m.{first_pk} IS NULL ORDER BY {}",
            select("b"),
            order_by("b"),
            MODIFIED = crate::MODIFIED_SCHEMA,
        );
        let updates = if non_pk.is_empty() {
            None
        } else {
            let changed = non_pk
                .iter()
                .map(|c| format!("b.{0} IS NOT m.{0}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(" OR ");
            Some(format!(
                "SELECT {}, {} FROM main.{qtable} b JOIN {MODIFIED}.{qtable} m ON {pk_join} \
                 WHERE {changed} ORDER BY {}",
                select("b"),
                select("m"),
                order_by("b"),
                MODIFIED = crate::MODIFIED_SCHEMA,
            ))
        };

        Self {
            modified_only,
            base_only,
            updates,
        }
    }
}

/// Pair rows that left the base against rows that appeared in the modified
/// database: identical non-pk content means the row merely changed its
/// primary key, which becomes an UPDATE rewriting the key. Pairing is greedy
/// in ascending key order. Tables whose every column is a key are not paired
/// (there is no content to match on).
#[allow(clippy::type_complexity)]
fn pair_key_changes(
    table: &ChangesetTable,
    modified_only: Vec<Vec<Value>>,
    base_only: Vec<Vec<Value>>,
) -> Result<(
    Vec<Vec<Value>>,
    Vec<(Vec<Value>, Vec<Value>)>,
    Vec<Vec<Value>>,
)> {
    let non_pk_idx: Vec<usize> = (0..table.column_count())
        .filter(|&i| !table.primary_keys[i])
        .collect();
    if non_pk_idx.is_empty() || modified_only.is_empty() || base_only.is_empty() {
        return Ok((modified_only, Vec::new(), base_only));
    }

    let mut by_content: BTreeMap<Vec<u8>, VecDeque<usize>> = BTreeMap::new();
    for (i, row) in base_only.iter().enumerate() {
        by_content
            .entry(content_fingerprint(row, &non_pk_idx)?)
            .or_default()
            .push_back(i);
    }

    let mut inserts = Vec::new();
    let mut key_updates = Vec::new();
    let mut paired = vec![false; base_only.len()];

    for row in modified_only {
        let fingerprint = content_fingerprint(&row, &non_pk_idx)?;
        let matched = by_content
            .get_mut(&fingerprint)
            .and_then(VecDeque::pop_front);
        match matched {
            Some(i) => {
                paired[i] = true;
                key_updates.push(key_update_rows(table, &base_only[i], &row));
            }
            None => inserts.push(row),
        }
    }

    let deletes = base_only
        .into_iter()
        .zip(paired)
        .filter_map(|(row, taken)| (!taken).then_some(row))
        .collect();

    Ok((inserts, key_updates, deletes))
}

/// Canonical byte encoding of the non-pk cells, used as the pairing key.
fn content_fingerprint(row: &[Value], non_pk_idx: &[usize]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for &i in non_pk_idx {
        write_value(&mut out, &row[i])?;
    }
    Ok(out)
}

/// Old/new rows of a key-change UPDATE: key columns carry both keys, every
/// other column is Undefined (its content did not change).
fn key_update_rows(
    table: &ChangesetTable,
    old_row: &[Value],
    new_row: &[Value],
) -> (Vec<Value>, Vec<Value>) {
    let keyed = |row: &[Value]| -> Vec<Value> {
        table
            .primary_keys
            .iter()
            .zip(row)
            .map(|(&pk, v)| if pk { v.clone() } else { Value::Undefined })
            .collect()
    };
    (keyed(old_row), keyed(new_row))
}

/// Old/new rows of a pk-matched UPDATE per the Undefined rules: the old key
/// is always present, the new key is Undefined (it did not change), and
/// unchanged non-pk columns are Undefined on both sides. Returns `None` when
/// no column actually differs.
fn build_update(
    table: &Arc<ChangesetTable>,
    old_full: &[Value],
    new_full: &[Value],
) -> Option<ChangesetEntry> {
    let mut old_values = Vec::with_capacity(table.column_count());
    let mut new_values = Vec::with_capacity(table.column_count());
    let mut changed = false;

    for (i, &pk) in table.primary_keys.iter().enumerate() {
        if pk {
            old_values.push(old_full[i].clone());
            new_values.push(Value::Undefined);
        } else if old_full[i] == new_full[i] {
            old_values.push(Value::Undefined);
            new_values.push(Value::Undefined);
        } else {
            old_values.push(old_full[i].clone());
            new_values.push(new_full[i].clone());
            changed = true;
        }
    }

    changed.then(|| ChangesetEntry::update(Arc::clone(table), old_values, new_values))
}

fn ensure_table(
    writer: &mut ChangesetWriter,
    table: &ChangesetTable,
    begun: &mut bool,
) -> Result<()> {
    if !*begun {
        writer.begin_table(table)?;
        *begun = true;
    }
    Ok(())
}

fn query_rows(conn: &Connection, sql: &str, column_count: usize) -> Result<Vec<Vec<Value>>> {
    let mut stmt = db(conn.prepare(sql))?;
    let mut rows = db(stmt.query([]))?;
    let mut out = Vec::new();
    while let Some(row) = db(rows.next())? {
        out.push(row_values(row, 0, column_count)?);
    }
    Ok(out)
}

/// Decode `count` columns of a result row starting at `start`.
pub(crate) fn row_values(row: &rusqlite::Row<'_>, start: usize, count: usize) -> Result<Vec<Value>> {
    (start..start + count)
        .map(|i| {
            let value = match db(row.get_ref(i))? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(n) => Value::Int(n),
                ValueRef::Real(f) => Value::Double(f),
                ValueRef::Text(bytes) => Value::Text(
                    std::str::from_utf8(bytes)
                        .map_err(|_| {
                            DeltaError::database("text column holds invalid UTF-8")
                        })?
                        .to_owned(),
                ),
                ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
            };
            Ok(value)
        })
        .collect()
}
