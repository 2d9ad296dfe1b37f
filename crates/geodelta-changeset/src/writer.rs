use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use geodelta_error::{DeltaError, Result};
use geodelta_types::{ChangesetEntry, ChangesetTable, Operation, Value};

use crate::codec::{write_null_terminated_string, write_value, write_varint, TABLE_MARKER};

/// Streaming writer of binary changeset files.
///
/// Usage: [`open`](Self::open) a file, then for each modified table call
/// [`begin_table`](Self::begin_table) once followed by
/// [`write_entry`](Self::write_entry) per change, and finally
/// [`finish`](Self::finish). Output is deterministic: the same call sequence
/// produces identical bytes.
pub struct ChangesetWriter {
    out: BufWriter<File>,
    current_table: Option<ChangesetTable>,
    entries_written: u64,
}

impl ChangesetWriter {
    /// Create or truncate the output file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        debug!(path = %path.display(), "changeset opened for writing");
        Ok(Self {
            out: BufWriter::new(file),
            current_table: None,
            entries_written: 0,
        })
    }

    /// Emit a table record and switch all subsequent entries to this table.
    ///
    /// The previous section (if any) is terminated implicitly by the new
    /// marker. Tables must have at least one column and at least one
    /// primary-key flag set.
    pub fn begin_table(&mut self, table: &ChangesetTable) -> Result<()> {
        if table.column_count() == 0 || !table.has_primary_key() {
            return Err(DeltaError::NoPrimaryKey {
                table: table.name.clone(),
            });
        }
        let column_count =
            u32::try_from(table.column_count()).map_err(|_| DeltaError::TooManyColumns {
                count: table.column_count(),
                max: u32::MAX as usize,
            })?;

        let mut record = Vec::with_capacity(2 + table.column_count() + table.name.len() + 1);
        record.push(TABLE_MARKER);
        write_varint(&mut record, column_count);
        for &pk in &table.primary_keys {
            record.push(u8::from(pk));
        }
        write_null_terminated_string(&mut record, &table.name)?;
        self.out.write_all(&record)?;

        debug!(
            table = %table.name,
            columns = table.column_count(),
            "table section begun"
        );
        self.current_table = Some(table.clone());
        Ok(())
    }

    /// Emit one entry in the current table section.
    ///
    /// Validates the presence and length of the old/new rows against the
    /// entry's operation and the current table's column count. The
    /// primary-key/Undefined semantics of UPDATE rows are the caller's
    /// responsibility.
    pub fn write_entry(&mut self, entry: &ChangesetEntry) -> Result<()> {
        let table = self.current_table.as_ref().ok_or(DeltaError::NoCurrentTable)?;
        validate_shape(entry, table)?;

        let mut record = Vec::new();
        record.push(entry.op.code());
        record.push(0); // indirect flag, reserved
        if matches!(entry.op, Operation::Update | Operation::Delete) {
            write_row(&mut record, &entry.old_values)?;
        }
        if matches!(entry.op, Operation::Update | Operation::Insert) {
            write_row(&mut record, &entry.new_values)?;
        }
        self.out.write_all(&record)?;
        self.entries_written += 1;
        Ok(())
    }

    /// Number of entries written so far.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Flush buffered output and close the file.
    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        debug!(entries = self.entries_written, "changeset finished");
        Ok(())
    }
}

fn write_row(out: &mut Vec<u8>, values: &[Value]) -> Result<()> {
    for value in values {
        write_value(out, value)?;
    }
    Ok(())
}

fn validate_shape(entry: &ChangesetEntry, table: &ChangesetTable) -> Result<()> {
    let n = table.column_count();
    let (wants_old, wants_new) = match entry.op {
        Operation::Insert => (false, true),
        Operation::Delete => (true, false),
        Operation::Update => (true, true),
    };

    if !wants_old && !entry.old_values.is_empty() {
        return Err(DeltaError::EntryShape {
            op: entry.op.as_str(),
            detail: "old values must be absent".to_owned(),
        });
    }
    if !wants_new && !entry.new_values.is_empty() {
        return Err(DeltaError::EntryShape {
            op: entry.op.as_str(),
            detail: "new values must be absent".to_owned(),
        });
    }
    if wants_old && entry.old_values.is_empty() {
        return Err(DeltaError::EntryShape {
            op: entry.op.as_str(),
            detail: "old values are required".to_owned(),
        });
    }
    if wants_new && entry.new_values.is_empty() {
        return Err(DeltaError::EntryShape {
            op: entry.op.as_str(),
            detail: "new values are required".to_owned(),
        });
    }

    if wants_old && entry.old_values.len() != n {
        return Err(DeltaError::ColumnCountMismatch {
            table: table.name.clone(),
            expected: n,
            actual: entry.old_values.len(),
        });
    }
    if wants_new && entry.new_values.len() != n {
        return Err(DeltaError::ColumnCountMismatch {
            table: table.name.clone(),
            expected: n,
            actual: entry.new_values.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ChangesetReader;
    use geodelta_error::DeltaErrorKind;

    fn simple_table() -> ChangesetTable {
        ChangesetTable::new("simple", vec![true, false])
    }

    fn write_to_bytes(build: impl FnOnce(&mut ChangesetWriter)) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.diff");
        let mut writer = ChangesetWriter::open(&path).unwrap();
        build(&mut writer);
        writer.finish().unwrap();
        std::fs::read(&path).unwrap()
    }

    #[test]
    fn table_record_bytes() {
        let bytes = write_to_bytes(|w| {
            w.begin_table(&simple_table()).unwrap();
        });
        let mut expected = vec![TABLE_MARKER, 2, 1, 0];
        expected.extend_from_slice(b"simple\0");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn insert_entry_bytes() {
        let table = Arc::new(simple_table());
        let entry = ChangesetEntry::insert(
            Arc::clone(&table),
            vec![Value::Int(3), Value::Text("c".to_owned())],
        );
        let bytes = write_to_bytes(|w| {
            w.begin_table(&table).unwrap();
            w.write_entry(&entry).unwrap();
        });

        let mut expected = vec![TABLE_MARKER, 2, 1, 0];
        expected.extend_from_slice(b"simple\0");
        expected.push(18);
        expected.push(0);
        expected.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0, 3]);
        expected.extend_from_slice(&[0x03, 0x01, b'c']);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn write_entry_before_begin_table_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangesetWriter::open(dir.path().join("x.diff")).unwrap();
        let entry = ChangesetEntry::insert(Arc::new(simple_table()), vec![Value::Int(1)]);
        let err = writer.write_entry(&entry).unwrap_err();
        assert!(matches!(err, DeltaError::NoCurrentTable));
        assert_eq!(err.kind(), DeltaErrorKind::Usage);
    }

    #[test]
    fn table_without_primary_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangesetWriter::open(dir.path().join("x.diff")).unwrap();
        let err = writer
            .begin_table(&ChangesetTable::new("log", vec![false, false]))
            .unwrap_err();
        assert!(matches!(err, DeltaError::NoPrimaryKey { .. }));
    }

    #[test]
    fn wrong_row_length_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangesetWriter::open(dir.path().join("x.diff")).unwrap();
        writer.begin_table(&simple_table()).unwrap();
        let entry = ChangesetEntry::insert(Arc::new(simple_table()), vec![Value::Int(1)]);
        let err = writer.write_entry(&entry).unwrap_err();
        assert!(matches!(
            err,
            DeltaError::ColumnCountMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
        assert_eq!(err.kind(), DeltaErrorKind::Schema);
    }

    #[test]
    fn op_row_presence_mismatch_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangesetWriter::open(dir.path().join("x.diff")).unwrap();
        writer.begin_table(&simple_table()).unwrap();

        // INSERT must not carry old values.
        let mut bad_insert = ChangesetEntry::insert(
            Arc::new(simple_table()),
            vec![Value::Int(1), Value::Null],
        );
        bad_insert.old_values = vec![Value::Int(1), Value::Null];
        assert!(matches!(
            writer.write_entry(&bad_insert).unwrap_err(),
            DeltaError::EntryShape { op: "INSERT", .. }
        ));

        // UPDATE must carry both rows.
        let bad_update = ChangesetEntry::update(
            Arc::new(simple_table()),
            vec![Value::Int(1), Value::Null],
            Vec::new(),
        );
        assert!(matches!(
            writer.write_entry(&bad_update).unwrap_err(),
            DeltaError::EntryShape { op: "UPDATE", .. }
        ));
    }

    #[test]
    fn deterministic_output() {
        let table = Arc::new(simple_table());
        let entries = vec![
            ChangesetEntry::insert(
                Arc::clone(&table),
                vec![Value::Int(1), Value::Text("a".to_owned())],
            ),
            ChangesetEntry::update(
                Arc::clone(&table),
                vec![Value::Int(1), Value::Text("a".to_owned())],
                vec![Value::Undefined, Value::Text("z".to_owned())],
            ),
            ChangesetEntry::delete(
                Arc::clone(&table),
                vec![Value::Int(2), Value::Null],
            ),
        ];
        let write_all = |w: &mut ChangesetWriter| {
            w.begin_table(&table).unwrap();
            for e in &entries {
                w.write_entry(e).unwrap();
            }
        };
        let first = write_to_bytes(write_all);
        let second = write_to_bytes(write_all);
        assert_eq!(first, second);
    }

    #[test]
    fn roundtrip_through_reader() {
        let table = Arc::new(ChangesetTable::new("points", vec![true, false, false]));
        let entries = vec![
            ChangesetEntry::insert(
                Arc::clone(&table),
                vec![
                    Value::Int(10),
                    Value::Blob(vec![0x01, 0x02, 0x03]),
                    Value::Double(4.5),
                ],
            ),
            ChangesetEntry::update(
                Arc::clone(&table),
                vec![Value::Int(10), Value::Undefined, Value::Double(4.5)],
                vec![Value::Undefined, Value::Undefined, Value::Double(9.0)],
            ),
            ChangesetEntry::delete(
                Arc::clone(&table),
                vec![Value::Int(11), Value::Null, Value::Null],
            ),
        ];

        let bytes = write_to_bytes(|w| {
            w.begin_table(&table).unwrap();
            for e in &entries {
                w.write_entry(e).unwrap();
            }
        });

        let mut reader = ChangesetReader::from_bytes(bytes);
        for expected in &entries {
            let got = reader.next_entry().unwrap().unwrap();
            assert_eq!(got.op, expected.op);
            assert_eq!(got.old_values, expected.old_values);
            assert_eq!(got.new_values, expected.new_values);
            assert_eq!(got.table.as_ref(), table.as_ref());
        }
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn read_write_read_is_byte_identical() {
        // Round-trip invariant: read a changeset, write every entry back,
        // and compare the bytes.
        let table_a = Arc::new(ChangesetTable::new("a", vec![true, false]));
        let table_b = Arc::new(ChangesetTable::new("b", vec![true]));
        let original = write_to_bytes(|w| {
            w.begin_table(&table_a).unwrap();
            w.write_entry(&ChangesetEntry::insert(
                Arc::clone(&table_a),
                vec![Value::Int(1), Value::Text("x".to_owned())],
            ))
            .unwrap();
            w.begin_table(&table_b).unwrap();
            w.write_entry(&ChangesetEntry::delete(
                Arc::clone(&table_b),
                vec![Value::Int(9)],
            ))
            .unwrap();
        });

        let mut reader = ChangesetReader::from_bytes(original.clone());
        let rewritten = write_to_bytes(|w| {
            let mut last_table: Option<Arc<ChangesetTable>> = None;
            while let Some(entry) = reader.next_entry().unwrap() {
                let switch = last_table
                    .as_ref()
                    .map_or(true, |t| !Arc::ptr_eq(t, &entry.table));
                if switch {
                    w.begin_table(&entry.table).unwrap();
                    last_table = Some(Arc::clone(&entry.table));
                }
                w.write_entry(&entry).unwrap();
            }
        });
        assert_eq!(original, rewritten);
    }

    proptest::proptest! {
        /// Writer/reader round-trip over arbitrary well-formed entry streams.
        #[test]
        fn prop_entry_stream_roundtrip(
            rows in proptest::collection::vec(arb_row(), 1..20)
        ) {
            let table = Arc::new(ChangesetTable::new("t", vec![true, false, false]));
            let entries: Vec<ChangesetEntry> = rows
                .into_iter()
                .map(|row| ChangesetEntry::insert(Arc::clone(&table), row))
                .collect();

            let bytes = write_to_bytes(|w| {
                w.begin_table(&table).unwrap();
                for e in &entries {
                    w.write_entry(e).unwrap();
                }
            });
            let mut reader = ChangesetReader::from_bytes(bytes);
            for expected in &entries {
                let got = reader.next_entry().unwrap().unwrap();
                proptest::prop_assert_eq!(&got.new_values, &expected.new_values);
            }
            proptest::prop_assert!(reader.next_entry().unwrap().is_none());
        }
    }

    fn arb_row() -> impl proptest::strategy::Strategy<Value = Vec<Value>> {
        use proptest::prelude::*;
        let cell = prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::Int),
            (-1.0e12_f64..1.0e12).prop_map(Value::Double),
            "[a-z0-9 ]{0,24}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Blob),
        ];
        proptest::collection::vec(cell, 3..=3)
    }
}
