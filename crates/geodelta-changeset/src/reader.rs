use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use geodelta_error::{DeltaError, Result};
use geodelta_types::{ChangesetEntry, ChangesetTable, Operation, Value};

use crate::codec::{Cursor, TABLE_MARKER};

/// Streaming reader over a binary changeset file.
///
/// The whole file is buffered on [`open`](Self::open); decoding is a single
/// forward pass driven by [`next_entry`](Self::next_entry). Table records are
/// consumed internally: each one installs new current-table metadata, and
/// every returned entry holds a handle to the most recently installed table.
/// The reader is not restartable; re-open the file to scan again.
#[derive(Debug)]
pub struct ChangesetReader {
    buf: Vec<u8>,
    pos: usize,
    current_table: Option<Arc<ChangesetTable>>,
}

impl ChangesetReader {
    /// Open a changeset file and buffer its contents.
    ///
    /// Fails if the file is missing, unreadable, or empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DeltaError::ChangesetNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                DeltaError::Io(err)
            }
        })?;
        if buf.is_empty() {
            return Err(DeltaError::EmptyChangeset {
                path: path.to_path_buf(),
            });
        }
        debug!(path = %path.display(), bytes = buf.len(), "changeset opened for reading");
        Ok(Self::from_bytes(buf))
    }

    /// Wrap an in-memory changeset buffer.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self {
            buf,
            pos: 0,
            current_table: None,
        }
    }

    /// Table metadata of the section currently being read, if any.
    pub fn current_table(&self) -> Option<&Arc<ChangesetTable>> {
        self.current_table.as_ref()
    }

    /// Advance to the next entry.
    ///
    /// Returns `Ok(Some(entry))` for each entry, `Ok(None)` at a clean end of
    /// file, and an error on malformed input. After an error the stream is
    /// unusable.
    pub fn next_entry(&mut self) -> Result<Option<ChangesetEntry>> {
        loop {
            if self.pos >= self.buf.len() {
                return Ok(None);
            }
            let mut cur = Cursor::new(&self.buf, self.pos);
            if cur.peek_byte() == Some(TABLE_MARKER) {
                let table = read_table_record(&mut cur)?;
                debug!(
                    table = %table.name,
                    columns = table.column_count(),
                    "table section installed"
                );
                self.current_table = Some(Arc::new(table));
                self.pos = cur.offset();
                continue;
            }

            let Some(table) = self.current_table.clone() else {
                return Err(DeltaError::EntryBeforeTable { offset: self.pos });
            };
            let entry = read_entry(&mut cur, table)?;
            self.pos = cur.offset();
            return Ok(Some(entry));
        }
    }
}

/// Decode a table record. The cursor sits on the `'T'` marker.
fn read_table_record(cur: &mut Cursor<'_>) -> Result<ChangesetTable> {
    let marker = cur.read_byte()?;
    debug_assert_eq!(marker, TABLE_MARKER);
    let column_count = cur.read_varint()? as usize;
    let mut primary_keys = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        primary_keys.push(cur.read_byte()? != 0);
    }
    let name = cur.read_null_terminated_string()?;
    Ok(ChangesetTable { name, primary_keys })
}

/// Decode one entry record bound to `table`.
fn read_entry(cur: &mut Cursor<'_>, table: Arc<ChangesetTable>) -> Result<ChangesetEntry> {
    let op_offset = cur.offset();
    let code = cur.read_byte()?;
    let op = Operation::from_code(code).ok_or(DeltaError::UnknownOperation {
        code,
        offset: op_offset,
    })?;
    // Reserved "indirect" flag: any value tolerated.
    let _indirect = cur.read_byte()?;

    let column_count = table.column_count();
    let old_values = match op {
        Operation::Update | Operation::Delete => read_row(cur, column_count)?,
        Operation::Insert => Vec::new(),
    };
    let new_values = match op {
        Operation::Update | Operation::Insert => read_row(cur, column_count)?,
        Operation::Delete => Vec::new(),
    };

    Ok(ChangesetEntry {
        op,
        old_values,
        new_values,
        table,
    })
}

fn read_row(cur: &mut Cursor<'_>, column_count: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        values.push(cur.read_value()?);
    }
    Ok(values)
}
