//! Binary changeset files: codec primitives, streaming reader, and writer.
//!
//! A changeset file is a concatenation of table sections. Each section opens
//! with a table record (`'T'` marker, column count, pk flags, table name) and
//! is followed by entry records until the next table record or end of file.
//! The layout is bit-exact compatible with the session-extension changeset
//! format: value tags 0..=5 and operation codes 9/18/23 are wire contract.

pub mod codec;
mod reader;
mod writer;

pub use reader::ChangesetReader;
pub use writer::ChangesetWriter;
