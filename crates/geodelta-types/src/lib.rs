//! Core data model for geodelta changesets.
//!
//! A changeset is a stream of row-level changes ([`ChangesetEntry`]) grouped
//! into table sections ([`ChangesetTable`]). Each cell is a [`Value`], a
//! tagged union over the SQL storage classes plus the `Undefined` marker
//! that UPDATE entries use for columns carrying no information.

mod entry;
mod schema;
mod value;

pub use entry::{ChangesetEntry, ChangesetTable, Operation};
pub use schema::{TableColumn, TableSchema};
pub use value::Value;
