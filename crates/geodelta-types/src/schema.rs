use crate::ChangesetTable;

/// One column of a table schema as reported by a driver.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableColumn {
    /// Column name.
    pub name: String,
    /// Declared type, verbatim from the backend (e.g. `INTEGER`, `BLOB`).
    pub type_name: String,
    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,
    /// Whether the column carries a NOT NULL constraint.
    pub is_not_null: bool,
}

/// Ordered column list of one user table.
///
/// Two databases are diffable only when every user table has an equal schema:
/// same tables, same column order, names, declared types, and pk flags.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<TableColumn>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<TableColumn>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Names of the primary-key columns, in declaration order.
    pub fn pk_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Derive the `(name, pk flags)` pair stored in a changeset table record.
    pub fn to_changeset_table(&self) -> ChangesetTable {
        ChangesetTable::new(
            self.name.clone(),
            self.columns.iter().map(|c| c.is_primary_key).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_schema() -> TableSchema {
        TableSchema::new(
            "simple",
            vec![
                TableColumn {
                    name: "fid".to_owned(),
                    type_name: "INTEGER".to_owned(),
                    is_primary_key: true,
                    is_not_null: true,
                },
                TableColumn {
                    name: "geometry".to_owned(),
                    type_name: "BLOB".to_owned(),
                    is_primary_key: false,
                    is_not_null: false,
                },
                TableColumn {
                    name: "name".to_owned(),
                    type_name: "TEXT".to_owned(),
                    is_primary_key: false,
                    is_not_null: false,
                },
                TableColumn {
                    name: "rating".to_owned(),
                    type_name: "MEDIUMINT".to_owned(),
                    is_primary_key: false,
                    is_not_null: false,
                },
            ],
        )
    }

    #[test]
    fn pk_names_follow_declaration_order() {
        let schema = simple_schema();
        assert_eq!(schema.column_count(), 4);
        assert_eq!(schema.pk_column_names(), vec!["fid"]);
    }

    #[test]
    fn changeset_table_conversion() {
        let table = simple_schema().to_changeset_table();
        assert_eq!(table.name, "simple");
        assert_eq!(table.primary_keys, vec![true, false, false, false]);
    }

    #[test]
    fn schema_equality_is_structural() {
        assert_eq!(simple_schema(), simple_schema());
        let mut other = simple_schema();
        other.columns[2].type_name = "VARCHAR".to_owned();
        assert_ne!(simple_schema(), other);
    }
}
