use kindling_core::{Error, Result};

/// A physical column description, either desired (derived from a kind) or
/// current (introspected from the catalog).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlColumn {
    pub name: String,
    pub sql_type: String,
    pub default_value: Option<String>,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub indexed: bool,
}

/// A multi-column index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub primary_key: bool,
    pub unique: bool,
}

/// A table description the reconciler compares desired and current state
/// with.
#[derive(Debug, Clone)]
pub struct SqlTable {
    pub schema: String,
    pub name: String,
    pub columns: Vec<SqlColumn>,
    pub indexes: Vec<SqlIndex>,
}

impl SqlTable {
    pub fn new(schema: &str, name: &str) -> SqlTable {
        SqlTable {
            schema: schema.to_string(),
            name: name.to_string(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&SqlColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut SqlColumn> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&SqlIndex> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn add_column(&mut self, column: SqlColumn) -> Result<()> {
        if self.column(&column.name).is_some() {
            return Err(Error::schema_conflict(format!(
                "cannot add duplicate column '{}'",
                column.name
            )));
        }
        if column.primary_key {
            if let Some(existing) = self.columns.iter().find(|c| c.primary_key) {
                return Err(Error::schema_conflict(format!(
                    "cannot add second primary key column '{}' in addition to current PK '{}'",
                    column.name, existing.name
                )));
            }
            if self.indexes.iter().any(|i| i.primary_key) {
                return Err(Error::schema_conflict(format!(
                    "cannot add primary key column '{}' in addition to current multi-column PK",
                    column.name
                )));
            }
        }
        self.columns.push(column);
        Ok(())
    }

    /// Adds an index. Single-column indexes fold into the column's flags;
    /// multi-column indexes get a default `<table>_<col>_…` name and force
    /// their member columns NOT NULL.
    pub fn add_index(&mut self, mut index: SqlIndex) -> Result<()> {
        if index.columns.is_empty() {
            return Err(Error::schema_conflict("cannot add index without columns"));
        }
        if !index.name.is_empty() && self.index(&index.name).is_some() {
            return Err(Error::schema_conflict(format!(
                "cannot add duplicate index '{}'",
                index.name
            )));
        }
        if index.primary_key {
            if let Some(existing) = self.columns.iter().find(|c| c.primary_key) {
                return Err(Error::schema_conflict(format!(
                    "cannot set multi-column PK; current dedicated PK column is '{}'",
                    existing.name
                )));
            }
        }
        for column_name in &index.columns {
            if self.column(column_name).is_none() {
                return Err(Error::schema_conflict(format!(
                    "cannot add index '{}' with non-existent key column '{}'",
                    index.name, column_name
                )));
            }
        }
        if index.columns.len() == 1 {
            let column = self.column_mut(&index.columns[0]).unwrap();
            if index.primary_key {
                column.indexed = false;
                column.unique = false;
                column.nullable = false;
                column.primary_key = true;
            } else if index.unique {
                column.unique = true;
            } else {
                column.indexed = true;
            }
        } else {
            if index.name.is_empty() {
                index.name = format!("{}_{}", self.name, index.columns.join("_"));
            }
            for column_name in index.columns.clone() {
                self.column_mut(&column_name).unwrap().nullable = false;
            }
            self.indexes.push(index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, sql_type: &str) -> SqlColumn {
        SqlColumn {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable: true,
            ..SqlColumn::default()
        }
    }

    #[test]
    fn duplicate_column_rejected() {
        let mut table = SqlTable::new("grumble", "product");
        table.add_column(column("Name", "text")).unwrap();
        assert!(table.add_column(column("Name", "text")).is_err());
    }

    #[test]
    fn two_primary_keys_rejected() {
        let mut table = SqlTable::new("grumble", "product");
        let mut id = column("_id", "serial");
        id.primary_key = true;
        table.add_column(id).unwrap();
        let mut other = column("other", "integer");
        other.primary_key = true;
        assert!(table.add_column(other).is_err());
    }

    #[test]
    fn single_column_index_folds_into_flags() {
        let mut table = SqlTable::new("grumble", "product");
        table.add_column(column("Name", "text")).unwrap();
        table
            .add_index(SqlIndex {
                name: String::new(),
                columns: vec!["Name".to_string()],
                primary_key: false,
                unique: true,
            })
            .unwrap();
        assert!(table.column("Name").unwrap().unique);
        assert!(table.indexes.is_empty());
    }

    #[test]
    fn multi_column_index_gets_default_name() {
        let mut table = SqlTable::new("grumble", "product");
        table.add_column(column("_parent", "text")).unwrap();
        table.add_column(column("_id", "serial")).unwrap();
        table
            .add_index(SqlIndex {
                name: String::new(),
                columns: vec!["_parent".to_string(), "_id".to_string()],
                primary_key: false,
                unique: true,
            })
            .unwrap();
        assert_eq!(table.indexes[0].name, "product__parent__id");
        assert!(!table.column("_parent").unwrap().nullable);
    }

    #[test]
    fn index_on_missing_column_rejected() {
        let mut table = SqlTable::new("grumble", "product");
        assert!(table
            .add_index(SqlIndex {
                name: "x".to_string(),
                columns: vec!["nope".to_string()],
                primary_key: false,
                unique: false,
            })
            .is_err());
    }
}
