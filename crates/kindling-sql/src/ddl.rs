use crate::fmt::{Delimited, Formatter, ToSql};
use crate::ident::Ident;
use crate::table::{SqlColumn, SqlIndex, SqlTable};

fn column_def(f: &mut Formatter, column: &SqlColumn) {
    fmt!(f, Ident(&column.name) " " column.sql_type.as_str());
    if let Some(default) = &column.default_value {
        fmt!(f, " DEFAULT " default);
    }
    if !column.nullable {
        fmt!(f, " NOT NULL");
    }
    if column.unique && !column.primary_key {
        fmt!(f, " UNIQUE");
    }
    if column.primary_key {
        fmt!(f, " PRIMARY KEY");
    }
}

/// Renders the statements that create `table`: the CREATE TABLE itself,
/// then one CREATE INDEX per indexed column and multi-column index.
pub fn create_table_sql(table: &SqlTable) -> Vec<String> {
    let mut statements = Vec::new();
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "CREATE TABLE " table.qualified_name() " (");
    for (ix, column) in table.columns.iter().enumerate() {
        if ix > 0 {
            fmt!(&mut f, ", ");
        }
        column_def(&mut f, column);
    }
    for index in &table.indexes {
        if index.primary_key {
            fmt!(&mut f, ", CONSTRAINT " Ident(&index.name) " PRIMARY KEY (");
            fmt!(&mut f, Delimited(index.columns.iter().map(Ident), ", ") ")");
        }
    }
    fmt!(&mut f, ")");
    statements.push(f.dst);

    for column in &table.columns {
        if column.indexed && !column.primary_key {
            statements.push(create_column_index_sql(table, column));
        }
    }
    for index in &table.indexes {
        if !index.primary_key {
            statements.push(create_index_sql(table, index));
        }
    }
    statements
}

/// `ALTER TABLE … ADD COLUMN`, plus the column's index when it has one.
pub fn add_column_sql(table: &SqlTable, column: &SqlColumn) -> Vec<String> {
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "ALTER TABLE " table.qualified_name() " ADD COLUMN ");
    column_def(&mut f, column);
    let mut statements = vec![f.dst];
    if column.indexed && !column.primary_key {
        statements.push(create_column_index_sql(table, column));
    }
    statements
}

/// Drops the column's index first, then the column.
pub fn drop_column_sql(table: &SqlTable, column: &SqlColumn) -> Vec<String> {
    let mut statements = Vec::new();
    if column.indexed {
        statements.push(drop_column_index_sql(table, &column.name));
    }
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "ALTER TABLE " table.qualified_name() " DROP COLUMN " Ident(&column.name));
    statements.push(f.dst);
    statements
}

pub fn create_column_index_sql(table: &SqlTable, column: &SqlColumn) -> String {
    let mut f = Formatter { dst: String::new() };
    let unique = if column.unique { "UNIQUE " } else { "" };
    let name = format!("{}_{}", table.name, column.name);
    fmt!(&mut f, "CREATE " unique "INDEX " Ident(name) " ON " table.qualified_name()
        " (" Ident(&column.name) ")");
    f.dst
}

pub fn drop_column_index_sql(table: &SqlTable, column_name: &str) -> String {
    let mut f = Formatter { dst: String::new() };
    let name = format!("{}_{}", table.name, column_name);
    fmt!(&mut f, "DROP INDEX " Ident(&table.schema) "." Ident(name));
    f.dst
}

pub fn create_index_sql(table: &SqlTable, index: &SqlIndex) -> String {
    let mut f = Formatter { dst: String::new() };
    let unique = if index.unique { "UNIQUE " } else { "" };
    fmt!(&mut f, "CREATE " unique "INDEX " Ident(&index.name) " ON " table.qualified_name()
        " (" Delimited(index.columns.iter().map(Ident), ", ") ")");
    f.dst
}

pub fn drop_index_sql(table: &SqlTable, index_name: &str) -> String {
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "DROP INDEX " Ident(&table.schema) "." Ident(index_name));
    f.dst
}

/// `SET DEFAULT …` / `DROP DEFAULT`, per the desired column.
pub fn set_column_default_sql(table: &SqlTable, column: &SqlColumn) -> String {
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "ALTER TABLE " table.qualified_name() " ALTER COLUMN " Ident(&column.name));
    match &column.default_value {
        Some(default) => fmt!(&mut f, " SET DEFAULT " default),
        None => fmt!(&mut f, " DROP DEFAULT"),
    }
    f.dst
}

/// `SET NOT NULL` / `DROP NOT NULL`, per the desired column.
pub fn set_column_nullable_sql(table: &SqlTable, column: &SqlColumn) -> String {
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "ALTER TABLE " table.qualified_name() " ALTER COLUMN " Ident(&column.name));
    if column.nullable {
        fmt!(&mut f, " DROP NOT NULL");
    } else {
        fmt!(&mut f, " SET NOT NULL");
    }
    f.dst
}
