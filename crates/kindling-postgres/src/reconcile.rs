use crate::Connection;

use kindling_core::{Kind, Result, Value};
use kindling_sql::{
    add_column_sql, create_column_index_sql, create_index_sql, create_table_sql,
    drop_column_index_sql, drop_column_sql, drop_index_sql, set_column_default_sql,
    set_column_nullable_sql, SqlColumn, SqlIndex, SqlTable,
};

use tracing::info;

/// The physical table a kind wants: reserved `_id`/`_parent` columns, the
/// `(_parent, _id)` unique index, every non-formula column and the unique
/// indexes of key columns.
pub fn desired_table(kind: &Kind, schema: &str) -> Result<SqlTable> {
    let mut table = SqlTable::new(schema, kind.table_name());
    table.add_column(SqlColumn {
        name: "_id".to_string(),
        sql_type: "serial".to_string(),
        primary_key: true,
        ..SqlColumn::default()
    })?;
    table.add_column(SqlColumn {
        name: "_parent".to_string(),
        sql_type: format!("\"{schema}\".\"Reference\"[]"),
        nullable: true,
        ..SqlColumn::default()
    })?;
    table.add_index(SqlIndex {
        name: String::new(),
        columns: vec!["_parent".to_string(), "_id".to_string()],
        primary_key: false,
        unique: true,
    })?;
    for column in kind.columns.iter().filter(|c| c.formula.is_none()) {
        table.add_column(SqlColumn {
            name: column.column_name.clone(),
            sql_type: column.converter.sql_type(column, schema),
            nullable: !column.required,
            ..SqlColumn::default()
        })?;
        if column.is_key {
            let mut key_columns = Vec::new();
            if column.scoped {
                key_columns.push("_parent".to_string());
            }
            key_columns.push(column.column_name.clone());
            table.add_index(SqlIndex {
                name: String::new(),
                columns: key_columns,
                primary_key: false,
                unique: true,
            })?;
        }
    }
    Ok(table)
}

pub async fn table_exists(conn: &mut Connection, schema: &str, name: &str) -> Result<bool> {
    let row = conn
        .query_row(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_name = $1 AND table_schema = $2",
            &[Value::Str(name.to_string()), Value::Str(schema.to_string())],
        )
        .await?;
    Ok(row.is_some())
}

/// Rebuilds the current table description from `information_schema` and the
/// index catalogs.
pub async fn sync_table(conn: &mut Connection, schema: &str, name: &str) -> Result<SqlTable> {
    let mut table = SqlTable::new(schema, name);
    sync_columns(conn, &mut table).await?;
    sync_indexes(conn, &mut table).await?;
    sync_constraints(conn, &mut table).await?;
    Ok(table)
}

async fn sync_columns(conn: &mut Connection, table: &mut SqlTable) -> Result<()> {
    let rows = conn
        .query(
            "SELECT column_name, column_default, is_nullable, data_type \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[
                Value::Str(table.schema.clone()),
                Value::Str(table.name.clone()),
            ],
        )
        .await?;
    for row in rows {
        let mut column = SqlColumn {
            name: row[0].to_string(),
            sql_type: row[3].to_string(),
            nullable: row[2].as_str() == Some("YES"),
            ..SqlColumn::default()
        };
        if let Some(default) = row[1].as_str() {
            if default.starts_with("nextval") && column.sql_type == "integer" {
                column.sql_type = "serial".to_string();
            } else {
                // Strip the cast the catalog appends to literals.
                let default = match default.find("::") {
                    Some(ix) => &default[..ix],
                    None => default,
                };
                column.default_value = Some(default.to_string());
            }
        }
        table.columns.push(column);
    }
    Ok(())
}

async fn sync_indexes(conn: &mut Connection, table: &mut SqlTable) -> Result<()> {
    let rows = conn
        .query(
            "WITH indexdata AS ( \
               SELECT c.oid AS tableoid, c.relname AS tablename, i.relname AS indexname, \
                      x.indkey, x.indisunique AS isunique, \
                      generate_subscripts(x.indkey, 1) AS ix \
               FROM pg_index x \
                    JOIN pg_class c ON c.oid = x.indrelid \
                    JOIN pg_class i ON i.oid = x.indexrelid \
                    LEFT JOIN pg_namespace n ON n.oid = c.relnamespace \
               WHERE i.relkind = 'i' AND n.nspname = $1 \
             ) \
             SELECT idx.indexname::text, \
                    array_to_string(array_agg(attr.attname::text), ','), \
                    bool_and(idx.isunique) \
             FROM indexdata idx, pg_attribute attr \
             WHERE attr.attrelid = idx.tableoid \
               AND attr.attnum = idx.indkey[idx.ix] \
               AND idx.tablename = $2 \
             GROUP BY idx.tablename, idx.indexname",
            &[
                Value::Str(table.schema.clone()),
                Value::Str(table.name.clone()),
            ],
        )
        .await?;
    for row in rows {
        let index_name = row[0].to_string();
        let columns: Vec<String> = row[1]
            .as_str()
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let unique = matches!(row[2], Value::Bool(true));
        if columns.len() == 1 {
            if let Some(column) = table.column_mut(&columns[0]) {
                if unique {
                    column.unique = true;
                } else {
                    column.indexed = true;
                }
            }
        } else {
            table.indexes.push(SqlIndex {
                name: index_name,
                columns,
                primary_key: false,
                unique,
            });
        }
    }
    Ok(())
}

async fn sync_constraints(conn: &mut Connection, table: &mut SqlTable) -> Result<()> {
    let rows = conn
        .query(
            "SELECT array_to_string(array_agg(cu.column_name::text), ','), \
                    tc.constraint_name::text, MAX(tc.constraint_type::text) \
             FROM information_schema.constraint_column_usage cu \
             INNER JOIN information_schema.table_constraints tc \
                   USING (constraint_schema, constraint_name) \
             WHERE cu.table_schema = $1 AND cu.table_name = $2 \
             GROUP BY tc.constraint_name",
            &[
                Value::Str(table.schema.clone()),
                Value::Str(table.name.clone()),
            ],
        )
        .await?;
    for row in rows {
        let columns: Vec<String> = row[0]
            .as_str()
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let constraint_name = row[1].to_string();
        let constraint_type = row[2].to_string();
        if columns.len() == 1 {
            if let Some(column) = table.column_mut(&columns[0]) {
                match constraint_type.as_str() {
                    "UNIQUE" => {
                        column.unique = true;
                        column.indexed = false;
                        column.primary_key = false;
                    }
                    "PRIMARY KEY" => {
                        column.unique = true;
                        column.indexed = false;
                        column.primary_key = true;
                    }
                    _ => {}
                }
            }
        } else if let Some(index) = table
            .indexes
            .iter_mut()
            .find(|i| i.name == constraint_name)
        {
            match constraint_type.as_str() {
                "UNIQUE" => {
                    index.unique = true;
                    index.primary_key = false;
                }
                "PRIMARY KEY" => {
                    index.unique = false;
                    index.primary_key = true;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Creates the kind's table when missing; otherwise brings it into
/// conformance column by column and index by index. Runs in one
/// transaction and is idempotent. When `diff` is false only the missing
/// table is created.
pub async fn reconcile_kind(
    conn: &mut Connection,
    kind: &Kind,
    schema: &str,
    diff: bool,
) -> Result<()> {
    let desired = desired_table(kind, schema)?;
    let guard = conn.begin().await?;
    let result = reconcile_inner(conn, &desired, diff).await;
    conn.finish(guard, result).await
}

async fn reconcile_inner(conn: &mut Connection, desired: &SqlTable, diff: bool) -> Result<()> {
    if !table_exists(conn, &desired.schema, &desired.name).await? {
        info!(table = %desired.name, "creating table");
        for statement in create_table_sql(desired) {
            conn.batch(&statement).await?;
        }
        return Ok(());
    }
    if !diff {
        return Ok(());
    }
    let current = sync_table(conn, &desired.schema, &desired.name).await?;

    // Desired columns: create missing ones, reconcile existing ones.
    for column in &desired.columns {
        match current.column(&column.name) {
            None => {
                info!(table = %desired.name, column = %column.name, "adding column");
                for statement in add_column_sql(desired, column) {
                    conn.batch(&statement).await?;
                }
            }
            Some(existing) => reconcile_column(conn, desired, column, existing).await?,
        }
    }

    // Current columns that fell out of the kind: drop.
    for column in &current.columns {
        if desired.column(&column.name).is_none() {
            info!(table = %desired.name, column = %column.name, "dropping column");
            for statement in drop_column_sql(desired, column) {
                conn.batch(&statement).await?;
            }
        }
    }

    // Index definitions are never modified in place: a changed index shows
    // up as one drop and one create.
    for index in &desired.indexes {
        if current.index(&index.name).is_none() {
            info!(table = %desired.name, index = %index.name, "creating index");
            conn.batch(&create_index_sql(desired, index)).await?;
        }
    }
    for index in &current.indexes {
        if desired.index(&index.name).is_none() {
            info!(table = %desired.name, index = %index.name, "dropping index");
            conn.batch(&drop_index_sql(desired, &index.name)).await?;
        }
    }
    Ok(())
}

async fn reconcile_column(
    conn: &mut Connection,
    table: &SqlTable,
    desired: &SqlColumn,
    current: &SqlColumn,
) -> Result<()> {
    // Array and user-defined types come back from the catalog under generic
    // names and are left untouched.
    if current.sql_type == "ARRAY" || current.sql_type == "USER-DEFINED" {
        return Ok(());
    }
    if desired.sql_type != current.sql_type {
        info!(table = %table.name, column = %desired.name, from = %current.sql_type,
            to = %desired.sql_type, "re-creating column");
        for statement in drop_column_sql(table, current) {
            conn.batch(&statement).await?;
        }
        for statement in add_column_sql(table, desired) {
            conn.batch(&statement).await?;
        }
        return Ok(());
    }
    if desired.indexed && !current.indexed {
        conn.batch(&create_column_index_sql(table, desired)).await?;
    } else if !desired.indexed && current.indexed {
        conn.batch(&drop_column_index_sql(table, &desired.name))
            .await?;
    }
    if desired.default_value != current.default_value {
        conn.batch(&set_column_default_sql(table, desired)).await?;
    }
    if desired.nullable != current.nullable {
        conn.batch(&set_column_nullable_sql(table, desired)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_core::{kind_of, EntityMeta, KindBuilder, Persist};

    #[derive(Default)]
    struct Widget {
        meta: EntityMeta,
        serial: String,
        weight: f64,
        notes: String,
    }

    kindling_core::impl_entity!(Widget { meta: meta });

    impl Persist for Widget {
        fn kind_name() -> String {
            "demo.widget".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field(
                "Serial",
                |e: &Widget| &e.serial,
                |e: &mut Widget| &mut e.serial,
            )
            .tags("key;scoped=false;required");
            b.field(
                "Weight",
                |e: &Widget| &e.weight,
                |e: &mut Widget| &mut e.weight,
            );
            b.field("Notes", |e: &Widget| &e.notes, |e: &mut Widget| &mut e.notes)
                .formula("''");
        }
    }

    #[test]
    fn desired_table_shape() {
        let kind = kind_of::<Widget>();
        let table = desired_table(&kind, "grumble").unwrap();

        let id = table.column("_id").unwrap();
        assert_eq!(id.sql_type, "serial");
        assert!(id.primary_key);

        let parent = table.column("_parent").unwrap();
        assert_eq!(parent.sql_type, "\"grumble\".\"Reference\"[]");

        // Formula columns are never physical.
        assert!(table.column("Notes").is_none());

        let serial = table.column("Serial").unwrap();
        assert_eq!(serial.sql_type, "text");
        assert!(!serial.nullable);
        // Unscoped key folds into a single-column unique flag.
        assert!(serial.unique);

        assert_eq!(table.indexes.len(), 1);
        assert_eq!(table.indexes[0].columns, vec!["_parent", "_id"]);
        assert!(table.indexes[0].unique);
    }
}
