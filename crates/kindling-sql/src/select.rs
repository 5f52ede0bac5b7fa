use crate::fmt::{Formatter, ToSql};
use crate::params::{count_placeholders, rewrite_placeholders};

use kindling_core::kind::Column;
use kindling_core::{Query, QueryTable, Value};

/// Renders a query to a single CTE-based SELECT plus its ordered parameter
/// list. Positional sentinels are rewritten to `$1`, `$2`, … after
/// rendering; the sentinel count always equals the parameter count.
pub fn render_query(query: &Query) -> (String, Vec<Value>) {
    let mut f = Formatter { dst: String::new() };

    fmt!(&mut f, "WITH ");
    with_table(&mut f, query, &query.table);
    for join in query.active_joins() {
        fmt!(&mut f, ", ");
        with_table(&mut f, query, &join.table);
    }
    for sub_query in &query.sub_queries {
        fmt!(&mut f, ", ");
        with_table(&mut f, query, &sub_query.table);
    }

    fmt!(&mut f, "\nSELECT ");
    match query.grouped_by() {
        Some(grouped) => {
            select_from(&mut f, grouped);
            for table in query.aggregated_tables() {
                for aggregate in &table.aggregates {
                    fmt!(&mut f, ", " aggregate.sql_text(&table.alias));
                }
            }
            for sub_query in &query.sub_queries {
                fmt!(&mut f, sub_query.sql_text());
            }
            for computed in &query.global_computed {
                fmt!(&mut f, ", " computed.sql_formula(Some(&query.table.alias)));
            }
        }
        None => {
            select_from(&mut f, &query.table);
            for sub_query in &query.sub_queries {
                fmt!(&mut f, sub_query.sql_text());
            }
            for computed in &query.global_computed {
                fmt!(&mut f, ", " computed.sql_formula(Some(&query.table.alias)));
            }
            for join in query.active_joins() {
                fmt!(&mut f, ", ");
                select_from(&mut f, &join.table);
            }
        }
    }

    fmt!(&mut f, "\nFROM " query.table.alias.as_str());
    for join in query.active_joins() {
        fmt!(&mut f, "\n" join.join_clause(&query.table));
    }

    if query.query_conditions.size() > 0 {
        let qualified = query.table.kind.qualified_table(&query.schema);
        let cx = query.condition_cx(Some(&query.table.alias), &qualified);
        fmt!(&mut f, "\nWHERE " query.query_conditions.where_clause(&cx));
    }

    if let Some(grouped) = query.grouped_by() {
        let alias = grouped.alias.as_str();
        fmt!(&mut f, "\nGROUP BY " alias ".\"_kind\", " alias ".\"_parent\", " alias ".\"_id\"");
        for column in &grouped.kind.columns {
            fmt!(&mut f, ", " column.converter.sql_text_in(column, alias, false));
        }
        for computed in &grouped.computed {
            fmt!(&mut f, ", " alias ".\"" computed.name.as_str() "\"");
        }
    }

    fmt!(&mut f, "\nORDER BY ");
    for sort in &query.sorting {
        fmt!(&mut f, sort.sql_text(&query.table.alias) ", ");
    }
    fmt!(&mut f, &query.table.alias ".\"_id\" ASC");

    let values = query.values();
    debug_assert_eq!(
        count_placeholders(&f.dst),
        values.len(),
        "placeholder count must match the bound parameter list"
    );
    (rewrite_placeholders(&f.dst), values)
}

/// One WITH table: the kind's own SELECT, then one UNION ALL branch per
/// derived kind. Every branch projects the root kind's columns, so derived
/// rows stay column-compatible.
fn with_table(f: &mut Formatter, query: &Query, table: &QueryTable) {
    fmt!(f, &table.alias " AS (\n  SELECT '" table.kind.name() "' \"_kind\", \"_parent\", \"_id\"");
    for column in &table.kind.columns {
        fmt!(f, ", " col_select(column));
    }
    for computed in &table.computed {
        fmt!(f, ", " computed.sql_formula(None));
    }
    let qualified = table.kind.qualified_table(&query.schema);
    fmt!(f, "\n  FROM " qualified.as_str());
    if table.conditions.size() > 0 {
        let cx = query.condition_cx(None, &qualified);
        fmt!(f, "\n  WHERE " table.conditions.where_clause(&cx));
    }
    if table.with_derived {
        for derived in table.kind.derived_kinds() {
            fmt!(f, "\n  UNION ALL\n  SELECT '" derived.name() "' \"_kind\", \"_parent\", \"_id\"");
            for column in &table.kind.columns {
                fmt!(f, ", " col_select(column));
            }
            for computed in &table.computed {
                fmt!(f, ", " computed.sql_formula(None));
            }
            let derived_table = derived.qualified_table(&query.schema);
            fmt!(f, "\n  FROM " derived_table.as_str());
            if table.conditions.size() > 0 {
                let cx = query.condition_cx(None, &derived_table);
                fmt!(f, "\n  WHERE " table.conditions.where_clause(&cx));
            }
        }
    }
    fmt!(f, ")");
}

fn col_select(column: &Column) -> String {
    let select = column.converter.sql_text_in(column, "", true);
    match &column.formula {
        Some(formula) => format!("({formula}) {select}"),
        None => select,
    }
}

/// The outer projection for one WITH table. The parent chain is cast to
/// text so the row scanner can parse the array literal.
fn select_from(f: &mut Formatter, table: &QueryTable) {
    let alias = table.alias.as_str();
    fmt!(f, alias ".\"_kind\", " alias ".\"_parent\"::text \"_parent\", " alias ".\"_id\"");
    for column in &table.kind.columns {
        fmt!(f, ", " column.converter.sql_text_in(column, alias, false));
    }
    for computed in &table.computed {
        fmt!(f, ", " alias ".\"" computed.name.as_str() "\"");
    }
}
