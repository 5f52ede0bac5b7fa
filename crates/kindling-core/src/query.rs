use crate::cond::{Compound, Condition, ConditionCx};
use crate::kind::Kind;
use crate::{Key, Value};

use std::sync::Arc;

/// An ordered, string-valued parameter bag, as decoded from a query string
/// or a form.
#[derive(Debug, Clone, Default)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Params {
        Params::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.to_string(), value.into()));
        self
    }

    /// The first value for `name`, if any non-empty one is present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, v)| n == name && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn truthy(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Params {
    fn from(pairs: [(&str, &str); N]) -> Params {
        let mut params = Params::new();
        for (name, value) in pairs {
            params.set(name, value);
        }
        params
    }
}

/// An aggregate over a joined table's column, projected under `name`.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub function: String,
    pub column: String,
    pub name: String,
    pub default: Option<String>,
}

impl Aggregate {
    pub fn sql_text(&self, alias: &str) -> String {
        let col = if self.column == "*" {
            "*".to_string()
        } else {
            format!("{alias}.\"{}\"", self.column)
        };
        match &self.default {
            Some(default) => format!(
                "COALESCE({}({col}), {default}) \"{}\"",
                self.function, self.name
            ),
            None => format!("{}({col}) \"{}\"", self.function, self.name),
        }
    }
}

/// A computed column: a SQL formula projected under `name`. `__alias__.`
/// inside the formula is substituted with the enclosing table alias.
#[derive(Debug, Clone)]
pub struct Computed {
    pub formula: String,
    pub name: String,
}

impl Computed {
    pub fn sql_formula(&self, alias: Option<&str>) -> String {
        let prefix = match alias {
            Some(alias) => format!("{alias}."),
            None => String::new(),
        };
        format!(
            "{} \"{}\"",
            self.formula.replace("__alias__.", &prefix),
            self.name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Sort {
    /// Table alias the sort column lives on; the root alias when absent.
    pub alias: Option<String>,
    pub column: String,
    pub direction: SortOrder,
}

impl Sort {
    pub fn sql_text(&self, root_alias: &str) -> String {
        let alias = self.alias.as_deref().unwrap_or(root_alias);
        format!("{alias}.\"{}\" {}", self.column, self.direction)
    }
}

/// Which side of a reference a join follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinDirection {
    /// The join field is a reference column on the query's kind.
    #[default]
    Referring,
    /// The join field is a reference column on the joined kind.
    ReferredBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Cross,
}

impl std::fmt::Display for JoinType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Cross => "CROSS",
        })
    }
}

/// A single SELECT source within a query: the root, a join or a sub-query.
#[derive(Debug, Clone)]
pub struct QueryTable {
    pub kind: Arc<Kind>,
    /// When set, the table's WITH clause unions in every derived kind.
    pub with_derived: bool,
    pub alias: String,
    pub conditions: Compound,
    pub group_by: bool,
    pub computed: Vec<Computed>,
    pub aggregates: Vec<Aggregate>,
}

impl QueryTable {
    pub fn new(kind: Arc<Kind>) -> QueryTable {
        QueryTable {
            kind,
            with_derived: false,
            alias: String::new(),
            conditions: Compound::default(),
            group_by: false,
            computed: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    pub fn add_condition(&mut self, condition: Condition) -> &mut Self {
        self.conditions.add(condition);
        self
    }

    /// Adds an equality filter on a field. Unknown field names are silently
    /// skipped.
    pub fn add_filter(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        if let Some(column) = self.kind.column(field) {
            let column_name = column.column_name.clone();
            self.add_condition(Condition::eq(&column_name, value));
        }
        self
    }

    pub fn has_parent(&mut self, parent: Option<&Key>) -> &mut Self {
        let key = parent.cloned().unwrap_or_else(Key::zero);
        self.add_condition(Condition::HasParent(key))
    }

    /// Adds an aggregate. The aggregated column must name an existing
    /// column or computed column; aggregates are forbidden on the grouped
    /// table itself. Violations are programmer errors.
    pub fn add_aggregate(&mut self, mut aggregate: Aggregate) -> &mut Self {
        if self.group_by {
            panic!("cannot have aggregates on a grouped kind");
        }
        if aggregate.column != "*" {
            match self.kind.column(&aggregate.column) {
                Some(column) => aggregate.column = column.column_name.clone(),
                None => {
                    if !self.computed.iter().any(|c| c.name == aggregate.column) {
                        panic!("no column with field name '{}' found", aggregate.column);
                    }
                }
            }
        }
        self.aggregates.push(aggregate);
        self
    }

    pub fn add_computed_column(&mut self, computed: Computed) -> &mut Self {
        self.computed.push(computed);
        self
    }

    fn condition_values(&self, acc: &mut Vec<Value>) {
        self.conditions.values(acc);
        if self.with_derived {
            for _ in self.kind.derived_kinds() {
                self.conditions.values(acc);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Join {
    pub table: QueryTable,
    pub direction: JoinDirection,
    pub join_type: JoinType,
    /// A field on the query's kind (out-joins), on the join's kind
    /// (in-joins), or the literal `_parent`.
    pub field_name: String,
    /// Marks the join as a reference wiring point: the scanned entity is
    /// assigned to the named field on the root entity.
    pub reference: bool,
    pub suppressed: bool,
}

impl Join {
    pub fn new(kind: Arc<Kind>, field_name: &str) -> Join {
        Join {
            table: QueryTable::new(kind),
            direction: JoinDirection::default(),
            join_type: JoinType::default(),
            field_name: field_name.to_string(),
            reference: false,
            suppressed: false,
        }
    }

    pub fn is_inner(&self) -> bool {
        matches!(self.join_type, JoinType::Inner | JoinType::Cross)
    }

    /// Renders the join clause against the root table. Unknown join fields
    /// are programmer errors.
    pub fn join_clause(&self, root: &QueryTable) -> String {
        let (lhs_alias, rhs_alias) = match self.direction {
            JoinDirection::Referring => (self.table.alias.as_str(), root.alias.as_str()),
            JoinDirection::ReferredBy => (root.alias.as_str(), self.table.alias.as_str()),
        };
        let rhs = if self.field_name == "_parent" {
            format!("({rhs_alias}.\"_parent\")[1]")
        } else {
            let owner = match self.direction {
                JoinDirection::Referring => &root.kind,
                JoinDirection::ReferredBy => &self.table.kind,
            };
            let column = owner
                .column(&self.field_name)
                .unwrap_or_else(|| panic!("invalid column '{}' in join", self.field_name));
            if column.converter.reference_kind().is_some() {
                format!(
                    "({rhs_alias}.\"{0}.kind\", {rhs_alias}.\"{0}.id\")",
                    column.column_name
                )
            } else {
                format!("{rhs_alias}.\"{}\"", column.column_name)
            }
        };
        format!(
            "{} JOIN {} ON (({lhs_alias}.\"_kind\", {lhs_alias}.\"_id\") = {rhs})",
            self.join_type, self.table.alias
        )
    }
}

/// A correlated sub-query block: a WITH table plus scalar sub-selects
/// projected into the outer row.
#[derive(Debug, Clone)]
pub struct SubQuery {
    pub table: QueryTable,
    pub where_sql: Option<String>,
    pub sub_selects: Vec<Computed>,
}

impl SubQuery {
    pub fn new(kind: Arc<Kind>) -> SubQuery {
        SubQuery {
            table: QueryTable::new(kind),
            where_sql: None,
            sub_selects: Vec::new(),
        }
    }

    pub fn add_sub_select(&mut self, computed: Computed) -> &mut Self {
        self.sub_selects.push(computed);
        self
    }

    pub fn sql_text(&self) -> String {
        let mut out = String::new();
        for sub_select in &self.sub_selects {
            let where_clause = match &self.where_sql {
                Some(w) => format!(" WHERE {w}"),
                None => String::new(),
            };
            out.push_str(&format!(
                ", (SELECT {} FROM {}{}) \"{}\"",
                sub_select.formula, self.table.alias, where_clause, sub_select.name
            ));
        }
        out
    }
}

/// A full query: a root table plus joins, sub-queries, global computed
/// columns, query-global conditions and sorting.
#[derive(Debug, Clone)]
pub struct Query {
    pub table: QueryTable,
    /// Database schema the query renders against.
    pub schema: String,
    pub joins: Vec<Join>,
    pub sub_queries: Vec<SubQuery>,
    pub global_computed: Vec<Computed>,
    pub query_conditions: Compound,
    pub sorting: Vec<Sort>,
}

impl Query {
    pub fn new(kind: Arc<Kind>, schema: impl Into<String>) -> Query {
        let mut table = QueryTable::new(kind);
        table.alias = "k".to_string();
        Query {
            table,
            schema: schema.into(),
            joins: Vec::new(),
            sub_queries: Vec::new(),
            global_computed: Vec::new(),
            query_conditions: Compound::default(),
            sorting: Vec::new(),
        }
    }

    pub fn kind(&self) -> &Arc<Kind> {
        &self.table.kind
    }

    pub fn with_derived(&mut self, with_derived: bool) -> &mut Self {
        self.table.with_derived = with_derived;
        self
    }

    pub fn add_condition(&mut self, condition: Condition) -> &mut Self {
        self.table.add_condition(condition);
        self
    }

    pub fn add_filter(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.table.add_filter(field, value);
        self
    }

    pub fn add_aggregate(&mut self, aggregate: Aggregate) -> &mut Self {
        self.table.add_aggregate(aggregate);
        self
    }

    pub fn add_computed_column(&mut self, computed: Computed) -> &mut Self {
        self.table.add_computed_column(computed);
        self
    }

    pub fn has_parent(&mut self, parent: Option<&Key>) -> &mut Self {
        self.table.has_parent(parent);
        self
    }

    /// Adds a query-global condition, rendered against the root WITH table
    /// in the outer SELECT.
    pub fn add_query_condition(&mut self, condition: Condition) -> &mut Self {
        self.query_conditions.add(condition);
        self
    }

    pub fn add_join(&mut self, mut join: Join) -> &mut Self {
        if join.table.alias.is_empty() {
            join.table.alias = format!("j{}", self.joins.len());
        }
        self.joins.push(join);
        self
    }

    pub fn remove_join(&mut self, alias: &str) {
        self.joins.retain(|j| j.table.alias != alias);
    }

    /// Outer-joins the logical parent via `_parent[1]`.
    pub fn add_parent_join(&mut self, kind: Arc<Kind>) -> &mut Self {
        let mut join = Join::new(kind, "_parent");
        join.table.alias = "parent".to_string();
        join.table.with_derived = true;
        join.join_type = JoinType::Left;
        join.direction = JoinDirection::Referring;
        join.reference = true;
        self.add_join(join)
    }

    /// Outer-joins every reference column of the root kind and marks each
    /// join as a wiring point.
    pub fn add_reference_joins(&mut self) -> &mut Self {
        let columns: Vec<(String, Arc<Kind>)> = self
            .table
            .kind
            .columns
            .iter()
            .filter_map(|col| {
                col.converter
                    .reference_target()
                    .map(|target| (col.field_name.clone(), target))
            })
            .collect();
        for (field_name, target) in columns {
            let mut join = Join::new(target, &field_name);
            join.table.with_derived = true;
            join.join_type = JoinType::Left;
            join.direction = JoinDirection::Referring;
            join.reference = true;
            self.add_join(join);
        }
        self
    }

    pub fn add_sub_query(&mut self, mut sub_query: SubQuery) -> &mut Self {
        if sub_query.table.alias.is_empty() {
            sub_query.table.alias = format!("sq{}", self.sub_queries.len());
        }
        self.sub_queries.push(sub_query);
        self
    }

    pub fn add_global_computed_column(&mut self, computed: Computed) -> &mut Self {
        self.global_computed.push(computed);
        self
    }

    pub fn add_sort(&mut self, sort: Sort) -> &mut Self {
        self.sorting.push(sort);
        self
    }

    /// Shorthand for a `COUNT(*)` aggregate named `<Basename>Count`.
    pub fn add_count(&mut self) -> &mut Self {
        let name = format!("{}Count", self.table.kind.basename());
        self.add_aggregate(Aggregate {
            function: "COUNT".to_string(),
            column: "*".to_string(),
            name,
            default: None,
        })
    }

    /// The joins that take part in rendering and scanning.
    pub fn active_joins(&self) -> impl Iterator<Item = &Join> {
        self.joins.iter().filter(|j| !j.suppressed)
    }

    /// The table the results are grouped by, if any. At most one table per
    /// query may be grouped.
    pub fn grouped_by(&self) -> Option<&QueryTable> {
        if self.table.group_by {
            return Some(&self.table);
        }
        self.active_joins()
            .find(|j| j.table.group_by)
            .map(|j| &j.table)
    }

    pub fn is_grouped(&self) -> bool {
        self.grouped_by().is_some()
    }

    /// Tables whose aggregates are projected when the query is grouped.
    pub fn aggregated_tables(&self) -> Vec<&QueryTable> {
        if !self.is_grouped() {
            return Vec::new();
        }
        let mut tables = Vec::new();
        if !self.table.group_by && !self.table.aggregates.is_empty() {
            tables.push(&self.table);
        }
        for join in self.active_joins() {
            if !join.table.group_by && !join.table.aggregates.is_empty() {
                tables.push(&join.table);
            }
        }
        tables
    }

    pub fn condition_cx<'a>(&'a self, alias: Option<&'a str>, table: &'a str) -> ConditionCx<'a> {
        ConditionCx {
            schema: &self.schema,
            alias,
            table,
        }
    }

    /// The bound parameter list, in rendering order: root table conditions
    /// (repeated for each derived kind), each join's conditions likewise,
    /// sub-query conditions, then query-global conditions.
    pub fn values(&self) -> Vec<Value> {
        let mut acc = Vec::new();
        self.table.condition_values(&mut acc);
        for join in self.active_joins() {
            join.table.condition_values(&mut acc);
        }
        for sub_query in &self.sub_queries {
            sub_query.table.conditions.values(&mut acc);
        }
        self.query_conditions.values(&mut acc);
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMeta;
    use crate::kind::Persist;
    use crate::registry::kind_of;
    use crate::KindBuilder;

    #[derive(Default)]
    struct Item {
        meta: EntityMeta,
        label: String,
        count: i64,
    }

    crate::impl_entity!(Item { meta: meta });

    impl Persist for Item {
        fn kind_name() -> String {
            "qdemo.item".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field("Label", |e: &Item| &e.label, |e: &mut Item| &mut e.label);
            b.field("Count", |e: &Item| &e.count, |e: &mut Item| &mut e.count);
        }
    }

    #[test]
    fn join_and_sub_query_aliases() {
        let mut query = Query::new(kind_of::<Item>(), "grumble");
        assert_eq!(query.table.alias, "k");
        query.add_join(Join::new(kind_of::<Item>(), "Label"));
        query.add_join(Join::new(kind_of::<Item>(), "Count"));
        assert_eq!(query.joins[0].table.alias, "j0");
        assert_eq!(query.joins[1].table.alias, "j1");
        query.add_sub_query(SubQuery::new(kind_of::<Item>()));
        assert_eq!(query.sub_queries[0].table.alias, "sq0");
        query.remove_join("j0");
        assert_eq!(query.joins.len(), 1);
        assert_eq!(query.joins[0].table.alias, "j1");
    }

    #[test]
    fn unknown_filter_fields_are_skipped() {
        let mut query = Query::new(kind_of::<Item>(), "grumble");
        query.add_filter("Label", "a");
        query.add_filter("Bogus", 42);
        assert_eq!(query.table.conditions.size(), 1);
        assert_eq!(query.values().len(), 1);
    }

    #[test]
    fn count_shorthand() {
        let mut query = Query::new(kind_of::<Item>(), "grumble");
        query.add_count();
        assert_eq!(query.table.aggregates[0].name, "ItemCount");
        assert_eq!(query.table.aggregates[0].sql_text("k"), "COUNT(*) \"ItemCount\"");
    }

    #[test]
    #[should_panic(expected = "aggregates on a grouped")]
    fn aggregate_on_grouped_table_panics() {
        let mut table = QueryTable::new(kind_of::<Item>());
        table.group_by = true;
        table.add_aggregate(Aggregate {
            function: "SUM".to_string(),
            column: "Count".to_string(),
            name: "Total".to_string(),
            default: None,
        });
    }

    #[test]
    #[should_panic(expected = "no column with field name")]
    fn aggregate_on_unknown_field_panics() {
        let mut table = QueryTable::new(kind_of::<Item>());
        table.add_aggregate(Aggregate {
            function: "SUM".to_string(),
            column: "Nope".to_string(),
            name: "Total".to_string(),
            default: None,
        });
    }

    #[test]
    #[should_panic(expected = "invalid column")]
    fn join_on_unknown_field_panics_at_render() {
        let query = Query::new(kind_of::<Item>(), "grumble");
        let join = Join::new(kind_of::<Item>(), "Nope");
        join.join_clause(&query.table);
    }

    #[test]
    fn aggregate_defaults_render_with_coalesce() {
        let aggregate = Aggregate {
            function: "SUM".to_string(),
            column: "Count".to_string(),
            name: "Total".to_string(),
            default: Some("0".to_string()),
        };
        assert_eq!(
            aggregate.sql_text("j0"),
            "COALESCE(SUM(j0.\"Count\"), 0) \"Total\""
        );
    }

    #[test]
    fn params_bag() {
        let params = Params::from([("a", "1"), ("a", "2"), ("b", ""), ("_re", "true")]);
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get_all("a"), vec!["1", "2"]);
        assert_eq!(params.get("b"), None);
        assert!(params.truthy("_re"));
        assert!(!params.truthy("b"));
    }
}
