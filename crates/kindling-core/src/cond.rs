use crate::entity::Handle;
use crate::{Key, Value};

/// Context a condition renders against: the database schema (for composite
/// type casts) and the optional table alias to prefix column references
/// with.
#[derive(Debug, Clone, Copy)]
pub struct ConditionCx<'a> {
    pub schema: &'a str,
    pub alias: Option<&'a str>,
    /// Qualified table name, for conditions that embed a subselect.
    pub table: &'a str,
}

impl ConditionCx<'_> {
    fn prefix(&self) -> String {
        match self.alias {
            Some(alias) => format!("{alias}."),
            None => String::new(),
        }
    }

    fn reference_type(&self) -> String {
        format!("\"{}\".\"Reference\"", self.schema)
    }
}

/// A composable predicate. Rendering emits `__count__` sentinels for bound
/// parameters; [`Condition::values`] extends the accumulator with exactly
/// as many values, in the same order.
#[derive(Debug, Clone)]
pub enum Condition {
    /// `"_id" = ?`
    HasId(i64),
    /// Immediate parent is the given key; the zero key matches roots.
    HasParent(Key),
    /// The given key appears anywhere in the parent chain. The zero key
    /// matches everything.
    HasAncestor(Key),
    /// No parent at all.
    IsRoot,
    /// Column equals the table-wide maximum of a column.
    HasMaxValue { column: String },
    /// Column equals the table-wide minimum of a column.
    HasMinValue { column: String },
    /// Reference column matches a set of keys; see [`Condition::references`].
    References {
        column: String,
        refs: Vec<Key>,
        has_zero: bool,
        invert: bool,
    },
    /// `<expression> <operator> ?`, with `__alias__.` substituted.
    Predicate {
        expression: String,
        operator: String,
        value: Value,
    },
    /// Raw SQL with bound values; `__alias__.` is substituted.
    Simple { sql: String, values: Vec<Value> },
    Compound(Compound),
}

impl Condition {
    /// Builds an equality predicate on a quoted column.
    pub fn eq(column_name: &str, value: impl Into<Value>) -> Condition {
        Condition::Predicate {
            expression: format!("__alias__.\"{column_name}\""),
            operator: "=".to_string(),
            value: value.into(),
        }
    }

    /// Normalizes a reference set: zero keys are folded into a has-zero
    /// marker, empty inputs mean "references nothing".
    pub fn references(column: &str, refs: impl Into<RefArg>, invert: bool) -> Condition {
        let mut keys = Vec::new();
        let mut has_zero = false;
        match refs.into() {
            RefArg::Null => has_zero = true,
            RefArg::One(key) => {
                if key.is_zero() {
                    has_zero = true;
                } else {
                    keys.push(key);
                }
            }
            RefArg::Many(list) => {
                for key in list {
                    if key.is_zero() {
                        has_zero = true;
                    } else {
                        keys.push(key);
                    }
                }
            }
        }
        Condition::References {
            column: column.to_string(),
            refs: keys,
            has_zero,
            invert,
        }
    }

    pub fn where_clause(&self, cx: &ConditionCx<'_>) -> String {
        let prefix = cx.prefix();
        match self {
            Condition::HasId(_) => format!("{prefix}\"_id\" = __count__"),
            Condition::HasParent(parent) => {
                if parent.is_zero() {
                    format!("cardinality({prefix}\"_parent\") = 0")
                } else {
                    format!(
                        "{prefix}\"_parent\"[1] = __count__::{}",
                        cx.reference_type()
                    )
                }
            }
            Condition::HasAncestor(ancestor) => {
                if ancestor.is_zero() {
                    "1 = 1".to_string()
                } else {
                    format!(
                        "__count__::{} = ANY({prefix}\"_parent\")",
                        cx.reference_type()
                    )
                }
            }
            Condition::IsRoot => format!("cardinality({prefix}\"_parent\") = 0"),
            Condition::HasMaxValue { column } => format!(
                "{prefix}\"{column}\" = (SELECT MAX(\"{column}\") FROM {})",
                cx.table
            ),
            Condition::HasMinValue { column } => format!(
                "{prefix}\"{column}\" = (SELECT MIN(\"{column}\") FROM {})",
                cx.table
            ),
            Condition::References {
                column,
                refs,
                has_zero,
                invert,
            } => {
                let col = format!("{prefix}\"{column}\"");
                if refs.is_empty() {
                    return if *invert {
                        format!("{col} IS NOT NULL")
                    } else {
                        format!("{col} IS NULL")
                    };
                }
                let params = refs
                    .iter()
                    .map(|_| format!("__count__::{}", cx.reference_type()))
                    .collect::<Vec<_>>()
                    .join(", ");
                match (has_zero, invert) {
                    (false, false) => format!("{col} IN ( {params} )"),
                    (false, true) => format!("({col} NOT IN ( {params} ) OR {col} IS NULL)"),
                    (true, false) => format!("({col} IN ( {params} ) OR {col} IS NULL)"),
                    (true, true) => format!("({col} NOT IN ( {params} ) AND {col} IS NOT NULL)"),
                }
            }
            Condition::Predicate {
                expression,
                operator,
                ..
            } => format!(
                "{} {operator} __count__",
                expression.replace("__alias__.", &prefix)
            ),
            Condition::Simple { sql, .. } => sql.replace("__alias__.", &prefix),
            Condition::Compound(compound) => compound.where_clause(cx),
        }
    }

    pub fn values(&self, acc: &mut Vec<Value>) {
        match self {
            Condition::HasId(id) => acc.push(Value::I64(*id)),
            Condition::HasParent(parent) => {
                if !parent.is_zero() {
                    acc.push(Value::Str(parent.reference_literal()));
                }
            }
            Condition::HasAncestor(ancestor) => {
                if !ancestor.is_zero() {
                    acc.push(Value::Str(ancestor.reference_literal()));
                }
            }
            Condition::IsRoot
            | Condition::HasMaxValue { .. }
            | Condition::HasMinValue { .. } => {}
            Condition::References { refs, .. } => {
                for key in refs {
                    acc.push(Value::Str(key.reference_literal()));
                }
            }
            Condition::Predicate { value, .. } => acc.push(value.clone()),
            Condition::Simple { values, .. } => acc.extend(values.iter().cloned()),
            Condition::Compound(compound) => compound.values(acc),
        }
    }
}

/// Sub-conditions joined with `AND` (the default) or `OR`.
#[derive(Debug, Clone, Default)]
pub struct Compound {
    pub conditions: Vec<Condition>,
    pub operand: Option<String>,
}

impl Compound {
    pub fn or() -> Compound {
        Compound {
            conditions: Vec::new(),
            operand: Some("OR".to_string()),
        }
    }

    pub fn add(&mut self, condition: Condition) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    pub fn size(&self) -> usize {
        self.conditions.len()
    }

    pub fn where_clause(&self, cx: &ConditionCx<'_>) -> String {
        let op = self.operand.as_deref().unwrap_or("AND");
        self.conditions
            .iter()
            .map(|c| format!("({})", c.where_clause(cx)))
            .collect::<Vec<_>>()
            .join(&format!(" {op} "))
    }

    pub fn values(&self, acc: &mut Vec<Value>) {
        for condition in &self.conditions {
            condition.values(acc);
        }
    }
}

/// Accepted inputs for a [`Condition::references`] set.
pub enum RefArg {
    Null,
    One(Key),
    Many(Vec<Key>),
}

impl From<Key> for RefArg {
    fn from(key: Key) -> RefArg {
        RefArg::One(key)
    }
}

impl From<&Key> for RefArg {
    fn from(key: &Key) -> RefArg {
        RefArg::One(key.clone())
    }
}

impl From<Option<Key>> for RefArg {
    fn from(key: Option<Key>) -> RefArg {
        match key {
            Some(key) => RefArg::One(key),
            None => RefArg::Null,
        }
    }
}

impl From<Vec<Key>> for RefArg {
    fn from(keys: Vec<Key>) -> RefArg {
        RefArg::Many(keys)
    }
}

impl From<Vec<Option<Key>>> for RefArg {
    fn from(keys: Vec<Option<Key>>) -> RefArg {
        RefArg::Many(
            keys.into_iter()
                .map(|k| k.unwrap_or_else(Key::zero))
                .collect(),
        )
    }
}

impl From<&Handle> for RefArg {
    fn from(handle: &Handle) -> RefArg {
        RefArg::One(handle.borrow().meta().key().clone())
    }
}

impl From<&[Handle]> for RefArg {
    fn from(handles: &[Handle]) -> RefArg {
        RefArg::Many(
            handles
                .iter()
                .map(|h| h.borrow().meta().key().clone())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CX: ConditionCx<'_> = ConditionCx {
        schema: "grumble",
        alias: Some("k"),
        table: "\"grumble\".\"product\"",
    };

    const BARE: ConditionCx<'_> = ConditionCx {
        schema: "grumble",
        alias: None,
        table: "\"grumble\".\"product\"",
    };

    fn values_of(cond: &Condition) -> Vec<Value> {
        let mut acc = Vec::new();
        cond.values(&mut acc);
        acc
    }

    #[test]
    fn has_id() {
        let cond = Condition::HasId(42);
        assert_eq!(cond.where_clause(&CX), "k.\"_id\" = __count__");
        assert_eq!(cond.where_clause(&BARE), "\"_id\" = __count__");
        assert_eq!(values_of(&cond), vec![Value::I64(42)]);
    }

    #[test]
    fn has_parent() {
        let zero = Condition::HasParent(Key::zero());
        assert_eq!(zero.where_clause(&CX), "cardinality(k.\"_parent\") = 0");
        assert!(values_of(&zero).is_empty());

        let parent = Key::new(&Key::zero(), "dept", 7);
        let cond = Condition::HasParent(parent);
        assert_eq!(
            cond.where_clause(&CX),
            "k.\"_parent\"[1] = __count__::\"grumble\".\"Reference\""
        );
        assert_eq!(values_of(&cond), vec![Value::Str("(dept,7)".into())]);
    }

    #[test]
    fn has_ancestor() {
        let cond = Condition::HasAncestor(Key::new(&Key::zero(), "dept", 7));
        assert_eq!(
            cond.where_clause(&CX),
            "__count__::\"grumble\".\"Reference\" = ANY(k.\"_parent\")"
        );
        assert_eq!(values_of(&cond).len(), 1);
        let zero = Condition::HasAncestor(Key::zero());
        assert_eq!(zero.where_clause(&CX), "1 = 1");
        assert!(values_of(&zero).is_empty());
    }

    #[test]
    fn references_matrix() {
        let key = Key::new(&Key::zero(), "product", 3);

        let null = Condition::references("Product", RefArg::Null, false);
        assert_eq!(null.where_clause(&CX), "k.\"Product\" IS NULL");
        assert!(values_of(&null).is_empty());

        let null_inv = Condition::references("Product", RefArg::Null, true);
        assert_eq!(null_inv.where_clause(&CX), "k.\"Product\" IS NOT NULL");

        let one = Condition::references("Product", key.clone(), false);
        assert_eq!(
            one.where_clause(&CX),
            "k.\"Product\" IN ( __count__::\"grumble\".\"Reference\" )"
        );
        assert_eq!(values_of(&one), vec![Value::Str("(product,3)".into())]);

        let inv = Condition::references("Product", key.clone(), true);
        assert_eq!(
            inv.where_clause(&CX),
            "(k.\"Product\" NOT IN ( __count__::\"grumble\".\"Reference\" ) OR k.\"Product\" IS NULL)"
        );

        let mixed = Condition::references(
            "Product",
            vec![key.clone(), Key::zero()],
            false,
        );
        assert_eq!(
            mixed.where_clause(&CX),
            "(k.\"Product\" IN ( __count__::\"grumble\".\"Reference\" ) OR k.\"Product\" IS NULL)"
        );

        let mixed_inv = Condition::references("Product", vec![key, Key::zero()], true);
        assert_eq!(
            mixed_inv.where_clause(&CX),
            "(k.\"Product\" NOT IN ( __count__::\"grumble\".\"Reference\" ) AND k.\"Product\" IS NOT NULL)"
        );

        // All-zero input folds to the null forms.
        let zeros = Condition::references("Product", vec![Key::zero()], false);
        assert_eq!(zeros.where_clause(&CX), "k.\"Product\" IS NULL");
    }

    #[test]
    fn min_max_subselects() {
        let max = Condition::HasMaxValue {
            column: "Price".to_string(),
        };
        assert_eq!(
            max.where_clause(&CX),
            "k.\"Price\" = (SELECT MAX(\"Price\") FROM \"grumble\".\"product\")"
        );
        assert!(values_of(&max).is_empty());
        let min = Condition::HasMinValue {
            column: "Price".to_string(),
        };
        assert_eq!(
            min.where_clause(&BARE),
            "\"Price\" = (SELECT MIN(\"Price\") FROM \"grumble\".\"product\")"
        );
    }

    #[test]
    fn simple_passthrough() {
        let cond = Condition::Simple {
            sql: "__alias__.\"Price\" BETWEEN __count__ AND __count__".to_string(),
            values: vec![Value::F64(1.0), Value::F64(2.0)],
        };
        assert_eq!(
            cond.where_clause(&CX),
            "k.\"Price\" BETWEEN __count__ AND __count__"
        );
        assert_eq!(values_of(&cond).len(), 2);
    }

    #[test]
    fn predicate_substitutes_alias() {
        let cond = Condition::eq("Category", "Fruit");
        assert_eq!(cond.where_clause(&CX), "k.\"Category\" = __count__");
        assert_eq!(cond.where_clause(&BARE), "\"Category\" = __count__");
        assert_eq!(values_of(&cond), vec![Value::Str("Fruit".into())]);
    }

    #[test]
    fn compound_joins() {
        let mut compound = Compound::default();
        compound.add(Condition::HasId(1));
        compound.add(Condition::IsRoot);
        assert_eq!(
            compound.where_clause(&CX),
            "(k.\"_id\" = __count__) AND (cardinality(k.\"_parent\") = 0)"
        );
        let mut or = Compound::or();
        or.add(Condition::HasId(1));
        or.add(Condition::HasId(2));
        assert_eq!(
            or.where_clause(&BARE),
            "(\"_id\" = __count__) OR (\"_id\" = __count__)"
        );
        let mut acc = Vec::new();
        or.values(&mut acc);
        assert_eq!(acc.len(), 2);
    }
}
