use crate::fmt::Formatter;
use crate::fmt::ToSql;
use crate::ident::Ident;

use kindling_core::Kind;

/// `INSERT` for one entity: the parent chain plus every non-formula
/// column, returning the assigned id.
pub fn insert_sql(kind: &Kind, schema: &str) -> String {
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "INSERT INTO " kind.qualified_table(schema) " (" Ident("_parent"));
    for column in kind.columns.iter().filter(|c| c.formula.is_none()) {
        fmt!(&mut f, ", " Ident(&column.column_name));
    }
    let reference_array = format!("__count__::\"{schema}\".\"Reference\"[]");
    fmt!(&mut f, ") VALUES (" reference_array);
    for column in kind.columns.iter().filter(|c| c.formula.is_none()) {
        fmt!(&mut f, ", " column.converter.sql_text_out(column, schema));
    }
    fmt!(&mut f, ") RETURNING " Ident("_id"));
    f.dst
}

/// `UPDATE` for one populated entity, keyed on `"_id"`.
pub fn update_sql(kind: &Kind, schema: &str) -> String {
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "UPDATE " kind.qualified_table(schema) " SET ");
    let mut first = true;
    for column in kind.columns.iter().filter(|c| c.formula.is_none()) {
        if !first {
            fmt!(&mut f, ", ");
        }
        fmt!(&mut f, Ident(&column.column_name) " = "
            column.converter.sql_text_out(column, schema));
        first = false;
    }
    fmt!(&mut f, " WHERE " Ident("_id") " = __count__");
    f.dst
}

/// `DELETE` by id.
pub fn delete_sql(kind: &Kind, schema: &str) -> String {
    let mut f = Formatter { dst: String::new() };
    fmt!(&mut f, "DELETE FROM " kind.qualified_table(schema) " WHERE " Ident("_id") " = $1");
    f.dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{count_placeholders, rewrite_placeholders};

    use kindling_core::{kind_of, EntityMeta, KindBuilder, Persist, Ref};

    #[derive(Default)]
    struct Customer {
        meta: EntityMeta,
        name: String,
    }

    kindling_core::impl_entity!(Customer { meta: meta });

    impl Persist for Customer {
        fn kind_name() -> String {
            "demo.customer".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field(
                "Name",
                |e: &Customer| &e.name,
                |e: &mut Customer| &mut e.name,
            );
        }
    }

    #[derive(Default)]
    struct Order {
        meta: EntityMeta,
        total: f64,
        gross: f64,
        customer: Ref<Customer>,
    }

    kindling_core::impl_entity!(Order { meta: meta });

    impl Persist for Order {
        fn kind_name() -> String {
            "demo.order".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field("Total", |e: &Order| &e.total, |e: &mut Order| &mut e.total);
            b.field("Gross", |e: &Order| &e.gross, |e: &mut Order| &mut e.gross)
                .formula("\"Total\" * 1.21");
            b.reference(
                "Customer",
                |e: &Order| &e.customer,
                |e: &mut Order| &mut e.customer,
            );
        }
    }

    #[test]
    fn insert_shape() {
        let kind = kind_of::<Order>();
        let sql = insert_sql(&kind, "grumble");
        // Formula columns are never written.
        assert_eq!(
            sql,
            "INSERT INTO \"grumble\".\"order\" (\"_parent\", \"Total\", \"Customer\") \
             VALUES (__count__::\"grumble\".\"Reference\"[], __count__, \
             __count__::\"grumble\".\"Reference\") RETURNING \"_id\""
        );
        assert_eq!(count_placeholders(&sql), 3);
        assert_eq!(
            rewrite_placeholders(&sql),
            "INSERT INTO \"grumble\".\"order\" (\"_parent\", \"Total\", \"Customer\") \
             VALUES ($1::\"grumble\".\"Reference\"[], $2, \
             $3::\"grumble\".\"Reference\") RETURNING \"_id\""
        );
    }

    #[test]
    fn update_shape() {
        let kind = kind_of::<Order>();
        let sql = rewrite_placeholders(&update_sql(&kind, "grumble"));
        assert_eq!(
            sql,
            "UPDATE \"grumble\".\"order\" SET \"Total\" = $1, \
             \"Customer\" = $2::\"grumble\".\"Reference\" WHERE \"_id\" = $3"
        );
    }

    #[test]
    fn delete_shape() {
        let kind = kind_of::<Order>();
        assert_eq!(
            delete_sql(&kind, "grumble"),
            "DELETE FROM \"grumble\".\"order\" WHERE \"_id\" = $1"
        );
    }
}
