#[macro_use]
mod fmt;
use fmt::ToSql;

mod ident;
use ident::Ident;

mod params;
pub use params::{count_placeholders, rewrite_placeholders, PLACEHOLDER};

mod table;
pub use table::{SqlColumn, SqlIndex, SqlTable};

mod ddl;
pub use ddl::{
    add_column_sql, create_column_index_sql, create_index_sql, create_table_sql,
    drop_column_index_sql, drop_column_sql, drop_index_sql, set_column_default_sql,
    set_column_nullable_sql,
};

mod select;
pub use select::render_query;

mod stmt;
pub use stmt::{delete_sql, insert_sql, update_sql};
