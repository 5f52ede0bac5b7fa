mod adapter;
pub use adapter::Adapter;

mod config;
pub use config::AdapterConfig;

mod connection;
pub use connection::{Connection, TxGuard};

mod reconcile;
pub use reconcile::{desired_table, reconcile_kind, sync_table, table_exists};

mod value;
pub(crate) use value::{pg_type_for_value, row_to_values, PgValue};
