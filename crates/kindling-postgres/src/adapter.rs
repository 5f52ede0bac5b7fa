use crate::{AdapterConfig, Connection};

use kindling_core::{Error, Result, Value};

use tokio::sync::OnceCell;
use tracing::info;

const CONFIG_PATH: &str = "conf/database.conf";

static DEFAULT: OnceCell<Adapter> = OnceCell::const_new();

/// The PostgreSQL adapter: configuration plus database/schema lifecycle.
///
/// The process-wide default adapter loads `conf/database.conf` on first
/// acquisition and runs the wipe/init sequence exactly once. Managers get
/// clones of the configuration; connection and transaction state is never
/// shared.
#[derive(Debug, Clone)]
pub struct Adapter {
    pub config: AdapterConfig,
}

impl Adapter {
    /// Acquires the process-wide default adapter, initializing it on first
    /// use.
    pub async fn acquire() -> Result<Adapter> {
        let adapter = DEFAULT
            .get_or_try_init(|| async {
                let config = match tokio::fs::read_to_string(CONFIG_PATH).await {
                    Ok(text) => AdapterConfig::from_json(&text)?,
                    Err(_) => AdapterConfig::default(),
                };
                let adapter = Adapter { config };
                adapter.initialize().await?;
                Ok::<_, Error>(adapter)
            })
            .await?;
        Ok(adapter.clone())
    }

    /// Builds and initializes a dedicated adapter, bypassing the default
    /// singleton.
    pub async fn with_config(config: AdapterConfig) -> Result<Adapter> {
        let adapter = Adapter { config };
        adapter.initialize().await?;
        Ok(adapter)
    }

    pub fn schema(&self) -> &str {
        self.config.schema_name()
    }

    /// Opens a connection with the regular role.
    pub async fn connect(&self) -> Result<Connection> {
        Connection::open(self.config.pg_config(false, &self.config.database_name)).await
    }

    /// Opens a connection with the admin role.
    pub async fn connect_admin(&self) -> Result<Connection> {
        Connection::open(self.config.pg_config(true, &self.config.database_name)).await
    }

    /// Opens an admin connection to the maintenance database.
    async fn connect_maintenance(&self) -> Result<Connection> {
        Connection::open(self.config.pg_config(true, "postgres")).await
    }

    /// Ensures database, schema and the `"Reference"` composite type exist,
    /// honouring the wipe flags.
    async fn initialize(&self) -> Result<()> {
        let created = self.ensure_database().await?;
        self.ensure_schema(self.config.wipe_schema && !created)
            .await?;
        Ok(())
    }

    /// Drops and re-creates the schema, then re-runs the schema init
    /// script.
    pub async fn reset_schema(&self) -> Result<()> {
        self.ensure_schema(true).await
    }

    async fn ensure_database(&self) -> Result<bool> {
        let name = &self.config.database_name;
        let mut conn = self.connect_maintenance().await?;
        let mut create = false;
        if self.config.wipe_database && name != "postgres" {
            info!(database = %name, "dropping database");
            conn.batch(&format!("DROP DATABASE IF EXISTS \"{name}\""))
                .await?;
            create = true;
        } else {
            let row = conn
                .query_row(
                    "SELECT COUNT(*) FROM pg_catalog.pg_database WHERE datname = $1",
                    &[Value::Str(name.clone())],
                )
                .await?;
            create = matches!(row.and_then(|r| r.first().and_then(Value::as_i64)), Some(0));
        }
        if create {
            info!(database = %name, "creating database");
            conn.batch(&format!("CREATE DATABASE \"{name}\"")).await?;
            if !self.config.database_init.is_empty() {
                let mut admin = self.connect_admin().await?;
                run_script(&mut admin, &self.config.database_init).await?;
            }
        }
        Ok(create)
    }

    async fn ensure_schema(&self, drop_first: bool) -> Result<()> {
        if self.config.schema.is_empty() {
            return Ok(());
        }
        let schema = self.config.schema_name();
        let mut conn = self.connect_admin().await?;
        let mut create = drop_first;
        if drop_first {
            info!(%schema, "dropping schema");
            conn.batch(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
                .await?;
        } else {
            let row = conn
                .query_row(
                    "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = $1",
                    &[Value::Str(schema.to_string())],
                )
                .await?;
            create = matches!(row.and_then(|r| r.first().and_then(Value::as_i64)), Some(0));
        }
        if create {
            info!(%schema, "creating schema");
            conn.batch(&format!(
                "CREATE SCHEMA \"{schema}\" AUTHORIZATION \"{}\"",
                self.config.username
            ))
            .await?;
            if !self.config.schema_init.is_empty() {
                run_script(&mut conn, &self.config.schema_init).await?;
            }
        }
        self.ensure_reference_type(&mut conn).await
    }

    /// The composite type backing `_parent` chains and reference columns.
    async fn ensure_reference_type(&self, conn: &mut Connection) -> Result<()> {
        let schema = self.config.schema_name();
        let row = conn
            .query_row(
                "SELECT COUNT(*) FROM pg_catalog.pg_type t \
                 JOIN pg_catalog.pg_namespace n ON t.typnamespace = n.oid \
                 WHERE n.nspname = $1 AND t.typname = 'Reference'",
                &[Value::Str(schema.to_string())],
            )
            .await?;
        if matches!(row.and_then(|r| r.first().and_then(Value::as_i64)), Some(0)) {
            info!(%schema, "creating Reference type");
            conn.batch(&format!(
                "CREATE TYPE \"{schema}\".\"Reference\" AS (\"kind\" text, \"id\" bigint)"
            ))
            .await?;
        }
        Ok(())
    }
}

async fn run_script(conn: &mut Connection, path: &str) -> Result<()> {
    let sql = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::configuration(format!("cannot read init script '{path}': {e}")))?;
    if sql.trim().is_empty() {
        return Ok(());
    }
    info!(%path, "running init script");
    conn.batch(&sql).await
}
