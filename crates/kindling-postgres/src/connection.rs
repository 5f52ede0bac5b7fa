use crate::{pg_type_for_value, row_to_values, PgValue};

use kindling_core::{Error, Result, Value};

use postgres_types::Type;
use std::collections::HashMap;
use tokio_postgres::{Client, Statement};
use tracing::{debug, warn};

/// Evidence of an entered transaction scope. Only the outermost scope
/// issues BEGIN/COMMIT/ROLLBACK; nested scopes run inline.
#[derive(Debug)]
#[must_use = "a transaction scope must be finished"]
pub struct TxGuard {
    outermost: bool,
}

/// One database connection: a client, its prepared-statement cache and the
/// structural transaction depth.
pub struct Connection {
    client: Client,
    cache: StatementCache,
    tx_depth: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tx_depth", &self.tx_depth)
            .finish()
    }
}

impl Connection {
    /// Connects and spawns the background task that drives the socket.
    pub(crate) async fn open(config: tokio_postgres::Config) -> Result<Connection> {
        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::sql(format!("connection failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("connection error: {e}");
            }
        });
        Ok(Connection {
            client,
            cache: StatementCache::new(),
            tx_depth: 0,
        })
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.client
            .batch_execute("SELECT 1")
            .await
            .map_err(|e| Error::sql(format!("ping failed: {e}")))
    }

    async fn prepare(&mut self, sql: &str, params: &[Value]) -> Result<(Statement, Vec<PgValue>)> {
        let types: Vec<Type> = params.iter().map(pg_type_for_value).collect();
        let statement = self
            .cache
            .prepare_typed(&mut self.client, sql, &types)
            .await
            .map_err(|e| Error::sql(format!("prepare failed: {e}")))?;
        let bound = params
            .iter()
            .map(PgValue::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((statement, bound))
    }

    /// Executes a statement, returning the affected-row count.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        debug!(params = params.len(), %sql, "execute");
        let (statement, bound) = self.prepare(sql, params).await?;
        let args: Vec<&(dyn postgres_types::ToSql + Sync)> = bound
            .iter()
            .map(|p| p as &(dyn postgres_types::ToSql + Sync))
            .collect();
        self.client
            .execute(&statement, &args)
            .await
            .map_err(|e| Error::sql(e.to_string()))
    }

    /// Runs a query, materializing every row into core values.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        debug!(params = params.len(), %sql, "query");
        let (statement, bound) = self.prepare(sql, params).await?;
        let args: Vec<&(dyn postgres_types::ToSql + Sync)> = bound
            .iter()
            .map(|p| p as &(dyn postgres_types::ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(&statement, &args)
            .await
            .map_err(|e| Error::sql(e.to_string()))?;
        rows.iter().map(row_to_values).collect()
    }

    /// Runs a query expected to return at most one row.
    pub async fn query_row(&mut self, sql: &str, params: &[Value]) -> Result<Option<Vec<Value>>> {
        let mut rows = self.query(sql, params).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(rows.swap_remove(0))),
            n => Err(Error::multiple_rows(format!(
                "query returned {n} rows where at most one was expected"
            ))),
        }
    }

    /// Executes raw SQL (scripts, DDL) outside the statement cache.
    pub async fn batch(&mut self, sql: &str) -> Result<()> {
        debug!(%sql, "batch");
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| Error::sql(e.to_string()))
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_depth > 0
    }

    /// Enters a transaction scope. The outermost scope sends BEGIN; nested
    /// scopes just deepen the counter and run inline.
    pub async fn begin(&mut self) -> Result<TxGuard> {
        if self.tx_depth == 0 {
            self.batch("BEGIN").await?;
        }
        self.tx_depth += 1;
        Ok(TxGuard {
            outermost: self.tx_depth == 1,
        })
    }

    pub async fn commit(&mut self, guard: TxGuard) -> Result<()> {
        self.tx_depth = self.tx_depth.saturating_sub(1);
        if guard.outermost {
            self.batch("COMMIT").await?;
        }
        Ok(())
    }

    pub async fn rollback(&mut self, guard: TxGuard) -> Result<()> {
        self.tx_depth = self.tx_depth.saturating_sub(1);
        if guard.outermost {
            self.batch("ROLLBACK").await?;
        }
        Ok(())
    }

    /// Commits on success, rolls back on failure, and hands the result
    /// back. A failed rollback is logged, not surfaced, so the original
    /// error wins.
    pub async fn finish<T>(&mut self, guard: TxGuard, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit(guard).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(guard).await {
                    warn!("error rolling back transaction: {rollback_err}");
                }
                Err(err)
            }
        }
    }
}

/// Prepared statements keyed on SQL text and declared parameter types.
struct StatementCache {
    map: HashMap<(String, Vec<Type>), Statement>,
}

impl StatementCache {
    fn new() -> StatementCache {
        StatementCache {
            map: HashMap::new(),
        }
    }

    async fn prepare_typed(
        &mut self,
        client: &mut Client,
        sql: &str,
        types: &[Type],
    ) -> std::result::Result<Statement, tokio_postgres::Error> {
        let key = (sql.to_string(), types.to_vec());
        if let Some(statement) = self.map.get(&key) {
            return Ok(statement.clone());
        }
        let statement = client.prepare_typed(sql, types).await?;
        self.map.insert(key, statement.clone());
        Ok(statement)
    }
}
