//! PostgreSQL backend
//!
//! A small bounded pool of `tokio_postgres` clients and the transaction
//! handle the executors run against. Clients are connected lazily and handed
//! back to the pool when their transaction finishes.

mod catalog;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{COLUMN_CATALOG, TABLE_CATALOG};
use crate::errors::{CoreError, Result};
use crate::session::{Database, RawStatement, SqlSession, TransactionControl};
use crate::value::SqlValue;

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgConfig {
    /// libpq-style connection string or `postgres://` URL
    pub url: String,
    /// Maximum number of open connections
    pub max_connections: usize,
    /// Maximum time to establish a new connection
    pub connect_timeout: Duration,
    /// Maximum time to wait for a free connection
    pub acquire_timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            url: "host=localhost user=postgres dbname=database_services".to_string(),
            max_connections: 16,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// DDL for the two catalog tables. Safe to run on every start.
pub fn catalog_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {tables} (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            table_name VARCHAR(255) NOT NULL UNIQUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS {columns} (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            table_id UUID NOT NULL REFERENCES {tables}(id) ON DELETE CASCADE,
            column_name VARCHAR(255) NOT NULL,
            data_type VARCHAR(255) NOT NULL,
            is_primary BOOLEAN NOT NULL DEFAULT FALSE,
            is_nullable BOOLEAN NOT NULL DEFAULT TRUE,
            is_unique BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (table_id, column_name)
        );",
        tables = TABLE_CATALOG,
        columns = COLUMN_CATALOG
    )
}

struct PoolInner {
    config: PgConfig,
    idle: Mutex<Vec<Client>>,
    semaphore: Arc<Semaphore>,
}

/// Bounded connection pool
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    pub fn new(config: PgConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(Vec::new()),
                semaphore,
            }),
        }
    }

    pub fn config(&self) -> &PgConfig {
        &self.inner.config
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().len()
    }

    async fn connect(&self) -> Result<Client> {
        let config = &self.inner.config;
        let (client, connection) = timeout(config.connect_timeout, tokio_postgres::connect(&config.url, NoTls))
            .await
            .map_err(|_| CoreError::Timeout("connecting to PostgreSQL".to_string()))??;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        debug!("Opened PostgreSQL connection");
        Ok(client)
    }

    /// Acquire a connection, reusing an idle one when possible
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<PooledClient> {
        let permit = match timeout(
            self.inner.config.acquire_timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(CoreError::PoolExhausted),
        };

        let reused = {
            let mut idle = self.inner.idle.lock();
            let mut found = None;
            while let Some(client) = idle.pop() {
                if !client.is_closed() {
                    found = Some(client);
                    break;
                }
            }
            found
        };

        let client = match reused {
            Some(client) => client,
            None => self.connect().await?,
        };

        Ok(PooledClient {
            pool: self.inner.clone(),
            client: Some(client),
            discard: false,
            _permit: permit,
        })
    }

    /// Creates the catalog tables if they are missing
    pub async fn bootstrap_catalog(&self) -> Result<()> {
        let client = self.acquire().await?;
        client.get()?.batch_execute(&catalog_ddl()).await?;
        info!("Catalog tables ready");
        Ok(())
    }
}

/// A client checked out of the pool. Returned on drop unless discarded.
pub struct PooledClient {
    pool: Arc<PoolInner>,
    client: Option<Client>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn get(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| CoreError::Database("connection already released".to_string()))
    }

    /// Drops the connection instead of returning it.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !self.discard && !client.is_closed() {
                self.pool.idle.lock().push(client);
            }
        }
    }
}

#[async_trait]
impl Database for PgPool {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction> {
        let client = self.acquire().await?;
        client.get()?.batch_execute("BEGIN").await?;
        Ok(PgTransaction { client, open: true })
    }

    async fn ping(&self) -> Result<()> {
        let client = self.acquire().await?;
        client.get()?.simple_query("SELECT 1").await?;
        Ok(())
    }
}

/// An open transaction on one pooled connection
pub struct PgTransaction {
    client: PooledClient,
    open: bool,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client> {
        self.client.get()
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        self.client()?.batch_execute(statement).await?;
        self.open = false;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.open {
            // The server aborts the transaction when the connection closes.
            warn!("Transaction dropped while open, discarding its connection");
            self.client.discard();
        }
    }
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl SqlSession for PgTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        Ok(self.client()?.execute(sql, &bind(params)).await?)
    }

    async fn fetch_rows(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Value>> {
        let rows = self.client()?.query(sql, &bind(params)).await?;
        rows.iter()
            .map(|row| row.try_get::<_, Value>("row").map_err(CoreError::from))
            .collect()
    }

    async fn fetch_exists(&mut self, sql: &str, params: &[SqlValue]) -> Result<bool> {
        let row = self.client()?.query_one(sql, &bind(params)).await?;
        Ok(row.try_get("exists")?)
    }

    async fn run_raw(&mut self, sql: &str) -> Result<Vec<RawStatement>> {
        let messages = self.client()?.simple_query(sql).await?;

        let mut statements = Vec::new();
        let mut rows = Vec::new();
        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) => {
                    let mut record = Map::new();
                    for (index, column) in row.columns().iter().enumerate() {
                        let value = match row.try_get(index)? {
                            Some(text) => Value::String(text.to_string()),
                            None => Value::Null,
                        };
                        record.insert(column.name().to_string(), value);
                    }
                    rows.push(record);
                }
                SimpleQueryMessage::CommandComplete(affected) => {
                    if rows.is_empty() {
                        statements.push(RawStatement::Affected(affected));
                    } else {
                        statements.push(RawStatement::Rows(std::mem::take(&mut rows)));
                    }
                }
                _ => {}
            }
        }
        Ok(statements)
    }
}

#[async_trait]
impl TransactionControl for PgTransaction {
    async fn commit(mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}
