//! Backend seams
//!
//! The executors speak to the database only through these traits. A batch
//! opens one [`Database::Tx`], runs every operation against it as
//! `&mut dyn Transaction`, and either commits it or rolls it back.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use crate::catalog::CatalogStore;
use crate::errors::Result;
use crate::value::SqlValue;

/// Outcome of one statement sent through the raw gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStatement {
    Rows(Vec<Map<String, Value>>),
    Affected(u64),
}

/// Parameterized statement execution inside an open transaction.
#[async_trait]
pub trait SqlSession: Send {
    /// Runs a statement and returns the number of rows it touched.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Runs a statement whose single column, `row`, holds a JSON object per row.
    async fn fetch_rows(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Value>>;

    /// Runs a statement that yields a single boolean column named `exists`.
    async fn fetch_exists(&mut self, sql: &str, params: &[SqlValue]) -> Result<bool>;

    /// Runs caller-supplied SQL through the simple query protocol.
    async fn run_raw(&mut self, sql: &str) -> Result<Vec<RawStatement>>;
}

/// Everything an operation handler may touch.
pub trait Transaction: SqlSession + CatalogStore {}

impl<T: SqlSession + CatalogStore> Transaction for T {}

#[async_trait]
pub trait TransactionControl: Transaction + Sized {
    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

#[async_trait]
pub trait Database: Send + Sync {
    type Tx: TransactionControl;

    async fn begin(&self) -> Result<Self::Tx>;

    /// Round-trips a trivial statement; used by readiness probes.
    async fn ping(&self) -> Result<()>;
}

/// Notices produced while a batch runs. They are logged once the batch
/// commits and dropped with it on rollback.
#[derive(Debug, Default)]
pub struct PostCommit {
    notices: Vec<String>,
}

impl PostCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notice: impl Into<String>) {
        self.notices.push(notice.into());
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    pub fn flush(self) {
        for notice in self.notices {
            info!("{}", notice);
        }
    }
}
