use serde::Serialize;
use tracing::{error, info, instrument};

use crate::catalog::{ColumnSchema, TableSchema};
use crate::ddl::{self, AppliedDdl};
use crate::dml::{self, DmlOutcome};
use crate::errors::Result;
use crate::operation::{DdlOperation, DmlOperation};
use crate::query::{self, RawQueryResult};
use crate::session::{Database, PostCommit, SqlSession, Transaction, TransactionControl};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DdlReport {
    pub applied: Vec<AppliedDdl>,
}

/// Runs operation batches, one database transaction per batch.
pub struct Engine<D: Database> {
    database: D,
}

impl<D: Database> Engine<D> {
    pub fn new(database: D) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &D {
        &self.database
    }

    /// Applies DDL operations in order. Either every operation lands or none does.
    #[instrument(skip(self, operations), fields(operations = operations.len()))]
    pub async fn execute_ddl(&self, operations: &[DdlOperation]) -> Result<DdlReport> {
        let mut tx = self.database.begin().await?;
        let mut notices = PostCommit::new();
        let outcome = run_ddl(&mut tx, operations, &mut notices).await;
        let applied = settle(tx, outcome, notices).await?;
        info!(operations = applied.len(), "DDL batch committed");
        Ok(DdlReport { applied })
    }

    /// Applies DML operations in order, returning one outcome per operation.
    #[instrument(skip(self, operations), fields(operations = operations.len()))]
    pub async fn execute_dml(&self, operations: &[DmlOperation]) -> Result<Vec<DmlOutcome>> {
        let mut tx = self.database.begin().await?;
        let mut notices = PostCommit::new();
        let outcome = run_dml(&mut tx, operations, &mut notices).await;
        let outcomes = settle(tx, outcome, notices).await?;
        info!(operations = outcomes.len(), "DML batch committed");
        Ok(outcomes)
    }

    /// Runs caller-supplied SQL through the denylist and then in its own transaction.
    #[instrument(skip(self, sql))]
    pub async fn execute_query(&self, sql: &str) -> Result<RawQueryResult> {
        query::check_raw_query(sql)?;
        let mut tx = self.database.begin().await?;
        let outcome = tx.run_raw(sql).await;
        let statements = settle(tx, outcome, PostCommit::new()).await?;
        Ok(query::collect(sql, statements))
    }

    /// Every registered table with its columns.
    pub async fn schemas(&self) -> Result<Vec<TableSchema>> {
        let mut tx = self.database.begin().await?;
        let outcome = list_schemas(&mut tx).await;
        settle(tx, outcome, PostCommit::new()).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.database.ping().await
    }
}

async fn run_ddl(
    tx: &mut dyn Transaction,
    operations: &[DdlOperation],
    notices: &mut PostCommit,
) -> Result<Vec<AppliedDdl>> {
    let mut applied = Vec::with_capacity(operations.len());
    for operation in operations {
        applied.push(ddl::apply(tx, operation, notices).await?);
    }
    Ok(applied)
}

async fn run_dml(
    tx: &mut dyn Transaction,
    operations: &[DmlOperation],
    notices: &mut PostCommit,
) -> Result<Vec<DmlOutcome>> {
    let mut outcomes = Vec::with_capacity(operations.len());
    for operation in operations {
        outcomes.push(dml::apply(tx, operation, notices).await?);
    }
    Ok(outcomes)
}

async fn list_schemas(tx: &mut dyn Transaction) -> Result<Vec<TableSchema>> {
    let tables = tx.list_tables().await?;
    let mut schemas = Vec::with_capacity(tables.len());
    for table in tables {
        let columns = tx.list_columns(table.id).await?;
        schemas.push(TableSchema {
            id: table.id,
            table_name: table.table_name,
            columns: columns.into_iter().map(ColumnSchema::from).collect(),
        });
    }
    Ok(schemas)
}

/// Commits on success and flushes the notices; rolls back on failure.
async fn settle<T, X: TransactionControl>(tx: X, outcome: Result<T>, notices: PostCommit) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            notices.flush();
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                error!(error = %rollback_error, "Rollback failed");
            }
            Err(e)
        }
    }
}
