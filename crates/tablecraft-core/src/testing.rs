//! In-memory backend for unit tests.
//!
//! `MockDatabase` keeps a committed catalog. Each transaction works on a copy
//! that is written back on commit, so rollback leaves the committed catalog
//! untouched. Statements are recorded but not interpreted; the results of
//! `EXISTS` probes and row queries are scripted.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::catalog::{CatalogStore, ColumnMetadata, ColumnUpdate, NewColumn, TableMetadata};
use crate::errors::{CoreError, Result};
use crate::session::{Database, RawStatement, SqlSession, TransactionControl};
use crate::value::SqlValue;

/// A catalog column row for tests.
pub fn column(name: &str, data_type: &str, nullable: bool) -> ColumnMetadata {
    let now = Utc::now();
    ColumnMetadata {
        id: Uuid::new_v4(),
        table_id: Uuid::nil(),
        column_name: name.to_string(),
        data_type: data_type.to_string(),
        is_primary: false,
        is_nullable: nullable,
        is_unique: false,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Debug, Clone, Default)]
struct MockCatalog {
    tables: Vec<TableMetadata>,
    columns: Vec<ColumnMetadata>,
}

#[derive(Default)]
struct Shared {
    catalog: MockCatalog,
    statements: Vec<(String, Vec<SqlValue>)>,
    exists_results: VecDeque<bool>,
    row_results: VecDeque<Vec<Value>>,
    raw_results: VecDeque<Vec<RawStatement>>,
    fail_on: Option<String>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

#[derive(Clone, Default)]
pub struct MockDatabase {
    shared: Arc<Mutex<Shared>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction without going through `Database::begin`.
    pub fn transaction(&self) -> MockTransaction {
        let catalog = self.shared.lock().catalog.clone();
        MockTransaction {
            shared: self.shared.clone(),
            catalog,
        }
    }

    /// Registers a committed table with `(name, type, nullable)` columns.
    pub fn register(&self, table: &str, columns: &[(&str, &str, bool)]) -> TableMetadata {
        let mut shared = self.shared.lock();
        let metadata = table_row(table);
        for (name, data_type, nullable) in columns {
            let mut row = column(name, data_type, *nullable);
            row.table_id = metadata.id;
            shared.catalog.columns.push(row);
        }
        shared.catalog.tables.push(metadata.clone());
        metadata
    }

    pub fn push_exists(&self, exists: bool) {
        self.shared.lock().exists_results.push_back(exists);
    }

    pub fn push_rows(&self, rows: Vec<Value>) {
        self.shared.lock().row_results.push_back(rows);
    }

    pub fn push_raw(&self, result: Vec<RawStatement>) {
        self.shared.lock().raw_results.push_back(result);
    }

    /// Makes every statement containing `fragment` fail.
    pub fn fail_on(&self, fragment: &str) {
        self.shared.lock().fail_on = Some(fragment.to_string());
    }

    pub fn statements(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.shared.lock().statements.clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|(sql, _)| sql).collect()
    }

    pub fn last_statement(&self) -> (String, Vec<SqlValue>) {
        self.statements().pop().unwrap_or_default()
    }

    /// Committed catalog lookups.
    pub fn table(&self, name: &str) -> Option<TableMetadata> {
        self.shared.lock().catalog.tables.iter().find(|t| t.table_name == name).cloned()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<ColumnMetadata> {
        let table = self.table(table)?;
        self.shared
            .lock()
            .catalog
            .columns
            .iter()
            .find(|c| c.table_id == table.id && c.column_name == column)
            .cloned()
    }

    pub fn table_count(&self) -> usize {
        self.shared.lock().catalog.tables.len()
    }

    pub fn begins(&self) -> usize {
        self.shared.lock().begins
    }

    pub fn commits(&self) -> usize {
        self.shared.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.shared.lock().rollbacks
    }
}

fn table_row(name: &str) -> TableMetadata {
    let now = Utc::now();
    TableMetadata {
        id: Uuid::new_v4(),
        table_name: name.to_string(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl Database for MockDatabase {
    type Tx = MockTransaction;

    async fn begin(&self) -> Result<MockTransaction> {
        self.shared.lock().begins += 1;
        Ok(self.transaction())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MockTransaction {
    shared: Arc<Mutex<Shared>>,
    catalog: MockCatalog,
}

impl MockTransaction {
    fn record(&self, sql: &str, params: &[SqlValue]) -> Result<()> {
        let mut shared = self.shared.lock();
        if let Some(fragment) = &shared.fail_on {
            if sql.contains(fragment.as_str()) {
                return Err(CoreError::Database(format!("injected failure on: {}", sql)));
            }
        }
        shared.statements.push((sql.to_string(), params.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl SqlSession for MockTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.record(sql, params)?;
        Ok(0)
    }

    async fn fetch_rows(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Value>> {
        self.record(sql, params)?;
        let scripted = self.shared.lock().row_results.pop_front();
        Ok(match scripted {
            Some(rows) => rows,
            None if sql.starts_with("INSERT") => vec![json!({"id": Uuid::new_v4().to_string()})],
            None => Vec::new(),
        })
    }

    async fn fetch_exists(&mut self, sql: &str, params: &[SqlValue]) -> Result<bool> {
        self.record(sql, params)?;
        Ok(self.shared.lock().exists_results.pop_front().unwrap_or(true))
    }

    async fn run_raw(&mut self, sql: &str) -> Result<Vec<RawStatement>> {
        self.record(sql, &[])?;
        let scripted = self.shared.lock().raw_results.pop_front();
        Ok(scripted.unwrap_or_else(|| vec![RawStatement::Affected(0)]))
    }
}

#[async_trait]
impl CatalogStore for MockTransaction {
    async fn find_table(&mut self, table_name: &str) -> Result<Option<TableMetadata>> {
        Ok(self.catalog.tables.iter().find(|t| t.table_name == table_name).cloned())
    }

    async fn list_tables(&mut self) -> Result<Vec<TableMetadata>> {
        Ok(self.catalog.tables.clone())
    }

    async fn insert_table(&mut self, table_name: &str) -> Result<TableMetadata> {
        if self.catalog.tables.iter().any(|t| t.table_name == table_name) {
            return Err(CoreError::ConstraintViolation(format!("duplicate table {}", table_name)));
        }
        let row = table_row(table_name);
        self.catalog.tables.push(row.clone());
        Ok(row)
    }

    async fn rename_table(&mut self, table_id: Uuid, new_name: &str) -> Result<()> {
        if let Some(table) = self.catalog.tables.iter_mut().find(|t| t.id == table_id) {
            table.table_name = new_name.to_string();
            table.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_table(&mut self, table_id: Uuid) -> Result<()> {
        self.catalog.tables.retain(|t| t.id != table_id);
        self.catalog.columns.retain(|c| c.table_id != table_id);
        Ok(())
    }

    async fn find_column(&mut self, table_id: Uuid, column_name: &str) -> Result<Option<ColumnMetadata>> {
        Ok(self
            .catalog
            .columns
            .iter()
            .find(|c| c.table_id == table_id && c.column_name == column_name)
            .cloned())
    }

    async fn list_columns(&mut self, table_id: Uuid) -> Result<Vec<ColumnMetadata>> {
        Ok(self.catalog.columns.iter().filter(|c| c.table_id == table_id).cloned().collect())
    }

    async fn insert_column(&mut self, column: NewColumn) -> Result<ColumnMetadata> {
        if self
            .catalog
            .columns
            .iter()
            .any(|c| c.table_id == column.table_id && c.column_name == column.column_name)
        {
            return Err(CoreError::ConstraintViolation(format!(
                "duplicate column {}",
                column.column_name
            )));
        }
        let now = Utc::now();
        let row = ColumnMetadata {
            id: Uuid::new_v4(),
            table_id: column.table_id,
            column_name: column.column_name,
            data_type: column.data_type,
            is_primary: column.is_primary,
            is_nullable: column.is_nullable,
            is_unique: column.is_unique,
            created_at: now,
            updated_at: now,
        };
        self.catalog.columns.push(row.clone());
        Ok(row)
    }

    async fn update_column(&mut self, column_id: Uuid, update: ColumnUpdate) -> Result<()> {
        if let Some(column) = self.catalog.columns.iter_mut().find(|c| c.id == column_id) {
            if let Some(name) = update.column_name {
                column.column_name = name;
            }
            if let Some(nullable) = update.is_nullable {
                column.is_nullable = nullable;
            }
            if let Some(unique) = update.is_unique {
                column.is_unique = unique;
            }
            column.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_column(&mut self, column_id: Uuid) -> Result<()> {
        self.catalog.columns.retain(|c| c.id != column_id);
        Ok(())
    }

    async fn delete_columns(&mut self, table_id: Uuid) -> Result<u64> {
        let before = self.catalog.columns.len();
        self.catalog.columns.retain(|c| c.table_id != table_id);
        Ok((before - self.catalog.columns.len()) as u64)
    }
}

#[async_trait]
impl TransactionControl for MockTransaction {
    async fn commit(self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.catalog = self.catalog;
        shared.commits += 1;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.shared.lock().rollbacks += 1;
        Ok(())
    }
}
