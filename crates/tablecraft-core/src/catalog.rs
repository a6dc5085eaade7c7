//! Metadata catalog
//!
//! `metadata_table` and `metadata_column` shadow every caller-defined table.
//! The catalog is read fresh inside each transaction and is never cached
//! across requests, so a batch always sees its own in-flight changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::column_type::ColumnType;
use crate::errors::Result;

pub const TABLE_CATALOG: &str = "metadata_table";
pub const COLUMN_CATALOG: &str = "metadata_column";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub id: Uuid,
    pub table_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub id: Uuid,
    pub table_id: Uuid,
    pub column_name: String,
    pub data_type: String,
    pub is_primary: bool,
    pub is_nullable: bool,
    pub is_unique: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ColumnMetadata {
    pub fn column_type(&self) -> ColumnType {
        ColumnType::from_catalog(&self.data_type)
    }
}

/// A column row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewColumn {
    pub table_id: Uuid,
    pub column_name: String,
    pub data_type: String,
    pub is_primary: bool,
    pub is_nullable: bool,
    pub is_unique: bool,
}

/// Fields an Alter-Column may change. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnUpdate {
    pub column_name: Option<String>,
    pub is_nullable: Option<bool>,
    pub is_unique: Option<bool>,
}

/// A registered table together with its columns, as listed by the schema endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub id: Uuid,
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnSchema {
    pub id: Uuid,
    pub column_name: String,
    pub data_type: String,
    pub is_primary: bool,
    pub is_nullable: bool,
    pub is_unique: bool,
}

impl From<ColumnMetadata> for ColumnSchema {
    fn from(column: ColumnMetadata) -> Self {
        Self {
            id: column.id,
            column_name: column.column_name,
            data_type: column.data_type,
            is_primary: column.is_primary,
            is_nullable: column.is_nullable,
            is_unique: column.is_unique,
        }
    }
}

/// Catalog repository bound to one open transaction.
#[async_trait]
pub trait CatalogStore: Send {
    async fn find_table(&mut self, table_name: &str) -> Result<Option<TableMetadata>>;

    async fn list_tables(&mut self) -> Result<Vec<TableMetadata>>;

    async fn insert_table(&mut self, table_name: &str) -> Result<TableMetadata>;

    async fn rename_table(&mut self, table_id: Uuid, new_name: &str) -> Result<()>;

    /// Deletes the table row; column rows go with it through the foreign key.
    async fn delete_table(&mut self, table_id: Uuid) -> Result<()>;

    async fn find_column(&mut self, table_id: Uuid, column_name: &str)
        -> Result<Option<ColumnMetadata>>;

    async fn list_columns(&mut self, table_id: Uuid) -> Result<Vec<ColumnMetadata>>;

    async fn insert_column(&mut self, column: NewColumn) -> Result<ColumnMetadata>;

    async fn update_column(&mut self, column_id: Uuid, update: ColumnUpdate) -> Result<()>;

    async fn delete_column(&mut self, column_id: Uuid) -> Result<()>;

    /// Removes every column row of a table, returning how many went.
    async fn delete_columns(&mut self, table_id: Uuid) -> Result<u64>;

    async fn table_exists(&mut self, table_name: &str) -> Result<bool> {
        Ok(self.find_table(table_name).await?.is_some())
    }
}
