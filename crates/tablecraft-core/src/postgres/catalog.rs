use async_trait::async_trait;
use tokio_postgres::Row;
use uuid::Uuid;

use super::PgTransaction;
use crate::catalog::{CatalogStore, ColumnMetadata, ColumnUpdate, NewColumn, TableMetadata};
use crate::errors::{CoreError, Result};

const TABLE_FIELDS: &str = "id, table_name, created_at, updated_at";
const COLUMN_FIELDS: &str =
    "id, table_id, column_name, data_type, is_primary, is_nullable, is_unique, created_at, updated_at";

fn table_from_row(row: &Row) -> Result<TableMetadata> {
    Ok(TableMetadata {
        id: row.try_get("id")?,
        table_name: row.try_get("table_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn column_from_row(row: &Row) -> Result<ColumnMetadata> {
    Ok(ColumnMetadata {
        id: row.try_get("id")?,
        table_id: row.try_get("table_id")?,
        column_name: row.try_get("column_name")?,
        data_type: row.try_get("data_type")?,
        is_primary: row.try_get("is_primary")?,
        is_nullable: row.try_get("is_nullable")?,
        is_unique: row.try_get("is_unique")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CatalogStore for PgTransaction {
    async fn find_table(&mut self, table_name: &str) -> Result<Option<TableMetadata>> {
        let sql = format!("SELECT {} FROM metadata_table WHERE table_name = $1", TABLE_FIELDS);
        let row = self.client()?.query_opt(sql.as_str(), &[&table_name]).await?;
        row.as_ref().map(table_from_row).transpose()
    }

    async fn list_tables(&mut self) -> Result<Vec<TableMetadata>> {
        let sql = format!("SELECT {} FROM metadata_table ORDER BY table_name", TABLE_FIELDS);
        let rows = self.client()?.query(sql.as_str(), &[]).await?;
        rows.iter().map(table_from_row).collect()
    }

    async fn insert_table(&mut self, table_name: &str) -> Result<TableMetadata> {
        let sql = format!(
            "INSERT INTO metadata_table (table_name) VALUES ($1) RETURNING {}",
            TABLE_FIELDS
        );
        let row = self.client()?.query_one(sql.as_str(), &[&table_name]).await?;
        table_from_row(&row)
    }

    async fn rename_table(&mut self, table_id: Uuid, new_name: &str) -> Result<()> {
        let updated = self
            .client()?
            .execute(
                "UPDATE metadata_table SET table_name = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
                &[&table_id, &new_name],
            )
            .await?;
        if updated == 0 {
            return Err(CoreError::Database(format!("catalog row {} vanished during rename", table_id)));
        }
        Ok(())
    }

    async fn delete_table(&mut self, table_id: Uuid) -> Result<()> {
        self.client()?
            .execute("DELETE FROM metadata_table WHERE id = $1", &[&table_id])
            .await?;
        Ok(())
    }

    async fn find_column(&mut self, table_id: Uuid, column_name: &str) -> Result<Option<ColumnMetadata>> {
        let sql = format!(
            "SELECT {} FROM metadata_column WHERE table_id = $1 AND column_name = $2",
            COLUMN_FIELDS
        );
        let row = self
            .client()?
            .query_opt(sql.as_str(), &[&table_id, &column_name])
            .await?;
        row.as_ref().map(column_from_row).transpose()
    }

    async fn list_columns(&mut self, table_id: Uuid) -> Result<Vec<ColumnMetadata>> {
        let sql = format!(
            "SELECT {} FROM metadata_column WHERE table_id = $1 ORDER BY created_at, column_name",
            COLUMN_FIELDS
        );
        let rows = self.client()?.query(sql.as_str(), &[&table_id]).await?;
        rows.iter().map(column_from_row).collect()
    }

    async fn insert_column(&mut self, column: NewColumn) -> Result<ColumnMetadata> {
        let sql = format!(
            "INSERT INTO metadata_column (table_id, column_name, data_type, is_primary, is_nullable, is_unique) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            COLUMN_FIELDS
        );
        let row = self
            .client()?
            .query_one(
                sql.as_str(),
                &[
                    &column.table_id,
                    &column.column_name,
                    &column.data_type,
                    &column.is_primary,
                    &column.is_nullable,
                    &column.is_unique,
                ],
            )
            .await?;
        column_from_row(&row)
    }

    async fn update_column(&mut self, column_id: Uuid, update: ColumnUpdate) -> Result<()> {
        self.client()?
            .execute(
                "UPDATE metadata_column SET \
                 column_name = COALESCE($2, column_name), \
                 is_nullable = COALESCE($3, is_nullable), \
                 is_unique = COALESCE($4, is_unique), \
                 updated_at = CURRENT_TIMESTAMP \
                 WHERE id = $1",
                &[&column_id, &update.column_name, &update.is_nullable, &update.is_unique],
            )
            .await?;
        Ok(())
    }

    async fn delete_column(&mut self, column_id: Uuid) -> Result<()> {
        self.client()?
            .execute("DELETE FROM metadata_column WHERE id = $1", &[&column_id])
            .await?;
        Ok(())
    }

    async fn delete_columns(&mut self, table_id: Uuid) -> Result<u64> {
        Ok(self
            .client()?
            .execute("DELETE FROM metadata_column WHERE table_id = $1", &[&table_id])
            .await?)
    }
}
