//! DDL executor
//!
//! Each handler changes the live schema and the catalog on the same
//! transaction handle. Nothing here commits; the engine decides that once the
//! whole batch has run.

use serde::Serialize;
use tracing::{debug, instrument};

use crate::catalog::{ColumnMetadata, ColumnUpdate, NewColumn, TableMetadata};
use crate::column_type::{DefaultValue, TypeCategory};
use crate::errors::{CoreError, Result};
use crate::operation::{ColumnAlteration, ColumnDefinition, DdlOperation, DefaultChange, PrimaryKeyKind};
use crate::session::{PostCommit, Transaction};
use crate::validation::{
    ensure_identifier, ensure_table_name, json_kind, quote_identifier, value_matches,
    IMPLICIT_PRIMARY_KEY,
};

/// One applied DDL operation, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedDdl {
    pub operation: &'static str,
    pub target: String,
}

/// Name of the unique constraint backing a unique column.
pub fn unique_constraint(table: &str, column: &str) -> String {
    format!("{}_{}_unique", table, column)
}

pub async fn apply(
    tx: &mut dyn Transaction,
    operation: &DdlOperation,
    notices: &mut PostCommit,
) -> Result<AppliedDdl> {
    let target = match operation {
        DdlOperation::CreateTable { name, primary_key } => {
            create_table(tx, name, *primary_key, notices).await?;
            name.clone()
        }
        DdlOperation::CreateColumn { table, column, definition } => {
            create_column(tx, table, column, definition, notices).await?;
            format!("{}.{}", table, column)
        }
        DdlOperation::AlterTable { from, to } => {
            alter_table(tx, from, to, notices).await?;
            to.clone()
        }
        DdlOperation::AlterColumn { table, from, to, changes } => {
            alter_column(tx, table, from, to, changes, notices).await?;
            format!("{}.{}", table, to)
        }
        DdlOperation::DropColumn { table, column } => {
            drop_column(tx, table, column, notices).await?;
            format!("{}.{}", table, column)
        }
        DdlOperation::DropTable { name } => {
            drop_table(tx, name, notices).await?;
            name.clone()
        }
    };

    Ok(AppliedDdl {
        operation: operation.label(),
        target,
    })
}

async fn run(tx: &mut dyn Transaction, sql: String) -> Result<()> {
    debug!(sql = %sql, "Executing DDL");
    tx.execute(&sql, &[]).await?;
    Ok(())
}

async fn require_table(tx: &mut dyn Transaction, name: &str) -> Result<TableMetadata> {
    tx.find_table(name)
        .await?
        .ok_or_else(|| CoreError::TableNotFound(name.to_string()))
}

async fn require_column(
    tx: &mut dyn Transaction,
    table: &TableMetadata,
    column: &str,
) -> Result<ColumnMetadata> {
    tx.find_column(table.id, column)
        .await?
        .ok_or_else(|| CoreError::column_not_found(&table.table_name, column))
}

async fn column_taken(tx: &mut dyn Transaction, table: &TableMetadata, column: &str) -> Result<bool> {
    if column == IMPLICIT_PRIMARY_KEY {
        return Ok(true);
    }
    Ok(tx.find_column(table.id, column).await?.is_some())
}

fn check_default(column: &str, declared: &str, category: TypeCategory, default: &DefaultValue) -> Result<()> {
    if let DefaultValue::Literal(value) = default {
        if !value_matches(category, value) {
            return Err(CoreError::type_mismatch(
                column,
                format!(
                    "default must be {} for type {}, got {}",
                    category.describe(),
                    declared,
                    json_kind(value)
                ),
            ));
        }
    }
    Ok(())
}

#[instrument(skip(tx, notices))]
async fn create_table(
    tx: &mut dyn Transaction,
    name: &str,
    primary_key: PrimaryKeyKind,
    notices: &mut PostCommit,
) -> Result<()> {
    ensure_table_name(name)?;
    if tx.table_exists(name).await? {
        return Err(CoreError::TableExists(name.to_string()));
    }

    run(
        tx,
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(name),
            primary_key.column_sql()
        ),
    )
    .await?;

    // A concurrent batch may have registered the same name since the check above.
    tx.insert_table(name).await.map_err(|e| match e {
        CoreError::ConstraintViolation(_) => CoreError::TableExists(name.to_string()),
        other => other,
    })?;

    notices.push(format!("Table {} metadata saved successfully", name));
    Ok(())
}

#[instrument(skip(tx, definition, notices))]
async fn create_column(
    tx: &mut dyn Transaction,
    table: &str,
    column: &str,
    definition: &ColumnDefinition,
    notices: &mut PostCommit,
) -> Result<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("column", column)?;

    let metadata = require_table(tx, table).await?;
    if column_taken(tx, &metadata, column).await? {
        return Err(CoreError::column_exists(table, column));
    }

    let data_type = &definition.data_type;
    if let Some(default) = &definition.default {
        check_default(column, data_type.name(), data_type.category(), default)?;
    }

    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_identifier(table),
        quote_identifier(column),
        data_type
    );
    if let Some(default) = &definition.default {
        sql.push_str(&format!(" DEFAULT {}", default.to_sql()));
    }
    if !definition.nullable {
        sql.push_str(" NOT NULL");
    }
    if definition.unique {
        sql.push_str(&format!(
            " CONSTRAINT {} UNIQUE",
            quote_identifier(&unique_constraint(table, column))
        ));
    }
    run(tx, sql).await?;

    tx.insert_column(NewColumn {
        table_id: metadata.id,
        column_name: column.to_string(),
        data_type: data_type.name().to_string(),
        is_primary: definition.primary,
        is_nullable: definition.nullable,
        is_unique: definition.unique,
    })
    .await
    .map_err(|e| match e {
        CoreError::ConstraintViolation(_) => CoreError::column_exists(table, column),
        other => other,
    })?;

    notices.push(format!("Column {} added to table {}", column, table));
    Ok(())
}

#[instrument(skip(tx, notices))]
async fn alter_table(tx: &mut dyn Transaction, from: &str, to: &str, notices: &mut PostCommit) -> Result<()> {
    ensure_identifier("table", from)?;
    ensure_table_name(to)?;
    if from == to {
        return Err(CoreError::SameName(from.to_string()));
    }

    let metadata = require_table(tx, from).await?;
    if tx.table_exists(to).await? {
        return Err(CoreError::TableExists(to.to_string()));
    }

    run(
        tx,
        format!("ALTER TABLE {} RENAME TO {}", quote_identifier(from), quote_identifier(to)),
    )
    .await?;

    let unique_columns: Vec<ColumnMetadata> = tx
        .list_columns(metadata.id)
        .await?
        .into_iter()
        .filter(|c| c.is_unique)
        .collect();
    for column in unique_columns {
        run(
            tx,
            format!(
                "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                quote_identifier(to),
                quote_identifier(&unique_constraint(from, &column.column_name)),
                quote_identifier(&unique_constraint(to, &column.column_name))
            ),
        )
        .await?;
    }

    tx.rename_table(metadata.id, to).await.map_err(|e| match e {
        CoreError::ConstraintViolation(_) => CoreError::TableExists(to.to_string()),
        other => other,
    })?;

    notices.push(format!("Table {} renamed to {}", from, to));
    Ok(())
}

#[instrument(skip(tx, changes, notices))]
async fn alter_column(
    tx: &mut dyn Transaction,
    table: &str,
    from: &str,
    to: &str,
    changes: &ColumnAlteration,
    notices: &mut PostCommit,
) -> Result<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("column", from)?;
    ensure_identifier("column", to)?;

    let metadata = require_table(tx, table).await?;
    let existing = require_column(tx, &metadata, from).await?;
    let quoted_table = quote_identifier(table);
    let renamed = from != to;

    if renamed {
        if column_taken(tx, &metadata, to).await? {
            return Err(CoreError::column_exists(table, to));
        }
        run(
            tx,
            format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quoted_table,
                quote_identifier(from),
                quote_identifier(to)
            ),
        )
        .await?;
        if existing.is_unique {
            run(
                tx,
                format!(
                    "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                    quoted_table,
                    quote_identifier(&unique_constraint(table, from)),
                    quote_identifier(&unique_constraint(table, to))
                ),
            )
            .await?;
        }
    }

    let column = quote_identifier(to);
    let mut fragments = Vec::new();

    match changes.nullable {
        Some(true) => fragments.push(format!("ALTER COLUMN {} DROP NOT NULL", column)),
        Some(false) => fragments.push(format!("ALTER COLUMN {} SET NOT NULL", column)),
        None => {}
    }

    match &changes.default {
        Some(DefaultChange::Set(default)) => {
            let declared = existing.column_type();
            check_default(to, declared.name(), declared.category(), default)?;
            fragments.push(format!("ALTER COLUMN {} SET DEFAULT {}", column, default.to_sql()));
        }
        Some(DefaultChange::Drop) => fragments.push(format!("ALTER COLUMN {} DROP DEFAULT", column)),
        None => {}
    }

    let constraint = quote_identifier(&unique_constraint(table, to));
    match changes.unique {
        Some(true) if !existing.is_unique => {
            fragments.push(format!("ADD CONSTRAINT {} UNIQUE ({})", constraint, column))
        }
        Some(false) if existing.is_unique => {
            fragments.push(format!("DROP CONSTRAINT IF EXISTS {}", constraint))
        }
        _ => {}
    }

    if !fragments.is_empty() {
        run(tx, format!("ALTER TABLE {} {}", quoted_table, fragments.join(", "))).await?;
    }

    tx.update_column(
        existing.id,
        ColumnUpdate {
            column_name: renamed.then(|| to.to_string()),
            is_nullable: changes.nullable,
            is_unique: changes.unique,
        },
    )
    .await?;

    if renamed {
        notices.push(format!("Column {} renamed to {} in table {}", from, to, table));
    } else {
        notices.push(format!("Column {} altered in table {}", to, table));
    }
    Ok(())
}

#[instrument(skip(tx, notices))]
async fn drop_column(tx: &mut dyn Transaction, table: &str, column: &str, notices: &mut PostCommit) -> Result<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("column", column)?;

    let metadata = require_table(tx, table).await?;
    let existing = require_column(tx, &metadata, column).await?;

    run(
        tx,
        format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            quote_identifier(table),
            quote_identifier(column)
        ),
    )
    .await?;
    tx.delete_column(existing.id).await?;

    notices.push(format!("Column {} dropped from table {}", column, table));
    Ok(())
}

#[instrument(skip(tx, notices))]
async fn drop_table(tx: &mut dyn Transaction, name: &str, notices: &mut PostCommit) -> Result<()> {
    ensure_identifier("table", name)?;
    let metadata = require_table(tx, name).await?;

    run(tx, format!("DROP TABLE IF EXISTS {} CASCADE", quote_identifier(name))).await?;

    let removed = tx.delete_columns(metadata.id).await?;
    tx.delete_table(metadata.id).await?;

    debug!(table = name, columns = removed, "Removed catalog rows");
    notices.push(format!("Table {} dropped", name));
    Ok(())
}
