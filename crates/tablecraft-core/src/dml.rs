//! DML executor
//!
//! Every value that reaches a statement is bound. Identifiers are checked
//! against the catalog, values against the declared column types, and string
//! values are scanned for injection signatures before anything runs.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::catalog::{ColumnMetadata, TableMetadata};
use crate::column_type::TypeCategory;
use crate::condition::{ColumnTypes, Condition, NamedParams, PositionalParams};
use crate::errors::{CoreError, Result};
use crate::operation::{DeleteCommand, DmlOperation, InsertCommand, SelectQuery, UpdateCommand};
use crate::session::{PostCommit, Transaction};
use crate::validation::{
    check_column_value, check_primary_key_value, ensure_identifier, quote_identifier, scan_value,
    IMPLICIT_PRIMARY_KEY,
};
use crate::value::SqlValue;

/// Alias used for whole-row `to_jsonb` projections. The `$` keeps it out of
/// the identifier space callers can use.
const ROW_ALIAS: &str = "\"row$\"";

/// Result of one DML operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation")]
pub enum DmlOutcome {
    Select {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        table: String,
        rows: Vec<Value>,
    },
    Insert {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        table: String,
        id: Value,
        row: Value,
    },
    Update {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        table: String,
        ids: Vec<Value>,
    },
    Delete {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        table: String,
        ids: Vec<Value>,
    },
}

pub async fn apply(
    tx: &mut dyn Transaction,
    operation: &DmlOperation,
    notices: &mut PostCommit,
) -> Result<DmlOutcome> {
    match operation {
        DmlOperation::Select(query) => select(tx, query).await,
        DmlOperation::Insert(command) => insert(tx, command, notices).await,
        DmlOperation::Update(command) => update(tx, command, notices).await,
        DmlOperation::Delete(command) => delete(tx, command, notices).await,
    }
}

/// A column reference resolved against the catalog.
enum Target<'a> {
    PrimaryKey,
    Column(&'a ColumnMetadata),
}

impl Target<'_> {
    fn check(&self, value: &Value) -> Result<()> {
        match self {
            Target::PrimaryKey => check_primary_key_value(value),
            Target::Column(column) => check_column_value(column, value),
        }
    }
}

/// The registered columns of one table, read inside the current transaction.
struct TableColumns {
    table: TableMetadata,
    columns: HashMap<String, ColumnMetadata>,
}

impl TableColumns {
    async fn load(tx: &mut dyn Transaction, table: &str) -> Result<Self> {
        ensure_identifier("table", table)?;
        let metadata = tx
            .find_table(table)
            .await?
            .ok_or_else(|| CoreError::TableNotFound(table.to_string()))?;
        let columns = tx
            .list_columns(metadata.id)
            .await?
            .into_iter()
            .map(|c| (c.column_name.clone(), c))
            .collect();
        Ok(Self {
            table: metadata,
            columns,
        })
    }

    fn name(&self) -> &str {
        &self.table.table_name
    }

    fn target(&self, column: &str) -> Result<Target<'_>> {
        ensure_identifier("column", column)?;
        if let Some(metadata) = self.columns.get(column) {
            return Ok(Target::Column(metadata));
        }
        if column == IMPLICIT_PRIMARY_KEY {
            return Ok(Target::PrimaryKey);
        }
        Err(CoreError::column_not_found(self.name(), column))
    }

    /// The bind parameter for a value already checked against `column`.
    fn bind(&self, column: &str, value: &Value) -> SqlValue {
        match self.category(column) {
            Some(category) => SqlValue::for_column(category, value),
            None => SqlValue::from_json(value),
        }
    }

    /// Validates a data/set map the way Insert and Update both need.
    fn check_values(&self, values: &Map<String, Value>) -> Result<()> {
        for (column, value) in values {
            self.target(column)?.check(value)?;
            scan_value(column, value)?;
        }
        Ok(())
    }

    /// Checks every comparison in a condition once its templates are resolved.
    fn check_condition(&self, condition: &Condition, params: &Map<String, Value>) -> Result<()> {
        for comparison in condition.comparisons() {
            let target = self.target(&comparison.column)?;
            let value = comparison.operand.resolve(params);
            scan_value(&comparison.column, &value)?;

            let items = match &value {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            };
            for item in items.into_iter().filter(|item| !item.is_null()) {
                target.check(item)?;
            }
        }
        Ok(())
    }
}

impl ColumnTypes for TableColumns {
    fn category(&self, column: &str) -> Option<TypeCategory> {
        match self.columns.get(column) {
            Some(metadata) => Some(metadata.column_type().category()),
            None if column == IMPLICIT_PRIMARY_KEY => Some(TypeCategory::Integer),
            None => None,
        }
    }
}

fn returned_ids(rows: Vec<Value>) -> Vec<Value> {
    rows.into_iter()
        .map(|row| match row {
            Value::Object(mut fields) => fields.remove(IMPLICIT_PRIMARY_KEY).unwrap_or(Value::Null),
            other => other,
        })
        .collect()
}

#[instrument(skip(tx, query), fields(table = %query.table))]
async fn select(tx: &mut dyn Transaction, query: &SelectQuery) -> Result<DmlOutcome> {
    let columns = TableColumns::load(tx, &query.table).await?;
    columns.check_condition(&query.condition, &query.params)?;

    let mut named = NamedParams::new();
    let clause = query.condition.compile_typed(&mut named, &query.params, &columns)?;
    let mut sql = format!(
        "SELECT to_jsonb({alias}) AS \"row\" FROM {} AS {alias} WHERE {}",
        quote_identifier(&query.table),
        clause,
        alias = ROW_ALIAS
    );

    if !query.order_by.is_empty() {
        let mut terms = Vec::with_capacity(query.order_by.len());
        for (column, direction) in &query.order_by {
            columns.target(column)?;
            terms.push(format!("{} {}", quote_identifier(column), direction.as_sql()));
        }
        sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
    }
    if let Some(limit) = query.limit {
        let placeholder = named.insert("limit", SqlValue::Number(limit.into()));
        sql.push_str(&format!(" LIMIT {}", placeholder));
    }
    if let Some(offset) = query.offset {
        let placeholder = named.insert("offset", SqlValue::Number(offset.into()));
        sql.push_str(&format!(" OFFSET {}", placeholder));
    }

    let (sql, params) = named.into_positional(&sql);
    debug!(sql = %sql, params = params.len(), "Executing select");
    let rows = tx.fetch_rows(&sql, &params).await?;

    Ok(DmlOutcome::Select {
        name: query.name.clone(),
        table: query.table.clone(),
        rows,
    })
}

#[instrument(skip(tx, command, notices), fields(table = %command.table))]
async fn insert(
    tx: &mut dyn Transaction,
    command: &InsertCommand,
    notices: &mut PostCommit,
) -> Result<DmlOutcome> {
    if command.data.is_empty() {
        return Err(CoreError::InvalidPayload("Insert data must not be empty".into()));
    }
    let columns = TableColumns::load(tx, &command.table).await?;
    columns.check_values(&command.data)?;

    let mut params = PositionalParams::new();
    let mut names = Vec::with_capacity(command.data.len());
    let mut placeholders = Vec::with_capacity(command.data.len());
    for (column, value) in &command.data {
        names.push(quote_identifier(column));
        placeholders.push(params.push(columns.bind(column, value)));
    }

    let sql = format!(
        "INSERT INTO {} AS {alias} ({}) VALUES ({}) RETURNING to_jsonb({alias}) AS \"row\"",
        quote_identifier(&command.table),
        names.join(", "),
        placeholders.join(", "),
        alias = ROW_ALIAS
    );
    debug!(sql = %sql, "Executing insert");
    let row = tx
        .fetch_rows(&sql, params.values())
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::Database(format!("insert into {} returned no row", command.table)))?;
    let id = row.get(IMPLICIT_PRIMARY_KEY).cloned().unwrap_or(Value::Null);

    notices.push(format!("Inserted row {} into {}", id, command.table));
    Ok(DmlOutcome::Insert {
        name: command.name.clone(),
        table: command.table.clone(),
        id,
        row,
    })
}

/// Fails with `NoMatchingRecord` unless `condition` matches at least one row.
async fn ensure_matches(
    tx: &mut dyn Transaction,
    columns: &TableColumns,
    condition: &Condition,
    params: &Map<String, Value>,
) -> Result<()> {
    let table = columns.name();
    let mut probe = PositionalParams::new();
    let clause = condition.compile_typed(&mut probe, params, columns)?;
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE {}) AS \"exists\"",
        quote_identifier(table),
        clause
    );
    debug!(sql = %sql, "Checking for matching rows");
    if tx.fetch_exists(&sql, probe.values()).await? {
        Ok(())
    } else {
        Err(CoreError::NoMatchingRecord(table.to_string()))
    }
}

#[instrument(skip(tx, command, notices), fields(table = %command.table))]
async fn update(
    tx: &mut dyn Transaction,
    command: &UpdateCommand,
    notices: &mut PostCommit,
) -> Result<DmlOutcome> {
    if command.set.is_empty() {
        return Err(CoreError::InvalidPayload("Update set must not be empty".into()));
    }
    let columns = TableColumns::load(tx, &command.table).await?;
    columns.check_values(&command.set)?;
    columns.check_condition(&command.condition, &command.params)?;

    ensure_matches(tx, &columns, &command.condition, &command.params).await?;

    let mut params = PositionalParams::new();
    let assignments: Vec<String> = command
        .set
        .iter()
        .map(|(column, value)| {
            format!("{} = {}", quote_identifier(column), params.push(columns.bind(column, value)))
        })
        .collect();
    let clause = command.condition.compile_typed(&mut params, &command.params, &columns)?;

    let sql = format!(
        "UPDATE {} SET {} WHERE {} RETURNING to_jsonb({}) AS \"row\"",
        quote_identifier(&command.table),
        assignments.join(", "),
        clause,
        quote_identifier(IMPLICIT_PRIMARY_KEY)
    );
    debug!(sql = %sql, "Executing update");
    let ids = tx.fetch_rows(&sql, params.values()).await?;
    let ids = returned_ids(ids);

    notices.push(format!("Updated {} row(s) in {}", ids.len(), command.table));
    Ok(DmlOutcome::Update {
        name: command.name.clone(),
        table: command.table.clone(),
        ids,
    })
}

#[instrument(skip(tx, command, notices), fields(table = %command.table))]
async fn delete(
    tx: &mut dyn Transaction,
    command: &DeleteCommand,
    notices: &mut PostCommit,
) -> Result<DmlOutcome> {
    let columns = TableColumns::load(tx, &command.table).await?;
    columns.check_condition(&command.condition, &command.params)?;

    ensure_matches(tx, &columns, &command.condition, &command.params).await?;

    let mut params = PositionalParams::new();
    let clause = command.condition.compile_typed(&mut params, &command.params, &columns)?;
    let sql = format!(
        "DELETE FROM {} WHERE {} RETURNING to_jsonb({}) AS \"row\"",
        quote_identifier(&command.table),
        clause,
        quote_identifier(IMPLICIT_PRIMARY_KEY)
    );
    debug!(sql = %sql, "Executing delete");
    let ids = returned_ids(tx.fetch_rows(&sql, params.values()).await?);

    notices.push(format!("Deleted {} row(s) from {}", ids.len(), command.table));
    Ok(DmlOutcome::Delete {
        name: command.name.clone(),
        table: command.table.clone(),
        ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDatabase;
    use serde_json::json;

    fn op(value: Value) -> DmlOperation {
        DmlOperation::from_value(value).unwrap()
    }

    async fn run(db: &MockDatabase, operation: Value) -> Result<DmlOutcome> {
        let mut tx = db.transaction();
        let mut notices = PostCommit::new();
        apply(&mut tx, &op(operation), &mut notices).await
    }

    fn users() -> MockDatabase {
        let db = MockDatabase::new();
        db.register("users", &[("email", "text", true), ("count", "integer", false)]);
        db
    }

    #[tokio::test]
    async fn test_select_builds_bound_query() {
        let db = users();
        db.push_rows(vec![json!({"id": 1, "email": "a@b.com", "count": 3})]);

        let outcome = run(
            &db,
            json!({
                "operation": "Select",
                "instruction": {
                    "name": "first",
                    "table": "users",
                    "condition": {"email": {"$eq": "{{email}}"}},
                    "orderBy": {"count": "DESC"},
                    "limit": 10,
                    "offset": 20,
                    "params": {"email": "a@b.com"}
                }
            }),
        )
        .await
        .unwrap();

        let (sql, params) = db.last_statement();
        assert_eq!(
            sql,
            "SELECT to_jsonb(\"row$\") AS \"row\" FROM \"users\" AS \"row$\" \
             WHERE \"email\" = $1 ORDER BY \"count\" DESC LIMIT $2 OFFSET $3"
        );
        assert_eq!(
            params,
            vec![
                SqlValue::Text("a@b.com".into()),
                SqlValue::Number(10.into()),
                SqlValue::Number(20.into())
            ]
        );
        assert_eq!(
            outcome,
            DmlOutcome::Select {
                name: Some("first".into()),
                table: "users".into(),
                rows: vec![json!({"id": 1, "email": "a@b.com", "count": 3})],
            }
        );
    }

    #[tokio::test]
    async fn test_select_empty_result_is_ok() {
        let db = users();
        let outcome = run(&db, json!({"operation": "Select", "instruction": {"table": "users"}}))
            .await
            .unwrap();
        assert!(matches!(outcome, DmlOutcome::Select { rows, .. } if rows.is_empty()));
        assert!(db.last_statement().0.ends_with("WHERE 1=1"));
    }

    #[tokio::test]
    async fn test_select_rejects_unknown_columns() {
        let db = users();
        let err = run(
            &db,
            json!({"operation": "Select", "instruction": {"table": "users", "orderBy": {"ghost": "ASC"}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::ColumnNotFound { .. }));

        let err = run(
            &db,
            json!({"operation": "Select", "instruction": {"table": "users", "condition": {"ghost": {"$eq": 1}}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::ColumnNotFound { .. }));

        let err = run(&db, json!({"operation": "Select", "instruction": {"table": "nope"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TableNotFound(_)));
        assert!(db.sql().is_empty());
    }

    #[tokio::test]
    async fn test_condition_operands_are_type_checked() {
        let db = users();
        let err = run(
            &db,
            json!({"operation": "Select", "instruction": {"table": "users", "condition": {"count": {"$in": ["1", "2"]}}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));

        run(
            &db,
            json!({"operation": "Select", "instruction": {"table": "users", "condition": {"id": {"$in": [1, 2]}}}}),
        )
        .await
        .unwrap();
        assert!(db.last_statement().0.contains("\"id\" = ANY($1)"));
    }

    #[tokio::test]
    async fn test_insert_returns_generated_id() {
        let db = users();
        let outcome = run(
            &db,
            json!({"operation": "Insert", "instruction": {"table": "users", "data": {"email": "a@b.com", "count": 1}}}),
        )
        .await
        .unwrap();

        let (sql, params) = db.last_statement();
        assert_eq!(
            sql,
            "INSERT INTO \"users\" AS \"row$\" (\"email\", \"count\") VALUES ($1, $2) \
             RETURNING to_jsonb(\"row$\") AS \"row\""
        );
        assert_eq!(params, vec![SqlValue::Text("a@b.com".into()), SqlValue::Number(1.into())]);

        match outcome {
            DmlOutcome::Insert { id, row, .. } => {
                assert!(id.is_string());
                assert_eq!(row.get("id"), Some(&id));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_validation() {
        let db = users();

        let err = run(
            &db,
            json!({"operation": "Insert", "instruction": {"table": "users", "data": {"email": 42, "count": 1}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));

        let err = run(
            &db,
            json!({"operation": "Insert", "instruction": {"table": "users", "data": {"email": "a@b.com", "count": null}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));

        let err = run(
            &db,
            json!({"operation": "Insert", "instruction": {"table": "users", "data": {"nickname": "x"}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::ColumnNotFound { .. }));

        let err = run(
            &db,
            json!({"operation": "Insert", "instruction": {"table": "users", "data": {"email": "x'; DROP TABLE users; --"}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::SqlInjectionSuspected { .. }));

        assert!(db.sql().is_empty());
    }

    #[tokio::test]
    async fn test_update_prechecks_then_writes() {
        let db = users();
        db.push_rows(vec![json!({"id": 7}), json!({"id": 9})]);

        let outcome = run(
            &db,
            json!({
                "operation": "Update",
                "instruction": {
                    "table": "users",
                    "set": {"email": "c@d.com"},
                    "condition": {"email": {"$eq": "a@b.com"}}
                }
            }),
        )
        .await
        .unwrap();

        let statements = db.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].0,
            "SELECT EXISTS (SELECT 1 FROM \"users\" WHERE \"email\" = $1) AS \"exists\""
        );
        assert_eq!(statements[0].1, vec![SqlValue::Text("a@b.com".into())]);
        assert_eq!(
            statements[1].0,
            "UPDATE \"users\" SET \"email\" = $1 WHERE \"email\" = $2 RETURNING to_jsonb(\"id\") AS \"row\""
        );
        assert_eq!(
            statements[1].1,
            vec![SqlValue::Text("c@d.com".into()), SqlValue::Text("a@b.com".into())]
        );
        assert!(matches!(outcome, DmlOutcome::Update { ids, .. } if ids == vec![json!(7), json!(9)]));
    }

    #[tokio::test]
    async fn test_update_and_delete_without_match() {
        let db = users();
        db.push_exists(false);
        let err = run(
            &db,
            json!({
                "operation": "Update",
                "instruction": {"table": "users", "set": {"count": 2}, "condition": {"count": {"$gt": 100}}}
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::NoMatchingRecord(_)));

        db.push_exists(false);
        let err = run(
            &db,
            json!({"operation": "Delete", "instruction": {"table": "users", "condition": {"count": {"$gt": 100}}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::NoMatchingRecord(_)));

        assert!(db.sql().iter().all(|sql| sql.starts_with("SELECT EXISTS")));
    }

    #[tokio::test]
    async fn test_delete_returns_ids() {
        let db = users();
        db.push_rows(vec![json!(3)]);
        let outcome = run(
            &db,
            json!({"operation": "Delete", "instruction": {"name": "purge", "table": "users", "condition": {"count": {"$lte": 0}}}}),
        )
        .await
        .unwrap();

        assert_eq!(
            db.last_statement().0,
            "DELETE FROM \"users\" WHERE \"count\" <= $1 RETURNING to_jsonb(\"id\") AS \"row\""
        );
        assert_eq!(
            outcome,
            DmlOutcome::Delete { name: Some("purge".into()), table: "users".into(), ids: vec![json!(3)] }
        );
    }

    #[tokio::test]
    async fn test_condition_injection_is_rejected() {
        let db = users();
        let err = run(
            &db,
            json!({
                "operation": "Delete",
                "instruction": {
                    "table": "users",
                    "condition": {"email": {"$eq": "{{who}}"}},
                    "params": {"who": "a' OR '1'='1"}
                }
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::SqlInjectionSuspected { ref column, .. } if column == "email"));
        assert!(db.sql().is_empty());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = DmlOutcome::Update { name: None, table: "users".into(), ids: vec![json!(1)] };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"operation": "Update", "table": "users", "ids": [1]})
        );
    }

    #[tokio::test]
    async fn test_json_column_binds_serialized_document() {
        let db = MockDatabase::new();
        db.register("events", &[("meta", "jsonb", true), ("count", "integer", true)]);

        run(&db, json!({"operation": "Insert", "instruction": {"table": "events", "data": {"meta": "hello"}}}))
            .await
            .unwrap();
        let (_, params) = db.last_statement();
        assert_eq!(params[0].to_text().as_deref(), Some("\"hello\""));

        run(
            &db,
            json!({"operation": "Select", "instruction": {"table": "events", "condition": {"meta": {"$eq": "42"}}}}),
        )
        .await
        .unwrap();
        let (_, params) = db.last_statement();
        assert_eq!(params[0].to_text().as_deref(), Some("\"42\""));
    }

    #[tokio::test]
    async fn test_integer_column_binds_integral_float_as_integer() {
        let db = users();

        run(&db, json!({"operation": "Insert", "instruction": {"table": "users", "data": {"count": 6.0}}}))
            .await
            .unwrap();
        let (_, params) = db.last_statement();
        assert_eq!(params[0].to_text().as_deref(), Some("6"));

        run(
            &db,
            json!({
                "operation": "Update",
                "instruction": {"table": "users", "set": {"count": 8.0}, "condition": {"count": {"$gte": 6.0}}}
            }),
        )
        .await
        .unwrap();
        let values: Vec<_> = db.last_statement().1.iter().filter_map(SqlValue::to_text).collect();
        assert_eq!(values, vec!["8", "6"]);
    }

    #[tokio::test]
    async fn test_select_keeps_suffixed_bindings_apart() {
        let db = MockDatabase::new();
        db.register("pairs", &[("a", "integer", true), ("a_2", "integer", true)]);

        run(
            &db,
            json!({
                "operation": "Select",
                "instruction": {
                    "table": "pairs",
                    "condition": {"$and": [{"a": {"$eq": 1}}, {"a": {"$eq": 2}}, {"a_2": {"$eq": 3}}]}
                }
            }),
        )
        .await
        .unwrap();

        let (sql, params) = db.last_statement();
        assert!(sql.ends_with("WHERE ((\"a\" = $1) AND (\"a\" = $2) AND (\"a_2\" = $3))"));
        let values: Vec<_> = params.iter().filter_map(SqlValue::to_text).collect();
        assert_eq!(values, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_nested_json_strings_are_scanned() {
        let db = MockDatabase::new();
        db.register("events", &[("meta", "jsonb", true)]);

        let err = run(
            &db,
            json!({"operation": "Insert", "instruction": {"table": "events", "data": {"meta": {"note": "x'; DROP"}}}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::SqlInjectionSuspected { ref column, .. } if column == "meta"));
        assert!(db.sql().is_empty());
    }
}
