//! Raw query gateway
//!
//! Caller-supplied SQL is checked against a short denylist and then sent as
//! is. The denylist is a pattern match over the text, not a parser: it stops
//! the obvious destructive statements and nothing more. Anything that must be
//! safe belongs on the structured DDL/DML path, whose identifiers and values
//! are validated against the catalog.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::{CoreError, Result};
use crate::session::RawStatement;

lazy_static! {
    static ref FORBIDDEN: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\bDROP\s+TABLE\b").unwrap(), "DROP TABLE"),
        (Regex::new(r"(?i)\bALTER\s+").unwrap(), "ALTER"),
        (
            Regex::new(r"(?i)\bDELETE\s+FROM\s+\S+?\s*(;|$)").unwrap(),
            "DELETE without a WHERE clause"
        ),
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RawQueryResult {
    Rows { rows: Vec<Map<String, Value>> },
    Affected { affected: u64 },
}

/// Rejects SQL that matches the denylist.
pub fn check_raw_query(sql: &str) -> Result<()> {
    if sql.trim().is_empty() {
        return Err(CoreError::InvalidPayload("query must not be empty".into()));
    }
    if let Some((_, description)) = FORBIDDEN.iter().find(|(pattern, _)| pattern.is_match(sql)) {
        warn!(pattern = description, "Rejected raw query");
        return Err(CoreError::ForbiddenQuery(description.to_string()));
    }
    Ok(())
}

/// Whether the statement is sent in row-returning mode.
pub fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().trim_start_matches('(').trim_start();
    head.get(..6)
        .map(|word| word.eq_ignore_ascii_case("select"))
        .unwrap_or(false)
}

/// Folds simple-protocol results into the shape the statement asked for.
pub fn collect(sql: &str, statements: Vec<RawStatement>) -> RawQueryResult {
    if returns_rows(sql) {
        let rows = statements
            .into_iter()
            .flat_map(|statement| match statement {
                RawStatement::Rows(rows) => rows,
                RawStatement::Affected(_) => Vec::new(),
            })
            .collect();
        RawQueryResult::Rows { rows }
    } else {
        let affected = statements
            .iter()
            .map(|statement| match statement {
                RawStatement::Rows(rows) => rows.len() as u64,
                RawStatement::Affected(count) => *count,
            })
            .sum();
        RawQueryResult::Affected { affected }
    }
}
