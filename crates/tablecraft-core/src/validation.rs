//! Identifier and value validation
//!
//! Identifiers cannot be bound as parameters, so the strict identifier
//! pattern is the only thing standing between a table or column name and the
//! SQL text. Values are always bound, but string values are still scanned for
//! injection signatures and every value is checked against the column's
//! declared type before a statement is built.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::catalog::{ColumnMetadata, COLUMN_CATALOG, TABLE_CATALOG};
use crate::column_type::TypeCategory;
use crate::errors::{CoreError, Result};

/// Name of the primary key column every managed table is created with.
pub const IMPLICIT_PRIMARY_KEY: &str = "id";

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();

    /// Keyword plus operator shapes that show up in tautology and stacked
    /// query payloads.
    static ref KEYWORD_INJECTION: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\b(OR|AND)\b[^=]*=").unwrap(), "a boolean tautology"),
        (Regex::new(r"(?i)\bUNION\b\s+(ALL\s+)?SELECT\b").unwrap(), "a UNION SELECT"),
        (Regex::new(r"(?i)\b(DROP|TRUNCATE|ALTER)\s+TABLE\b").unwrap(), "a schema command"),
        (Regex::new(r"(?i)\bINSERT\s+INTO\b").unwrap(), "an INSERT statement"),
        (Regex::new(r"(?i)\bDELETE\s+FROM\b").unwrap(), "a DELETE statement"),
        (Regex::new(r"(?i)\b(PG_SLEEP|SLEEP|BENCHMARK)\s*\(").unwrap(), "a timing function"),
        (Regex::new(r"(?i)\b(XP_CMDSHELL|EXEC|EXECUTE)\s*\(").unwrap(), "a command function"),
    ];
}

const CHARACTER_SIGNATURES: &[(&str, &str)] = &[
    ("'", "a single quote"),
    ("\"", "a double quote"),
    ("`", "a backtick"),
    (";", "a semicolon"),
    ("--", "a comment sequence"),
    ("/*", "a comment sequence"),
    ("#", "a comment sequence"),
    ("\0", "a null byte"),
];

pub fn valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Rejects `name` unless it is a plain identifier. `what` names the role
/// ("table", "column") for the error message.
pub fn ensure_identifier(what: &str, name: &str) -> Result<()> {
    if valid_identifier(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidIdentifier(format!("{} name '{}'", what, name)))
    }
}

/// Like [`ensure_identifier`], but also refuses the catalog's own tables.
pub fn ensure_table_name(name: &str) -> Result<()> {
    ensure_identifier("table", name)?;
    if name.eq_ignore_ascii_case(TABLE_CATALOG) || name.eq_ignore_ascii_case(COLUMN_CATALOG) {
        return Err(CoreError::InvalidIdentifier(format!("table name '{}' is reserved", name)));
    }
    Ok(())
}

/// Double-quotes an identifier that already passed [`ensure_identifier`].
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Returns a description of the first injection signature found in `value`.
pub fn injection_signature(value: &str) -> Option<&'static str> {
    for (needle, description) in CHARACTER_SIGNATURES {
        if value.contains(needle) {
            return Some(description);
        }
    }

    KEYWORD_INJECTION
        .iter()
        .find(|(pattern, _)| pattern.is_match(value))
        .map(|(_, description)| *description)
}

/// Scans every string inside `value`, descending into arrays and objects.
pub fn scan_value(column: &str, value: &Value) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some(signature) = injection_signature(s) {
                warn!(column, signature, "Rejected value with injection signature");
                return Err(CoreError::SqlInjectionSuspected {
                    column: column.to_string(),
                    signature: signature.to_string(),
                });
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|item| scan_value(column, item)),
        Value::Object(fields) => fields.values().try_for_each(|field| scan_value(column, field)),
        _ => Ok(()),
    }
}

/// Checks a non-null value against a type category.
pub fn value_matches(category: TypeCategory, value: &Value) -> bool {
    match category {
        TypeCategory::Text => value.is_string(),
        TypeCategory::Integer => match value {
            Value::Number(n) => {
                n.is_i64()
                    || n.is_u64()
                    || n.as_f64().map(|f| f.is_finite() && f.fract() == 0.0).unwrap_or(false)
            }
            _ => false,
        },
        TypeCategory::Decimal => value
            .as_f64()
            .map(|f| f.is_finite())
            .unwrap_or(false),
        TypeCategory::Boolean => value.is_boolean(),
        TypeCategory::Date => value.as_str().map(parses_as_date).unwrap_or(false),
        TypeCategory::Timestamp => value.as_str().map(parses_as_timestamp).unwrap_or(false),
        TypeCategory::Uuid => value.as_str().map(is_canonical_uuid).unwrap_or(false),
        TypeCategory::Json => true,
        TypeCategory::Other => !value.is_object(),
    }
}

/// Checks `value` against a registered column: nullability first, then type.
pub fn check_column_value(column: &ColumnMetadata, value: &Value) -> Result<()> {
    if value.is_null() {
        if column.is_nullable {
            return Ok(());
        }
        return Err(CoreError::type_mismatch(
            &column.column_name,
            "column is not nullable",
        ));
    }

    let category = column.column_type().category();
    if value_matches(category, value) {
        Ok(())
    } else {
        Err(CoreError::type_mismatch(
            &column.column_name,
            format!(
                "expected {} for type {}, got {}",
                category.describe(),
                column.data_type,
                json_kind(value)
            ),
        ))
    }
}

/// The implicit primary key is either a UUID or a serial integer; the catalog
/// does not record which, so both shapes are accepted.
pub fn check_primary_key_value(value: &Value) -> Result<()> {
    if value_matches(TypeCategory::Integer, value) || value_matches(TypeCategory::Uuid, value) {
        Ok(())
    } else {
        Err(CoreError::type_mismatch(
            IMPLICIT_PRIMARY_KEY,
            format!("expected an integer or a UUID string, got {}", json_kind(value)),
        ))
    }
}

pub fn is_canonical_uuid(s: &str) -> bool {
    s.len() == 36 && Uuid::try_parse(s).is_ok()
}

fn parses_as_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || parses_as_timestamp(s)
}

fn parses_as_timestamp(s: &str) -> bool {
    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];

    DateTime::parse_from_rfc3339(s).is_ok()
        || DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z").is_ok()
        || NAIVE_FORMATS
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(s, format).is_ok())
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
