//! Declared column types
//!
//! Type names end up interpolated into `ALTER TABLE ... ADD COLUMN`, so they
//! are normalised and checked against a fixed list of PostgreSQL base types
//! before any DDL is built.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CoreError, Result};

lazy_static! {
    static ref TYPE_SHAPE: Regex =
        Regex::new(r"^(?P<base>[a-z][a-z0-9 ]*?)\s*(?P<modifier>\(\s*\d+\s*(,\s*\d+\s*)?\))?$")
            .unwrap();
}

/// How a declared type accepts JSON values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeCategory {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Uuid,
    Json,
    /// Accepted as-is; the database has the final word.
    Other,
}

impl TypeCategory {
    fn of_base(base: &str) -> Option<Self> {
        let category = match base {
            "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" => {
                TypeCategory::Text
            }
            "integer" | "int" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "serial"
            | "bigserial" | "smallserial" => TypeCategory::Integer,
            "decimal" | "numeric" | "real" | "float" | "float4" | "float8"
            | "double precision" => TypeCategory::Decimal,
            "boolean" | "bool" => TypeCategory::Boolean,
            "date" => TypeCategory::Date,
            "timestamp" | "timestamptz" | "timestamp with time zone"
            | "timestamp without time zone" => TypeCategory::Timestamp,
            "uuid" => TypeCategory::Uuid,
            "json" | "jsonb" => TypeCategory::Json,
            "time" | "timetz" | "interval" | "bytea" | "inet" | "cidr" | "macaddr" => {
                TypeCategory::Other
            }
            _ => return None,
        };
        Some(category)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TypeCategory::Text => "a string",
            TypeCategory::Integer => "an integer",
            TypeCategory::Decimal => "a number",
            TypeCategory::Boolean => "a boolean",
            TypeCategory::Date => "a date string",
            TypeCategory::Timestamp => "a timestamp string",
            TypeCategory::Uuid => "a UUID string",
            TypeCategory::Json => "a JSON value",
            TypeCategory::Other => "a value",
        }
    }
}

/// A normalised SQL type name such as `text`, `varchar(255)` or `numeric(10,2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    name: String,
    category: TypeCategory,
}

impl ColumnType {
    /// Normalises the caller's spelling and rejects anything outside the allowlist.
    pub fn parse(raw: &str) -> Result<Self> {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if collapsed.is_empty() {
            return Err(CoreError::InvalidPayload("Column type is missing".into()));
        }

        let normalized = if collapsed == "datetime" {
            "timestamp".to_string()
        } else {
            collapsed
        };

        let caps = TYPE_SHAPE
            .captures(&normalized)
            .ok_or_else(|| CoreError::invalid_value("type", format!("unsupported column type '{}'", raw)))?;
        let base = caps.name("base").map(|m| m.as_str().trim()).unwrap_or_default();
        let category = TypeCategory::of_base(base)
            .ok_or_else(|| CoreError::invalid_value("type", format!("unsupported column type '{}'", raw)))?;

        let name = match caps.name("modifier") {
            Some(modifier) => {
                let digits: String = modifier.as_str().chars().filter(|c| !c.is_whitespace()).collect();
                format!("{}{}", base, digits)
            }
            None => base.to_string(),
        };

        Ok(Self { name, category })
    }

    /// Rebuilds a type from a catalog row. Unknown names fall back to `Other`
    /// so rows written by older deployments stay readable.
    pub fn from_catalog(data_type: &str) -> Self {
        Self::parse(data_type).unwrap_or_else(|_| Self {
            name: data_type.to_string(),
            category: TypeCategory::Other,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> TypeCategory {
        self.category
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A column default as it appears in DDL.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    CurrentTimestamp,
    RandomUuid,
    Literal(Value),
}

impl DefaultValue {
    pub fn from_json(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => {
                let lowered = s.trim().to_lowercase();
                match lowered.as_str() {
                    "now()" | "current_timestamp" => Ok(Some(DefaultValue::CurrentTimestamp)),
                    "gen_random_uuid()" => Ok(Some(DefaultValue::RandomUuid)),
                    _ => Ok(Some(DefaultValue::Literal(value.clone()))),
                }
            }
            Value::Bool(_) | Value::Number(_) => Ok(Some(DefaultValue::Literal(value.clone()))),
            Value::Array(_) | Value::Object(_) => Err(CoreError::invalid_value(
                "default",
                "default must be a scalar value",
            )),
        }
    }

    /// Renders the default as SQL text. String literals are single-quoted with
    /// embedded quotes doubled, so nothing the caller sends escapes the literal.
    pub fn to_sql(&self) -> String {
        match self {
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
            DefaultValue::RandomUuid => "gen_random_uuid()".to_string(),
            DefaultValue::Literal(Value::Bool(true)) => "TRUE".to_string(),
            DefaultValue::Literal(Value::Bool(false)) => "FALSE".to_string(),
            DefaultValue::Literal(Value::Number(n)) => n.to_string(),
            DefaultValue::Literal(Value::String(s)) => quote_literal(s),
            DefaultValue::Literal(other) => quote_literal(&other.to_string()),
        }
    }
}

pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalization() {
        assert_eq!(ColumnType::parse("TEXT").unwrap().name(), "text");
        assert_eq!(ColumnType::parse("datetime").unwrap().name(), "timestamp");
        assert_eq!(ColumnType::parse("  VarChar ( 255 ) ").unwrap().name(), "varchar(255)");
        assert_eq!(ColumnType::parse("numeric(10, 2)").unwrap().name(), "numeric(10,2)");
        assert_eq!(
            ColumnType::parse("timestamp   with time zone").unwrap().category(),
            TypeCategory::Timestamp
        );
        assert_eq!(ColumnType::parse("integer").unwrap().category(), TypeCategory::Integer);
    }

    #[test]
    fn test_rejects_unknown_and_hostile_types() {
        assert!(ColumnType::parse("").is_err());
        assert!(ColumnType::parse("blob").is_err());
        assert!(ColumnType::parse("text; DROP TABLE users").is_err());
        assert!(ColumnType::parse("text DEFAULT 1").is_err());
        assert!(ColumnType::parse("varchar(10) --").is_err());
    }

    #[test]
    fn test_catalog_fallback() {
        let ty = ColumnType::from_catalog("geometry");
        assert_eq!(ty.category(), TypeCategory::Other);
        assert_eq!(ty.name(), "geometry");
    }

    #[test]
    fn test_default_rendering() {
        let now = DefaultValue::from_json(&json!("now()")).unwrap().unwrap();
        assert_eq!(now.to_sql(), "CURRENT_TIMESTAMP");

        let zero = DefaultValue::from_json(&json!(0)).unwrap().unwrap();
        assert_eq!(zero.to_sql(), "0");

        let quoted = DefaultValue::from_json(&json!("it's")).unwrap().unwrap();
        assert_eq!(quoted.to_sql(), "'it''s'");

        assert!(DefaultValue::from_json(&json!(null)).unwrap().is_none());
        assert!(DefaultValue::from_json(&json!({"a": 1})).is_err());
    }
}
