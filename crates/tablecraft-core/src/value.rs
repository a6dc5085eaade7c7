//! Bound statement parameters
//!
//! Columns are caller-defined, so the Rust type of a parameter is not known
//! when the statement is built. `SqlValue` is sent in PostgreSQL's text
//! format and the server coerces it to whatever type it inferred for the
//! placeholder, the same way a literal typed into psql would be.

use std::error::Error;
use std::fmt;

use bytes::{BufMut, BytesMut};
use serde_json::{Number, Value};
use tokio_postgres::types::{Format, IsNull, ToSql, Type};

use crate::column_type::TypeCategory;

/// Element kind of an array parameter, chosen from its first element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    Integer,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    /// Objects and nested arrays bound to json/jsonb columns.
    Json(Value),
    Array(ArrayKind, Vec<Value>),
}

impl SqlValue {
    /// A scalar parameter. Arrays and objects are bound as JSON documents.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => SqlValue::Number(n.clone()),
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => SqlValue::Json(value.clone()),
        }
    }

    /// A parameter bound to a column of `category`. json/jsonb columns get the
    /// serialized document, integer columns get integral floats as integers.
    pub fn for_column(category: TypeCategory, value: &Value) -> Self {
        match (category, value) {
            (_, Value::Null) => SqlValue::Null,
            (TypeCategory::Json, _) => SqlValue::Json(value.clone()),
            (TypeCategory::Integer, Value::Number(n)) => SqlValue::Number(integral(n)),
            _ => SqlValue::from_json(value),
        }
    }

    /// A single array parameter for `$in`/`$nin`.
    pub fn array(items: &[Value]) -> Self {
        let kind = match items.first() {
            Some(Value::Number(_)) => ArrayKind::Integer,
            _ => ArrayKind::Text,
        };
        SqlValue::Array(kind, items.to_vec())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text-format encoding, `None` for SQL NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Number(n) => Some(n.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Json(v) => Some(v.to_string()),
            SqlValue::Array(kind, items) => Some(array_literal(*kind, items)),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

/// `6.0` as `6`; anything else unchanged.
fn integral(n: &Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n.clone();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Number::from(f as i64),
        _ => n.clone(),
    }
}

/// Builds a PostgreSQL array literal such as `{1,2}` or `{"a","b\"c"}`.
fn array_literal(kind: ArrayKind, items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Number(n) if kind == ArrayKind::Integer => integral(n).to_string(),
            Value::String(s) => quote_element(s),
            other => quote_element(&other.to_string()),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

fn quote_element(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

impl ToSql for SqlValue {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.to_text() {
            Some(text) => {
                out.put_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.to_sql(ty, out)
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_text_encoding() {
        assert_eq!(SqlValue::from_json(&json!(10)).to_text().as_deref(), Some("10"));
        assert_eq!(SqlValue::from_json(&json!(1.5)).to_text().as_deref(), Some("1.5"));
        assert_eq!(SqlValue::from_json(&json!(true)).to_text().as_deref(), Some("true"));
        assert_eq!(SqlValue::from_json(&json!("a@b.com")).to_text().as_deref(), Some("a@b.com"));
        assert_eq!(SqlValue::from_json(&json!(null)).to_text(), None);
        assert_eq!(
            SqlValue::from_json(&json!({"k": [1]})).to_text().as_deref(),
            Some("{\"k\":[1]}")
        );
    }

    #[test]
    fn test_array_kind_follows_first_element() {
        let ints = SqlValue::array(&[json!(1), json!(2), json!(3)]);
        assert!(matches!(ints, SqlValue::Array(ArrayKind::Integer, _)));
        assert_eq!(ints.to_text().as_deref(), Some("{1,2,3}"));

        let texts = SqlValue::array(&[json!("a"), json!("b\"c"), json!(null)]);
        assert!(matches!(texts, SqlValue::Array(ArrayKind::Text, _)));
        assert_eq!(texts.to_text().as_deref(), Some("{\"a\",\"b\\\"c\",NULL}"));

        let empty = SqlValue::array(&[]);
        assert_eq!(empty.to_text().as_deref(), Some("{}"));
    }

    #[test]
    fn test_json_columns_bind_serialized_documents() {
        let hello = SqlValue::for_column(TypeCategory::Json, &json!("hello"));
        assert_eq!(hello.to_text().as_deref(), Some("\"hello\""));

        let quoted_number = SqlValue::for_column(TypeCategory::Json, &json!("42"));
        assert_eq!(quoted_number.to_text().as_deref(), Some("\"42\""));

        let number = SqlValue::for_column(TypeCategory::Json, &json!(42));
        assert_eq!(number.to_text().as_deref(), Some("42"));

        let object = SqlValue::for_column(TypeCategory::Json, &json!({"a": "b"}));
        assert_eq!(object.to_text().as_deref(), Some("{\"a\":\"b\"}"));

        assert!(SqlValue::for_column(TypeCategory::Json, &json!(null)).is_null());
    }

    #[test]
    fn test_integer_columns_drop_integral_fraction() {
        let six = SqlValue::for_column(TypeCategory::Integer, &json!(6.0));
        assert_eq!(six.to_text().as_deref(), Some("6"));

        let seven = SqlValue::for_column(TypeCategory::Integer, &json!(7));
        assert_eq!(seven.to_text().as_deref(), Some("7"));

        let decimal = SqlValue::for_column(TypeCategory::Decimal, &json!(6.0));
        assert_eq!(decimal.to_text().as_deref(), Some("6.0"));

        let text = SqlValue::for_column(TypeCategory::Text, &json!("hello"));
        assert_eq!(text.to_text().as_deref(), Some("hello"));

        let list = SqlValue::array(&[json!(1.0), json!(2)]);
        assert_eq!(list.to_text().as_deref(), Some("{1,2}"));
    }

    #[test]
    fn test_to_sql_writes_text() {
        let mut buf = BytesMut::new();
        let value = SqlValue::Text("hello".into());
        assert!(matches!(value.to_sql(&Type::TEXT, &mut buf).unwrap(), IsNull::No));
        assert_eq!(&buf[..], b"hello");
        assert!(matches!(value.encode_format(&Type::INT4), Format::Text));

        let mut buf = BytesMut::new();
        assert!(matches!(SqlValue::Null.to_sql(&Type::INT4, &mut buf).unwrap(), IsNull::Yes));
    }
}
