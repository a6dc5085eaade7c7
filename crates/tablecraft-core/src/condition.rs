//! Condition trees and WHERE-clause compilation
//!
//! A condition arrives as JSON:
//!
//! ```text
//! { "$and": [...] } | { "$or": [...] } | { "<column>": { "$eq": <value> } }
//! ```
//!
//! and is parsed once into [`Condition`]. Compilation never interpolates an
//! operand into the SQL text: every operand goes through a [`ParamSink`],
//! which hands back the placeholder to splice in.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::{Map, Value};

use crate::column_type::TypeCategory;
use crate::errors::{CoreError, Result};
use crate::validation::{ensure_identifier, json_kind};
use crate::value::{ArrayKind, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl Operator {
    pub fn parse(key: &str) -> Option<Self> {
        let op = match key {
            "$eq" => Operator::Eq,
            "$neq" => Operator::Neq,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            _ => return None,
        };
        Some(op)
    }

    pub fn key(&self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Neq => "$neq",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::In => "$in",
            Operator::Nin => "$nin",
        }
    }

    /// SQL token placed between the column and the placeholder. Membership
    /// tests take the whole list as one array parameter.
    pub fn sql_token(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "= ANY",
            Operator::Nin => "<> ALL",
        }
    }

    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::Nin)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    /// `{{name}}`, looked up in the instruction's `params` at compile time.
    Template(String),
}

impl Operand {
    fn parse(value: &Value) -> Self {
        if let Value::String(s) = value {
            if s.len() >= 4 && s.starts_with("{{") && s.ends_with("}}") {
                return Operand::Template(s[2..s.len() - 2].trim().to_string());
            }
        }
        Operand::Value(value.clone())
    }

    /// Resolves templates against `params`; a missing key resolves to null.
    pub fn resolve(&self, params: &Map<String, Value>) -> Value {
        match self {
            Operand::Value(value) => value.clone(),
            Operand::Template(name) => params.get(name).cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: String,
    pub operator: Operator,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Compare(Comparison),
}

impl Default for Condition {
    fn default() -> Self {
        Condition::And(Vec::new())
    }
}

impl Condition {
    /// Parses a JSON condition. An object with several keys is the
    /// conjunction of its entries; an empty object matches every row.
    pub fn parse(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| CoreError::InvalidPayload(format!("condition must be an object, got {}", json_kind(value))))?;

        let mut parts = Vec::new();
        for (key, entry) in object {
            match key.as_str() {
                "$and" => parts.push(Condition::And(Self::parse_children(key, entry)?)),
                "$or" => parts.push(Condition::Or(Self::parse_children(key, entry)?)),
                other if other.starts_with('$') => {
                    return Err(CoreError::InvalidPayload(format!(
                        "unknown logical operator '{}'",
                        other
                    )))
                }
                column => parts.extend(Self::parse_leaf(column, entry)?),
            }
        }

        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(Condition::And(parts))
        }
    }

    fn parse_children(key: &str, entry: &Value) -> Result<Vec<Condition>> {
        let items = entry
            .as_array()
            .ok_or_else(|| CoreError::InvalidPayload(format!("{} expects a list of conditions", key)))?;
        items.iter().map(Self::parse).collect()
    }

    fn parse_leaf(column: &str, entry: &Value) -> Result<Vec<Condition>> {
        ensure_identifier("column", column)?;

        let operators = entry.as_object().ok_or_else(|| {
            CoreError::InvalidPayload(format!(
                "condition on '{}' must map an operator to an operand",
                column
            ))
        })?;
        if operators.is_empty() {
            return Err(CoreError::InvalidPayload(format!(
                "condition on '{}' has no operator",
                column
            )));
        }

        operators
            .iter()
            .map(|(key, operand)| {
                let operator = Operator::parse(key).ok_or_else(|| {
                    CoreError::InvalidPayload(format!("unsupported comparison operator '{}'", key))
                })?;
                let operand = Operand::parse(operand);
                if let Operand::Value(value) = &operand {
                    check_operand_shape(column, operator, value)?;
                }
                Ok(Condition::Compare(Comparison {
                    column: column.to_string(),
                    operator,
                    operand,
                }))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Condition::And(children) if children.is_empty())
    }

    /// Every leaf comparison, depth first.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect_comparisons(&mut out);
        out
    }

    fn collect_comparisons<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            Condition::And(children) | Condition::Or(children) => {
                for child in children {
                    child.collect_comparisons(out);
                }
            }
            Condition::Compare(comparison) => out.push(comparison),
        }
    }

    /// Compiles the tree to a WHERE-clause body, binding operands through `sink`.
    pub fn compile(&self, sink: &mut dyn ParamSink, params: &Map<String, Value>) -> Result<String> {
        self.compile_typed(sink, params, &Untyped)
    }

    /// Like [`Condition::compile`], encoding each operand for its column's type.
    pub fn compile_typed(
        &self,
        sink: &mut dyn ParamSink,
        params: &Map<String, Value>,
        types: &dyn ColumnTypes,
    ) -> Result<String> {
        let mut compiler = Compiler { sink, params, types };
        compiler.compile_at(self, 0)
    }
}

/// Column type lookup used to encode operands.
pub trait ColumnTypes {
    fn category(&self, column: &str) -> Option<TypeCategory>;
}

struct Untyped;

impl ColumnTypes for Untyped {
    fn category(&self, _column: &str) -> Option<TypeCategory> {
        None
    }
}

struct Compiler<'a, 's> {
    sink: &'a mut (dyn ParamSink + 's),
    params: &'a Map<String, Value>,
    types: &'a dyn ColumnTypes,
}

impl Compiler<'_, '_> {
    fn compile_at(&mut self, condition: &Condition, depth: usize) -> Result<String> {
        match condition {
            Condition::And(children) if children.is_empty() => Ok("1=1".to_string()),
            Condition::Or(children) if children.is_empty() => Ok("1=0".to_string()),
            Condition::And(children) => self.join(children, " AND ", depth),
            Condition::Or(children) => self.join(children, " OR ", depth),
            Condition::Compare(comparison) => self.comparison(comparison, depth),
        }
    }

    fn join(&mut self, children: &[Condition], separator: &str, depth: usize) -> Result<String> {
        let mut clauses = Vec::with_capacity(children.len());
        for child in children {
            clauses.push(format!("({})", self.compile_at(child, depth + 1)?));
        }
        Ok(format!("({})", clauses.join(separator)))
    }

    fn comparison(&mut self, comparison: &Comparison, depth: usize) -> Result<String> {
        let column = &comparison.column;
        let operator = comparison.operator;
        let value = comparison.operand.resolve(self.params);
        check_operand_shape(column, operator, &value)?;

        match (&value, operator) {
            (Value::Null, Operator::Eq) => return Ok(format!("\"{}\" IS NULL", column)),
            (Value::Null, Operator::Neq) => return Ok(format!("\"{}\" IS NOT NULL", column)),
            _ => {}
        }

        if operator.takes_list() {
            let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
            let placeholder = self.sink.bind(depth, column, SqlValue::array(items));
            Ok(format!("\"{}\" {}({})", column, operator.sql_token(), placeholder))
        } else {
            let bound = match self.types.category(column) {
                Some(category) => SqlValue::for_column(category, &value),
                None => SqlValue::from_json(&value),
            };
            let placeholder = self.sink.bind(depth, column, bound);
            Ok(format!("\"{}\" {} {}", column, operator.sql_token(), placeholder))
        }
    }
}

fn check_operand_shape(column: &str, operator: Operator, value: &Value) -> Result<()> {
    if operator.takes_list() {
        let items = value.as_array().ok_or_else(|| {
            CoreError::invalid_value(column, format!("{} expects an array, got {}", operator, json_kind(value)))
        })?;
        let kind = match items.first() {
            Some(Value::Number(_)) => ArrayKind::Integer,
            _ => ArrayKind::Text,
        };
        for item in items {
            let fits = matches!(
                (kind, item),
                (_, Value::Null)
                    | (ArrayKind::Integer, Value::Number(_))
                    | (ArrayKind::Text, Value::String(_) | Value::Bool(_))
            );
            if !fits {
                return Err(CoreError::invalid_value(
                    column,
                    format!("{} elements must share one scalar type", operator),
                ));
            }
        }
        return Ok(());
    }

    match value {
        Value::Array(_) | Value::Object(_) => Err(CoreError::invalid_value(
            column,
            format!("{} expects a scalar, got {}", operator, json_kind(value)),
        )),
        Value::Null if !matches!(operator, Operator::Eq | Operator::Neq) => Err(
            CoreError::invalid_value(column, format!("{} cannot compare against null", operator)),
        ),
        _ => Ok(()),
    }
}

/// Receives bound operands and returns the placeholder text for each.
pub trait ParamSink {
    fn bind(&mut self, depth: usize, column: &str, value: SqlValue) -> String;
}

/// `$1, $2, ...` placeholders. Starts numbering after any values already held,
/// so an UPDATE can bind its SET list first.
#[derive(Debug, Default)]
pub struct PositionalParams {
    values: Vec<SqlValue>,
}

impl PositionalParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn push(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

impl ParamSink for PositionalParams {
    fn bind(&mut self, _depth: usize, _column: &str, value: SqlValue) -> String {
        self.push(value)
    }
}

/// `:param_<depth>_<column>` placeholders. A name already taken gets the
/// lowest free numeric suffix, so no two bindings ever share a placeholder.
#[derive(Debug, Default)]
pub struct NamedParams {
    entries: Vec<(String, SqlValue)>,
    taken: HashSet<String>,
}

impl NamedParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a value under an explicit name, e.g. `limit`.
    pub fn insert(&mut self, name: &str, value: SqlValue) -> String {
        let mut unique = name.to_string();
        let mut suffix = 1;
        while self.taken.contains(&unique) {
            suffix += 1;
            unique = format!("{}_{}", name, suffix);
        }
        self.taken.insert(unique.clone());
        self.entries.push((unique.clone(), value));
        format!(":{}", unique)
    }

    pub fn entries(&self) -> &[(String, SqlValue)] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.entries.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    /// Rewrites `:name` placeholders to `$n` for drivers that only speak
    /// positional parameters. Quoted identifiers and string literals are
    /// copied through untouched.
    pub fn into_positional(self, sql: &str) -> (String, Vec<SqlValue>) {
        let lookup: HashMap<&str, &SqlValue> =
            self.entries.iter().map(|(key, value)| (key.as_str(), value)).collect();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut values = Vec::new();
        let mut out = String::with_capacity(sql.len());

        let chars: Vec<char> = sql.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '"' || c == '\'' {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != c {
                    i += 1;
                }
                let end = (i + 1).min(chars.len());
                out.extend(&chars[start..end]);
                i = end;
                continue;
            }

            if c == ':' && i + 1 < chars.len() && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_') {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                if let Some(value) = lookup.get(name.as_str()) {
                    let position = *positions.entry(name).or_insert_with(|| {
                        values.push((*value).clone());
                        values.len()
                    });
                    out.push_str(&format!("${}", position));
                    i = end;
                    continue;
                }
            }

            out.push(c);
            i += 1;
        }

        (out, values)
    }
}

impl ParamSink for NamedParams {
    fn bind(&mut self, depth: usize, column: &str, value: SqlValue) -> String {
        self.insert(&format!("param_{}_{}", depth, column), value)
    }
}
