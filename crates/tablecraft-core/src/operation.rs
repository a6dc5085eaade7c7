//! Operation descriptors
//!
//! Wire descriptors are deserialized as-is and then converted into the closed
//! [`DdlOperation`] / [`DmlOperation`] enums. Everything the handlers match on
//! is typed; shape problems surface here as `InvalidPayload`.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::column_type::{ColumnType, DefaultValue};
use crate::condition::Condition;
use crate::errors::{CoreError, Result};
use crate::validation::json_kind;

/// `{operation, resource, migration}` as sent by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct DdlDescriptor {
    pub operation: String,
    pub resource: String,
    #[serde(default)]
    pub migration: Migration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub name: Option<String>,
    pub table: Option<String>,
    /// Either a column name or `{type, definition}`.
    pub column: Option<Value>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub primary_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryKeyKind {
    #[default]
    Uuid,
    Serial,
}

impl PrimaryKeyKind {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(|s| s.trim().to_lowercase()) {
            None => Ok(PrimaryKeyKind::Uuid),
            Some(kind) if kind == "uuid" => Ok(PrimaryKeyKind::Uuid),
            Some(kind) if kind == "serial" => Ok(PrimaryKeyKind::Serial),
            Some(other) => Err(CoreError::invalid_value(
                "primaryKey",
                format!("expected 'uuid' or 'serial', got '{}'", other),
            )),
        }
    }

    pub fn column_sql(&self) -> &'static str {
        match self {
            PrimaryKeyKind::Uuid => "id UUID PRIMARY KEY DEFAULT gen_random_uuid()",
            PrimaryKeyKind::Serial => "id SERIAL PRIMARY KEY",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub data_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub primary: bool,
    pub default: Option<DefaultValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultChange {
    Set(DefaultValue),
    Drop,
}

/// Column changes requested by Alter-Column. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnAlteration {
    pub nullable: Option<bool>,
    pub unique: Option<bool>,
    pub default: Option<DefaultChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DdlOperation {
    CreateTable {
        name: String,
        primary_key: PrimaryKeyKind,
    },
    CreateColumn {
        table: String,
        column: String,
        definition: ColumnDefinition,
    },
    AlterTable {
        from: String,
        to: String,
    },
    AlterColumn {
        table: String,
        from: String,
        to: String,
        changes: ColumnAlteration,
    },
    DropColumn {
        table: String,
        column: String,
    },
    DropTable {
        name: String,
    },
}

impl DdlOperation {
    /// `Create-Table`, `Alter-Column`, ...
    pub fn label(&self) -> &'static str {
        match self {
            DdlOperation::CreateTable { .. } => "Create-Table",
            DdlOperation::CreateColumn { .. } => "Create-Column",
            DdlOperation::AlterTable { .. } => "Alter-Table",
            DdlOperation::AlterColumn { .. } => "Alter-Column",
            DdlOperation::DropColumn { .. } => "Drop-Column",
            DdlOperation::DropTable { .. } => "Drop-Table",
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let descriptor: DdlDescriptor = serde_json::from_value(value)
            .map_err(|e| CoreError::InvalidPayload(format!("malformed DDL operation: {}", e)))?;
        Self::try_from(descriptor)
    }
}

fn required(field: Option<String>, what: &str) -> Result<String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(CoreError::InvalidPayload(format!("{} is missing", what))),
    }
}

fn bool_field(object: &Map<String, Value>, key: &str) -> Result<Option<bool>> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(CoreError::InvalidPayload(format!(
            "definition.{} must be a boolean, got {}",
            key,
            json_kind(other)
        ))),
    }
}

/// Splits a column object into its type and its definition map. Definition
/// keys are read from `definition`, falling back to the column object itself.
fn column_object(column: Option<Value>) -> Result<(Option<String>, Map<String, Value>)> {
    let object = match column {
        None | Some(Value::Null) => return Ok((None, Map::new())),
        Some(Value::Object(object)) => object,
        Some(other) => {
            return Err(CoreError::InvalidPayload(format!(
                "column must be an object with a type, got {}",
                json_kind(&other)
            )))
        }
    };

    let data_type = match object.get("type") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(CoreError::InvalidPayload(format!(
                "column type must be a string, got {}",
                json_kind(other)
            )))
        }
    };

    let mut definition = object.clone();
    definition.remove("type");
    definition.remove("definition");
    match object.get("definition") {
        None | Some(Value::Null) => {}
        Some(Value::Object(nested)) => {
            for (key, value) in nested {
                definition.insert(key.clone(), value.clone());
            }
        }
        Some(other) => {
            return Err(CoreError::InvalidPayload(format!(
                "column definition must be an object, got {}",
                json_kind(other)
            )))
        }
    }

    Ok((data_type, definition))
}

impl TryFrom<DdlDescriptor> for DdlOperation {
    type Error = CoreError;

    fn try_from(descriptor: DdlDescriptor) -> Result<Self> {
        let migration = descriptor.migration;
        let key = format!("{}-{}", descriptor.operation, descriptor.resource);

        match key.as_str() {
            "Create-Table" => Ok(DdlOperation::CreateTable {
                name: required(migration.name, "Table name")?,
                primary_key: PrimaryKeyKind::parse(migration.primary_key.as_deref())?,
            }),
            "Create-Column" => {
                let table = required(migration.table, "Table name")?;
                let column = required(migration.name, "Column name")?;
                if migration.column.is_none() {
                    return Err(CoreError::InvalidPayload(
                        "Column definition is missing".into(),
                    ));
                }
                let (data_type, definition) = column_object(migration.column)?;
                let data_type = ColumnType::parse(data_type.as_deref().unwrap_or_default())?;
                let default = match definition.get("default") {
                    None => None,
                    Some(value) => DefaultValue::from_json(value)?,
                };
                Ok(DdlOperation::CreateColumn {
                    table,
                    column,
                    definition: ColumnDefinition {
                        data_type,
                        nullable: bool_field(&definition, "nullable")?.unwrap_or(true),
                        unique: bool_field(&definition, "unique")?.unwrap_or(false),
                        primary: bool_field(&definition, "primary")?.unwrap_or(false),
                        default,
                    },
                })
            }
            "Alter-Table" => Ok(DdlOperation::AlterTable {
                from: required(migration.from, "Source table name")?,
                to: required(migration.to, "Target table name")?,
            }),
            "Alter-Column" => {
                let table = required(migration.table, "Table name")?;
                let from = required(migration.from, "Source column name")?;
                let to = required(migration.to, "Target column name")?;
                let (_, definition) = column_object(migration.column)?;
                let default = match definition.get("default") {
                    None => None,
                    Some(Value::Null) => Some(DefaultChange::Drop),
                    Some(value) => DefaultValue::from_json(value)?.map(DefaultChange::Set),
                };
                Ok(DdlOperation::AlterColumn {
                    table,
                    from,
                    to,
                    changes: ColumnAlteration {
                        nullable: bool_field(&definition, "nullable")?,
                        unique: bool_field(&definition, "unique")?,
                        default,
                    },
                })
            }
            "Drop-Column" => {
                let table = required(migration.table, "Table name")?;
                let column = match migration.column {
                    Some(Value::String(name)) => name,
                    None => required(migration.name, "Column name")?,
                    Some(other) => {
                        return Err(CoreError::InvalidPayload(format!(
                            "column to drop must be a name, got {}",
                            json_kind(&other)
                        )))
                    }
                };
                Ok(DdlOperation::DropColumn { table, column })
            }
            "Drop-Table" => Ok(DdlOperation::DropTable {
                name: required(migration.name, "Table name")?,
            }),
            _ => Err(CoreError::UnsupportedOperation(key)),
        }
    }
}

/// `{operation, instruction}` as sent by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct DmlDescriptor {
    pub operation: String,
    #[serde(default)]
    pub instruction: Instruction,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    pub name: Option<String>,
    pub table: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub set: Option<Map<String, Value>>,
    pub condition: Option<Value>,
    pub order_by: Option<Map<String, Value>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn parse(column: &str, value: &Value) -> Result<Self> {
        match value.as_str().map(|s| s.to_uppercase()).as_deref() {
            Some("ASC") => Ok(SortDirection::Asc),
            Some("DESC") => Ok(SortDirection::Desc),
            _ => Err(CoreError::invalid_value(
                column,
                format!("sort direction must be ASC or DESC, got {}", value),
            )),
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub name: Option<String>,
    pub table: String,
    pub condition: Condition,
    pub order_by: Vec<(String, SortDirection)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub name: Option<String>,
    pub table: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommand {
    pub name: Option<String>,
    pub table: String,
    pub set: Map<String, Value>,
    pub condition: Condition,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCommand {
    pub name: Option<String>,
    pub table: String,
    pub condition: Condition,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DmlOperation {
    Select(SelectQuery),
    Insert(InsertCommand),
    Update(UpdateCommand),
    Delete(DeleteCommand),
}

impl DmlOperation {
    pub fn label(&self) -> &'static str {
        match self {
            DmlOperation::Select(_) => "Select",
            DmlOperation::Insert(_) => "Insert",
            DmlOperation::Update(_) => "Update",
            DmlOperation::Delete(_) => "Delete",
        }
    }

    pub fn table(&self) -> &str {
        match self {
            DmlOperation::Select(q) => &q.table,
            DmlOperation::Insert(c) => &c.table,
            DmlOperation::Update(c) => &c.table,
            DmlOperation::Delete(c) => &c.table,
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let descriptor: DmlDescriptor = serde_json::from_value(value)
            .map_err(|e| CoreError::InvalidPayload(format!("malformed DML operation: {}", e)))?;
        Self::try_from(descriptor)
    }
}

fn non_negative(field: &str, value: Option<i64>) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(n) if n >= 0 => Ok(Some(n as u64)),
        Some(n) => Err(CoreError::invalid_value(field, format!("must not be negative, got {}", n))),
    }
}

fn parse_condition(condition: Option<Value>, required_for: Option<&str>) -> Result<Condition> {
    match condition {
        Some(value) => Condition::parse(&value),
        None => match required_for {
            Some(operation) => Err(CoreError::InvalidPayload(format!(
                "{} requires a condition; use {{}} to target every row",
                operation
            ))),
            None => Ok(Condition::default()),
        },
    }
}

fn non_empty(map: Option<Map<String, Value>>, what: &str) -> Result<Map<String, Value>> {
    match map {
        Some(map) if !map.is_empty() => Ok(map),
        _ => Err(CoreError::InvalidPayload(format!("{} must not be empty", what))),
    }
}

impl TryFrom<DmlDescriptor> for DmlOperation {
    type Error = CoreError;

    fn try_from(descriptor: DmlDescriptor) -> Result<Self> {
        let instruction = descriptor.instruction;
        let table = required(instruction.table, "Table name")?;

        match descriptor.operation.as_str() {
            "Select" => {
                let order_by = instruction
                    .order_by
                    .unwrap_or_default()
                    .iter()
                    .map(|(column, direction)| Ok((column.clone(), SortDirection::parse(column, direction)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(DmlOperation::Select(SelectQuery {
                    name: instruction.name,
                    table,
                    condition: parse_condition(instruction.condition, None)?,
                    order_by,
                    limit: non_negative("limit", instruction.limit)?,
                    offset: non_negative("offset", instruction.offset)?,
                    params: instruction.params,
                }))
            }
            "Insert" => Ok(DmlOperation::Insert(InsertCommand {
                name: instruction.name,
                table,
                data: non_empty(instruction.data, "Insert data")?,
            })),
            "Update" => Ok(DmlOperation::Update(UpdateCommand {
                name: instruction.name,
                table,
                set: non_empty(instruction.set, "Update set")?,
                condition: parse_condition(instruction.condition, Some("Update"))?,
                params: instruction.params,
            })),
            "Delete" => Ok(DmlOperation::Delete(DeleteCommand {
                name: instruction.name,
                table,
                condition: parse_condition(instruction.condition, Some("Delete"))?,
                params: instruction.params,
            })),
            other => Err(CoreError::UnsupportedOperation(other.to_string())),
        }
    }
}
