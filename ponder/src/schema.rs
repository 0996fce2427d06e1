// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The user's table/enum schema and the dynamically typed values that flow
//! through the indexing store.
//!
//! Column types form a tagged sum (scalar | enum | reference) with `optional`
//! and `list` as outer modifiers. References are opaque: the engine never
//! follows them during ingestion, it only type-checks them against the
//! referenced table's `id` column.

use std::collections::{BTreeMap, BTreeSet};

use ethers::types::I256;
use serde::{Deserialize, Serialize};

use crate::error::{PonderError, PonderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scalar {
    String,
    BigInt,
    Int,
    Float,
    Boolean,
    Bytes,
}

impl Scalar {
    /// Scalars allowed for the mandatory `id` column.
    pub fn valid_id_type(&self) -> bool {
        matches!(
            self,
            Scalar::String | Scalar::BigInt | Scalar::Int | Scalar::Bytes
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ColumnType {
    Scalar {
        scalar: Scalar,
    },
    Enum {
        // Serialized as "enum": this variant is flattened into `Column`,
        // which already has a "name" key.
        #[serde(rename = "enum")]
        name: String,
    },
    /// `table` is the referenced table; the stored value has the type of
    /// that table's `id` column.
    Reference {
        table: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub list: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    /// Includes the `id` column.
    pub columns: Vec<Column>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn id_column(&self) -> Option<&Column> {
        self.column("id")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: BTreeMap<String, Table>,
    pub enums: BTreeMap<String, EnumDef>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn table(&self, name: &str) -> PonderResult<&Table> {
        self.tables.get(name).ok_or_else(|| {
            PonderError::SchemaViolation(format!("table '{name}' does not exist in the schema"))
        })
    }

    /// Validate the full schema. Every violation carries a message precise
    /// enough to point the user at the offending column.
    pub fn validate(&self) -> PonderResult<()> {
        for name in self.tables.keys() {
            if self.enums.contains_key(name) {
                return Err(PonderError::SchemaViolation(format!(
                    "name '{name}' is used by both a table and an enum"
                )));
            }
        }
        for (name, def) in &self.enums {
            if !valid_name(name) {
                return Err(PonderError::SchemaViolation(format!(
                    "enum name '{name}' must match ^[A-Za-z0-9]+$"
                )));
            }
            let mut seen = BTreeSet::new();
            for value in &def.values {
                if !seen.insert(value) {
                    return Err(PonderError::SchemaViolation(format!(
                        "enum '{name}' has duplicate value '{value}'"
                    )));
                }
            }
        }
        for (name, table) in &self.tables {
            if !valid_name(name) {
                return Err(PonderError::SchemaViolation(format!(
                    "table name '{name}' must match ^[A-Za-z0-9]+$"
                )));
            }
            let id = table.id_column().ok_or_else(|| {
                PonderError::SchemaViolation(format!("table '{name}' is missing an 'id' column"))
            })?;
            match &id.column_type {
                ColumnType::Scalar { scalar } if scalar.valid_id_type() => {}
                _ => {
                    return Err(PonderError::SchemaViolation(format!(
                        "table '{name}': 'id' must be a string, bigint, int or bytes scalar"
                    )))
                }
            }
            if id.optional || id.list {
                return Err(PonderError::SchemaViolation(format!(
                    "table '{name}': 'id' cannot be optional or a list"
                )));
            }
            let mut seen = BTreeSet::new();
            for column in &table.columns {
                if !valid_name(&column.name) {
                    return Err(PonderError::SchemaViolation(format!(
                        "table '{name}': column name '{}' must match ^[A-Za-z0-9]+$",
                        column.name
                    )));
                }
                if !seen.insert(&column.name) {
                    return Err(PonderError::SchemaViolation(format!(
                        "table '{name}' has duplicate column '{}'",
                        column.name
                    )));
                }
                match &column.column_type {
                    ColumnType::Scalar { .. } => {}
                    ColumnType::Enum { name: enum_name } => {
                        if !self.enums.contains_key(enum_name) {
                            return Err(PonderError::SchemaViolation(format!(
                                "table '{name}': column '{}' references unknown enum '{enum_name}'",
                                column.name
                            )));
                        }
                    }
                    ColumnType::Reference { table: target } => {
                        if column.list {
                            return Err(PonderError::SchemaViolation(format!(
                                "table '{name}': column '{}' cannot be both a list and a reference",
                                column.name
                            )));
                        }
                        if !self.tables.contains_key(target) {
                            return Err(PonderError::SchemaViolation(format!(
                                "table '{name}': column '{}' references unknown table '{target}'",
                                column.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The scalar a column's stored values must have. Resolves references to
    /// the target table's `id` type; enums are strings.
    pub fn storage_scalar(&self, column: &Column) -> PonderResult<Scalar> {
        match &column.column_type {
            ColumnType::Scalar { scalar } => Ok(*scalar),
            ColumnType::Enum { .. } => Ok(Scalar::String),
            ColumnType::Reference { table } => {
                let target = self.table(table)?;
                let id = target.id_column().ok_or_else(|| {
                    PonderError::SchemaViolation(format!("table '{table}' is missing 'id'"))
                })?;
                match &id.column_type {
                    ColumnType::Scalar { scalar } => Ok(*scalar),
                    _ => Err(PonderError::SchemaViolation(format!(
                        "table '{table}': 'id' must be a scalar"
                    ))),
                }
            }
        }
    }

    /// Stable textual form used for the lock row and the build ID. BTreeMap
    /// iteration gives deterministic ordering.
    pub fn to_stable_json(&self) -> String {
        serde_json::to_string(self).expect("schema serialization is infallible")
    }

    pub fn from_json(json: &str) -> PonderResult<Schema> {
        serde_json::from_str(json)
            .map_err(|e| PonderError::SchemaViolation(format!("malformed schema json: {e}")))
    }
}

#[derive(Default)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn enumeration(mut self, name: &str, values: &[&str]) -> Self {
        self.schema.enums.insert(
            name.to_string(),
            EnumDef {
                name: name.to_string(),
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        );
        self
    }

    pub fn table(mut self, name: &str, build: impl FnOnce(TableBuilder) -> TableBuilder) -> Self {
        let builder = build(TableBuilder {
            table: Table {
                name: name.to_string(),
                columns: Vec::new(),
            },
        });
        self.schema.tables.insert(name.to_string(), builder.table);
        self
    }

    pub fn build(self) -> PonderResult<Schema> {
        self.schema.validate()?;
        Ok(self.schema)
    }
}

pub struct TableBuilder {
    table: Table,
}

impl TableBuilder {
    pub fn id(self, scalar: Scalar) -> Self {
        self.push("id", ColumnType::Scalar { scalar }, false, false)
    }

    pub fn column(self, name: &str, scalar: Scalar) -> Self {
        self.push(name, ColumnType::Scalar { scalar }, false, false)
    }

    pub fn optional_column(self, name: &str, scalar: Scalar) -> Self {
        self.push(name, ColumnType::Scalar { scalar }, true, false)
    }

    pub fn list_column(self, name: &str, scalar: Scalar) -> Self {
        self.push(name, ColumnType::Scalar { scalar }, false, true)
    }

    pub fn enum_column(self, name: &str, enum_name: &str) -> Self {
        self.push(
            name,
            ColumnType::Enum {
                name: enum_name.to_string(),
            },
            false,
            false,
        )
    }

    pub fn reference_column(self, name: &str, table: &str) -> Self {
        self.push(
            name,
            ColumnType::Reference {
                table: table.to_string(),
            },
            false,
            false,
        )
    }

    pub fn optional_reference_column(self, name: &str, table: &str) -> Self {
        self.push(
            name,
            ColumnType::Reference {
                table: table.to_string(),
            },
            true,
            false,
        )
    }

    fn push(mut self, name: &str, column_type: ColumnType, optional: bool, list: bool) -> Self {
        self.table.columns.push(Column {
            name: name.to_string(),
            column_type,
            optional,
            list,
        });
        self
    }
}

/// A dynamically typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    BigInt(I256),
    Int(i64),
    Float(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Null,
}

impl Value {
    /// Stable string form used for primary keys and pagination cursors.
    pub fn as_key(&self) -> PonderResult<String> {
        match self {
            Value::String(s) => Ok(s.clone()),
            Value::BigInt(v) => Ok(crate::bigint::encode_i256(*v)),
            Value::Int(v) => Ok(v.to_string()),
            Value::Bytes(b) => Ok(format!("0x{}", hex::encode(b))),
            other => Err(PonderError::SchemaViolation(format!(
                "value {other:?} cannot be used as a row id"
            ))),
        }
    }

    /// Tagged JSON form used in the revert log and for list columns.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::json!({ "t": "string", "v": s }),
            Value::BigInt(v) => serde_json::json!({ "t": "bigint", "v": v.to_string() }),
            Value::Int(v) => serde_json::json!({ "t": "int", "v": v }),
            Value::Float(v) => serde_json::json!({ "t": "float", "v": v }),
            Value::Boolean(v) => serde_json::json!({ "t": "boolean", "v": v }),
            Value::Bytes(b) => serde_json::json!({ "t": "bytes", "v": format!("0x{}", hex::encode(b)) }),
            Value::List(items) => {
                let items: Vec<serde_json::Value> = items.iter().map(Value::to_json).collect();
                serde_json::json!({ "t": "list", "v": items })
            }
            Value::Null => serde_json::json!({ "t": "null" }),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> PonderResult<Value> {
        let malformed = || PonderError::Database(format!("malformed value json: {json}"));
        let tag = json.get("t").and_then(|t| t.as_str()).ok_or_else(malformed)?;
        match tag {
            "string" => Ok(Value::String(
                json.get("v").and_then(|v| v.as_str()).ok_or_else(malformed)?.to_string(),
            )),
            "bigint" => {
                let s = json.get("v").and_then(|v| v.as_str()).ok_or_else(malformed)?;
                I256::from_dec_str(s).map(Value::BigInt).map_err(|_| malformed())
            }
            "int" => Ok(Value::Int(
                json.get("v").and_then(|v| v.as_i64()).ok_or_else(malformed)?,
            )),
            "float" => Ok(Value::Float(
                json.get("v").and_then(|v| v.as_f64()).ok_or_else(malformed)?,
            )),
            "boolean" => Ok(Value::Boolean(
                json.get("v").and_then(|v| v.as_bool()).ok_or_else(malformed)?,
            )),
            "bytes" => {
                let s = json.get("v").and_then(|v| v.as_str()).ok_or_else(malformed)?;
                hex::decode(s.trim_start_matches("0x"))
                    .map(Value::Bytes)
                    .map_err(|_| malformed())
            }
            "list" => {
                let items = json.get("v").and_then(|v| v.as_array()).ok_or_else(malformed)?;
                items.iter().map(Value::from_json).collect::<PonderResult<Vec<_>>>().map(Value::List)
            }
            "null" => Ok(Value::Null),
            _ => Err(malformed()),
        }
    }
}

/// A row as seen by indexing functions: column name → value. The `id` value
/// travels separately in most store operations.
pub type Row = BTreeMap<String, Value>;

pub fn row_to_json(row: &Row) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> =
        row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    serde_json::Value::Object(map)
}

pub fn row_from_json(json: &serde_json::Value) -> PonderResult<Row> {
    let object = json
        .as_object()
        .ok_or_else(|| PonderError::Database(format!("malformed row json: {json}")))?;
    object
        .iter()
        .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
        .collect()
}
