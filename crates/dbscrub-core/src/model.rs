use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of relation a model is backed by.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Table,
    PartitionedTable,
    View,
    MaterializedView,
    ForeignTable,
    Other(String),
}

/// Broad field category used to key global type rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    SmallInteger,
    Integer,
    BigInteger,
    Boolean,
    Decimal,
    Float,
    Date,
    Time,
    Timestamp,
    Uuid,
    Json,
    Binary,
    Enum,
    Array,
    Other,
}

impl FieldKind {
    /// Map a Postgres `udt_name` to a field kind.
    pub fn from_udt(udt_name: &str, is_enum: bool) -> Self {
        if is_enum {
            return FieldKind::Enum;
        }
        if udt_name.starts_with('_') {
            return FieldKind::Array;
        }
        match udt_name {
            "text" | "varchar" | "bpchar" | "char" | "citext" | "name" => FieldKind::Text,
            "int2" => FieldKind::SmallInteger,
            "int4" => FieldKind::Integer,
            "int8" => FieldKind::BigInteger,
            "bool" => FieldKind::Boolean,
            "numeric" | "money" => FieldKind::Decimal,
            "float4" | "float8" => FieldKind::Float,
            "date" => FieldKind::Date,
            "time" | "timetz" => FieldKind::Time,
            "timestamp" | "timestamptz" => FieldKind::Timestamp,
            "uuid" => FieldKind::Uuid,
            "json" | "jsonb" => FieldKind::Json,
            "bytea" => FieldKind::Binary,
            _ => FieldKind::Other,
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, FieldKind::Text)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            FieldKind::SmallInteger | FieldKind::Integer | FieldKind::BigInteger
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::SmallInteger => "small_integer",
            FieldKind::Integer => "integer",
            FieldKind::BigInteger => "big_integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Decimal => "decimal",
            FieldKind::Float => "float",
            FieldKind::Date => "date",
            FieldKind::Time => "time",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Uuid => "uuid",
            FieldKind::Json => "json",
            FieldKind::Binary => "binary",
            FieldKind::Enum => "enum",
            FieldKind::Array => "array",
            FieldKind::Other => "other",
        }
    }
}

/// Column metadata for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Formatted Postgres type (e.g. `character varying(255)`).
    pub data_type: String,
    pub max_length: Option<i32>,
    pub is_nullable: bool,
    pub is_unique: bool,
    /// Identity or stored generated column; never written to.
    pub is_generated: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            data_type: data_type.into(),
            max_length: None,
            is_nullable: true,
            is_unique: false,
            is_generated: false,
        }
    }
}

/// Foreign key action semantics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FkAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
    Unknown,
}

/// One-to-many relation pointing at a model from a dependent table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub app_label: String,
    pub model: String,
    /// FK columns on the dependent table.
    pub columns: Vec<String>,
    /// Referenced columns on the parent model.
    pub referenced_columns: Vec<String>,
    pub on_delete: FkAction,
}

impl Relation {
    pub fn label(&self) -> String {
        format!("{}.{}", self.app_label, self.model)
    }
}

/// A table-backed model read from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Postgres schema the table lives in.
    pub app_label: String,
    /// Table name.
    pub name: String,
    pub kind: ModelKind,
    pub primary_key: Vec<String>,
    pub fields: Vec<FieldDescriptor>,
    pub dependents: Vec<Relation>,
}

impl ModelDescriptor {
    pub fn label(&self) -> String {
        format!("{}.{}", self.app_label, self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Views never hold their own rows.
    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, ModelKind::View | ModelKind::MaterializedView)
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.kind, ModelKind::Table | ModelKind::PartitionedTable)
    }

    /// The primary key column when it is a single column.
    pub fn single_primary_key(&self) -> Option<&FieldDescriptor> {
        match self.primary_key.as_slice() {
            [column] => self.field(column),
            _ => None,
        }
    }

    pub fn dependent(&self, label: &str) -> Option<&Relation> {
        self.dependents.iter().find(|relation| relation.label() == label)
    }
}

/// Split `<app_label>.<model_name>` on its last dot.
pub fn parse_model_label(label: &str) -> Result<(&str, &str)> {
    match label.rsplit_once('.') {
        Some((app_label, model)) if !app_label.is_empty() && !model.is_empty() => {
            Ok((app_label, model))
        }
        _ => Err(Error::InvalidModelLabel(label.to_string())),
    }
}

/// Lookup table of every model known for a database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|model| (model.label(), model))
                .collect(),
        }
    }

    pub fn get(&self, label: &str) -> Result<&ModelDescriptor> {
        let (app_label, model) = parse_model_label(label)?;
        self.models
            .get(&format!("{app_label}.{model}"))
            .ok_or_else(|| Error::UnknownModel(label.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
