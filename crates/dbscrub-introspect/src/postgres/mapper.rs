use dbscrub_core::{FieldDescriptor, FieldKind, FkAction, ModelDescriptor, ModelKind, Relation};

use crate::options::IntrospectOptions;

use super::queries::{RawColumn, RawForeignKey, RawKey, RawTable};

pub fn filter_schemas(raw: Vec<String>, opts: &IntrospectOptions) -> Vec<String> {
    raw.into_iter()
        .filter(|schema| {
            let is_system = schema.starts_with("pg_") || schema == "information_schema";
            match &opts.schemas {
                Some(list) => list.iter().any(|item| item == schema),
                None => opts.system_schemas || !is_system,
            }
        })
        .collect()
}

/// Convert a Postgres `relkind` code to a typed model kind.
pub fn relkind_to_model_kind(code: &str) -> ModelKind {
    match code {
        "r" => ModelKind::Table,
        "p" => ModelKind::PartitionedTable,
        "v" => ModelKind::View,
        "m" => ModelKind::MaterializedView,
        "f" => ModelKind::ForeignTable,
        other => ModelKind::Other(other.to_string()),
    }
}

/// Convert a `confdeltype` code to an FK action.
pub fn fk_action_from_code(code: &str) -> FkAction {
    match code {
        "a" => FkAction::NoAction,
        "r" => FkAction::Restrict,
        "c" => FkAction::Cascade,
        "n" => FkAction::SetNull,
        "d" => FkAction::SetDefault,
        _ => FkAction::Unknown,
    }
}

fn kind_enabled(kind: &ModelKind, opts: &IntrospectOptions) -> bool {
    match kind {
        ModelKind::View | ModelKind::MaterializedView => opts.proxies,
        ModelKind::ForeignTable => opts.foreign_tables,
        _ => true,
    }
}

/// Start a model for each enabled table; fields and keys are filled later.
pub fn map_tables(schema: &str, raw: Vec<RawTable>, opts: &IntrospectOptions) -> Vec<ModelDescriptor> {
    raw.into_iter()
        .filter_map(|table| {
            let kind = relkind_to_model_kind(&table.relkind);
            if !kind_enabled(&kind, opts) {
                return None;
            }
            Some(ModelDescriptor {
                app_label: schema.to_string(),
                name: table.name,
                kind,
                primary_key: Vec::new(),
                fields: Vec::new(),
                dependents: Vec::new(),
            })
        })
        .collect()
}

pub fn map_columns(raw: Vec<RawColumn>, unique_keys: &[RawKey]) -> Vec<FieldDescriptor> {
    raw.into_iter()
        .map(|col| {
            let is_unique = unique_keys
                .iter()
                .any(|key| key.columns.len() == 1 && key.columns[0] == col.name);
            FieldDescriptor {
                kind: FieldKind::from_udt(&col.udt_name, col.is_enum),
                name: col.name,
                data_type: col.data_type,
                max_length: col.character_max_length,
                is_nullable: col.is_nullable,
                is_unique,
                is_generated: col.is_generated,
            }
        })
        .collect()
}

/// Attach each foreign key to the model it references.
pub fn attach_dependents(models: &mut [ModelDescriptor], raw: Vec<RawForeignKey>) {
    for fk in raw {
        let Some(parent) = models.iter_mut().find(|model| {
            model.app_label == fk.referenced_schema && model.name == fk.referenced_table
        }) else {
            continue;
        };
        parent.dependents.push(Relation {
            name: fk.name,
            app_label: fk.schema,
            model: fk.table,
            columns: fk.columns,
            referenced_columns: fk.referenced_columns,
            on_delete: fk_action_from_code(&fk.on_delete_code),
        });
    }
}
