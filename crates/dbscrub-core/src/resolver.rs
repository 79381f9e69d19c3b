use tracing::warn;

use crate::config::{GlobalRules, ModelRules};
use crate::model::{FieldDescriptor, ModelDescriptor};
use crate::rules::Rule;

/// Rule picked for one field.
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub field: FieldDescriptor,
    pub rule: Rule,
}

/// Field rules for a model after precedence and keep exclusion.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRules {
    /// Rules in field order, never containing `Keep`.
    pub rules: Vec<ResolvedRule>,
    /// Fields some source marked as kept.
    pub kept: Vec<String>,
    /// Declared fields that do not exist on the model.
    pub unknown_fields: Vec<String>,
}

impl ResolvedRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|resolved| resolved.field.name == field)
            .map(|resolved| &resolved.rule)
    }
}

/// Merge global and model-declared rules for a model.
///
/// Model-declared rules override global field-name rules, which override
/// global type rules. A field whose winning rule is `Keep` is left out.
pub fn resolve_rules(
    model: &ModelDescriptor,
    global: &GlobalRules,
    declared: Option<&ModelRules>,
) -> ResolvedRules {
    let mut resolved = ResolvedRules::default();

    if let Some(declared) = declared {
        for name in declared.fields.keys() {
            if model.field(name).is_none() {
                warn!(
                    model = %model.label(),
                    field = %name,
                    "scrubber defined for field that does not exist"
                );
                resolved.unknown_fields.push(name.clone());
            }
        }
    }

    for field in &model.fields {
        let sources = [
            global.by_type.get(&field.kind),
            global.by_name.get(&field.name),
            declared.and_then(|rules| rules.fields.get(&field.name)),
        ];

        let Some(rule) = sources.into_iter().flatten().last() else {
            continue;
        };

        if rule.is_keep() {
            resolved.kept.push(field.name.clone());
            continue;
        }

        if field.is_generated {
            warn!(
                model = %model.label(),
                field = %field.name,
                "skipping rule for generated column"
            );
            continue;
        }

        resolved.rules.push(ResolvedRule {
            field: field.clone(),
            rule: rule.clone(),
        });
    }

    resolved
}

/// Whether any source gives the field an explicit policy (including `Keep`).
pub fn has_policy(
    field: &FieldDescriptor,
    global: &GlobalRules,
    declared: Option<&ModelRules>,
) -> bool {
    global.by_type.contains_key(&field.kind)
        || global.by_name.contains_key(&field.name)
        || declared.is_some_and(|rules| rules.fields.contains_key(&field.name))
}
