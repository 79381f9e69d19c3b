use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::ModelDescriptor;
use crate::resolver::ResolvedRules;
use crate::rules::{RealizeContext, Rule, ScrubValue};

/// Concrete value for one field of the update.
#[derive(Debug, Clone, PartialEq)]
pub struct RealizedField {
    pub field: String,
    pub value: ScrubValue,
}

/// Field assignments applied by the bulk update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealizedRules {
    pub fields: Vec<RealizedField>,
    /// Fields whose realized value was falsy.
    pub disabled: Vec<String>,
}

impl RealizedRules {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&ScrubValue> {
        self.fields
            .iter()
            .find(|realized| realized.field == field)
            .map(|realized| &realized.value)
    }

    /// Every `(provider, locale)` pair read from the fake-data pool.
    pub fn providers(&self) -> BTreeSet<(String, String)> {
        self.fields
            .iter()
            .flat_map(|realized| realized.value.providers())
            .collect()
    }
}

/// Realize resolved rules and drop disabled ones.
pub fn realize_rules(
    model: &ModelDescriptor,
    resolved: &ResolvedRules,
    locale: &str,
) -> Result<RealizedRules> {
    let ctx = RealizeContext { model, locale };
    let mut realized = RealizedRules::default();

    for entry in &resolved.rules {
        let value = match &entry.rule {
            Rule::Keep => continue,
            Rule::Literal(value) => ScrubValue::Literal(value.clone()),
            Rule::Generate(generator) => generator.realize(&entry.field, &ctx)?,
        };

        if value.is_disabled() {
            realized.disabled.push(entry.field.name.clone());
            continue;
        }

        realized.fields.push(RealizedField {
            field: entry.field.name.clone(),
            value,
        });
    }

    Ok(realized)
}
