use serde::Serialize;

use crate::config::{ModelRules, Settings};
use crate::error::Result;
use crate::model::{ModelDescriptor, ModelRegistry};
use crate::resolver::has_policy;

/// Text fields of one model that no rule covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnscrubbedModel {
    pub label: String,
    pub fields: Vec<String>,
}

/// Outcome of checking every eligible model for text fields without policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrubValidationReport {
    /// Every model that would be scrubbed, in label order.
    pub checked: Vec<String>,
    pub unscrubbed: Vec<UnscrubbedModel>,
}

impl ScrubValidationReport {
    pub fn is_ok(&self) -> bool {
        self.unscrubbed.is_empty()
    }

    /// Human readable listing; one `Model '<label>':` header per model.
    pub fn render(&self, include_clean: bool) -> String {
        let mut out = String::new();
        for label in &self.checked {
            match self.unscrubbed.iter().find(|model| &model.label == label) {
                Some(model) => {
                    out.push_str(&format!("Model '{label}':\n"));
                    for field in &model.fields {
                        out.push_str(&format!("- {field}\n"));
                    }
                }
                None if include_clean => out.push_str(&format!("Model '{label}': ok\n")),
                None => {}
            }
        }
        out
    }
}

/// Models a run may touch, honouring proxy, managed and app filters.
///
/// With `only`, the named model must exist; it is still subject to the filters.
pub fn eligible_models<'a>(
    registry: &'a ModelRegistry,
    settings: &Settings,
    only: Option<&str>,
) -> Result<Vec<&'a ModelDescriptor>> {
    let candidates: Vec<&ModelDescriptor> = match only {
        Some(label) => vec![registry.get(label)?],
        None => registry.models().collect(),
    };

    Ok(candidates
        .into_iter()
        .filter(|model| !model.is_proxy())
        .filter(|model| !settings.skip_unmanaged || model.is_managed())
        .filter(|model| settings.app_allowed(&model.app_label))
        .filter(|model| model.label() != settings.fake_data_table)
        .collect())
}

/// Report text fields lacking an explicit scrub policy.
pub fn validate_scrubbers(
    registry: &ModelRegistry,
    settings: &Settings,
) -> Result<ScrubValidationReport> {
    validate_scrubbers_with(registry, settings, |label| settings.model_rules(label))
}

/// Like [`validate_scrubbers`], reading model-declared rules from `declared`.
pub fn validate_scrubbers_with<F>(
    registry: &ModelRegistry,
    settings: &Settings,
    declared: F,
) -> Result<ScrubValidationReport>
where
    F: Fn(&str) -> Result<Option<ModelRules>>,
{
    let global = settings.global_rules()?;
    let mut report = ScrubValidationReport::default();

    for model in eligible_models(registry, settings, None)? {
        let label = model.label();
        let declared = declared(&label)?;
        let fields: Vec<String> = model
            .fields
            .iter()
            .filter(|field| field.kind.is_text() && !field.is_generated)
            .filter(|field| !has_policy(field, &global, declared.as_ref()))
            .map(|field| field.name.clone())
            .collect();

        if !fields.is_empty() {
            report.unscrubbed.push(UnscrubbedModel {
                label: label.clone(),
                fields,
            });
        }
        report.checked.push(label);
    }

    Ok(report)
}
