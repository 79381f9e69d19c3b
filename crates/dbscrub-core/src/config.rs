use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{FieldKind, parse_model_label};
use crate::rules::{Rule, RuleSpec, SqlValue};

/// Environment variable overriding `environment` from the settings file.
pub const ENVIRONMENT_VAR: &str = "DBSCRUB_ENVIRONMENT";

/// Default trim window in days (three years).
pub const DEFAULT_OLDER_THAN_DAYS: u32 = 1095;

/// Settings driving a scrub run, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Name of the environment the database belongs to.
    pub environment: Option<String>,
    /// Environments in which scrubbing is permitted.
    pub allowed_environments: Vec<String>,
    /// Require a policy for every text field before mutating anything.
    pub strict_mode: bool,
    /// Skip foreign tables and other relations not owned by this database.
    pub skip_unmanaged: bool,
    /// App (schema) allow-list; empty means all.
    pub apps: Vec<String>,
    /// Pool size per faker provider; also the `mod_pk` modulus.
    pub entries_per_provider: u32,
    /// Table truncated after scrubbing unless sessions are kept.
    pub sessions_table: Option<String>,
    /// Cache table holding pre-generated faker values.
    pub fake_data_table: String,
    /// Default faker locale.
    pub locale: String,
    /// Seed for the fake-data pool; random when unset.
    pub seed: Option<u64>,
    /// Rows fetched per page while trimming.
    pub trim_page_size: u32,
    /// Concurrent delete workers; defaults to the number of cores.
    pub delete_workers: Option<usize>,
    pub global: GlobalRulesSpec,
    pub models: BTreeMap<String, ModelRulesSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: None,
            allowed_environments: vec![
                "STAGING".to_string(),
                "DEVELOP".to_string(),
                "NONPROD".to_string(),
            ],
            strict_mode: false,
            skip_unmanaged: true,
            apps: Vec::new(),
            entries_per_provider: 1000,
            sessions_table: None,
            fake_data_table: "public.scrubber_fake_data".to_string(),
            locale: "en_US".to_string(),
            seed: None,
            trim_page_size: 250,
            delete_workers: None,
            global: GlobalRulesSpec::default(),
            models: BTreeMap::new(),
        }
    }
}

/// Global rules keyed by field kind and by field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalRulesSpec {
    pub types: BTreeMap<FieldKind, RuleSpec>,
    pub fields: BTreeMap<String, RuleSpec>,
}

/// Model-declared rules and options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelRulesSpec {
    pub fields: BTreeMap<String, RuleSpec>,
    pub options: ModelOptionsSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelOptionsSpec {
    /// Column equalities; matching rows are left untouched.
    pub exclude: BTreeMap<String, serde_json::Value>,
    pub trim: Option<TrimOptions>,
    pub disconnect_signals: Vec<DisconnectSignal>,
}

/// Which side of the cutoff gets deleted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrimDirection {
    /// Delete rows older than the cutoff, retaining recent ones.
    #[default]
    Older,
    /// Delete rows at or after the cutoff.
    Newer,
}

/// Trim window for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrimOptions {
    /// Timestamp or date column compared against the cutoff.
    pub attribute: String,
    #[serde(default)]
    pub direction: TrimDirection,
    /// Dependent models (`app_label.model`) deleted before each row.
    #[serde(default)]
    pub dependents: Vec<String>,
}

/// Trigger disabled for the duration of a model's update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DisconnectSignal {
    /// Trigger name, or `ALL` / `USER`.
    pub trigger: String,
    /// Table owning the trigger; defaults to the scrubbed model.
    #[serde(default)]
    pub table: Option<String>,
}

/// Parsed global rules.
#[derive(Debug, Clone, Default)]
pub struct GlobalRules {
    pub by_type: BTreeMap<FieldKind, Rule>,
    pub by_name: BTreeMap<String, Rule>,
}

/// Parsed options for one model.
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    pub exclude: Vec<(String, SqlValue)>,
    pub trim: Option<TrimOptions>,
    pub disconnect_signals: Vec<DisconnectSignal>,
}

/// Parsed rules for one model.
#[derive(Debug, Clone, Default)]
pub struct ModelRules {
    pub fields: BTreeMap<String, Rule>,
    pub options: ModelOptions,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|err| Error::InvalidConfig(err.to_string()))?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.entries_per_provider == 0 {
            return Err(Error::InvalidConfig(
                "entries_per_provider must be greater than zero".to_string(),
            ));
        }
        if self.trim_page_size == 0 {
            return Err(Error::InvalidConfig(
                "trim_page_size must be greater than zero".to_string(),
            ));
        }
        if self.delete_workers == Some(0) {
            return Err(Error::InvalidConfig(
                "delete_workers must be greater than zero".to_string(),
            ));
        }
        parse_model_label(&self.fake_data_table)?;
        if let Some(table) = &self.sessions_table {
            parse_model_label(table)?;
        }
        for (label, model) in &self.models {
            parse_model_label(label)?;
            if let Some(trim) = &model.options.trim {
                for dependent in &trim.dependents {
                    parse_model_label(dependent)?;
                }
            }
            for signal in &model.options.disconnect_signals {
                if let Some(table) = &signal.table {
                    parse_model_label(table)?;
                }
            }
        }
        self.global_rules()?;
        for label in self.models.keys() {
            self.model_rules(label)?;
        }
        Ok(())
    }

    /// Environment name, with the environment variable taking precedence.
    pub fn effective_environment(&self) -> Option<String> {
        std::env::var(ENVIRONMENT_VAR)
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| self.environment.clone())
    }

    pub fn environment_allowed(&self, environment: Option<&str>) -> bool {
        environment
            .map(|env| self.allowed_environments.iter().any(|allowed| allowed == env))
            .unwrap_or(false)
    }

    pub fn app_allowed(&self, app_label: &str) -> bool {
        self.apps.is_empty() || self.apps.iter().any(|app| app == app_label)
    }

    pub fn global_rules(&self) -> Result<GlobalRules> {
        let by_type = self
            .global
            .types
            .iter()
            .map(|(kind, spec)| Ok((*kind, spec.to_rule()?)))
            .collect::<Result<_>>()?;
        let by_name = self
            .global
            .fields
            .iter()
            .map(|(name, spec)| Ok((name.clone(), spec.to_rule()?)))
            .collect::<Result<_>>()?;
        Ok(GlobalRules { by_type, by_name })
    }

    /// Declared rules for a model, if any are configured.
    pub fn model_rules(&self, label: &str) -> Result<Option<ModelRules>> {
        let Some(spec) = self.models.get(label) else {
            return Ok(None);
        };
        let fields = spec
            .fields
            .iter()
            .map(|(name, rule)| Ok((name.clone(), rule.to_rule()?)))
            .collect::<Result<_>>()?;
        let exclude = spec
            .options
            .exclude
            .iter()
            .map(|(column, value)| Ok((column.clone(), SqlValue::from_json(value)?)))
            .collect::<Result<_>>()?;
        Ok(Some(ModelRules {
            fields,
            options: ModelOptions {
                exclude,
                trim: spec.options.trim.clone(),
                disconnect_signals: spec.options.disconnect_signals.clone(),
            },
        }))
    }

    /// Every `(provider, locale)` pair a faker rule in the settings resolves to.
    pub fn faker_providers(&self) -> Result<Vec<(String, String)>> {
        let global = self.global_rules()?;
        let mut targets: Vec<(String, String)> = global
            .by_type
            .values()
            .chain(global.by_name.values())
            .filter_map(|rule| rule.faker_target(&self.locale))
            .collect();
        for label in self.models.keys() {
            if let Some(rules) = self.model_rules(label)? {
                targets.extend(
                    rules
                        .fields
                        .values()
                        .filter_map(|rule| rule.faker_target(&self.locale)),
                );
            }
        }
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    pub fn delete_workers(&self) -> usize {
        self.delete_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        })
    }
}
