use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

use dbscrub_core::{
    DEFAULT_OLDER_THAN_DAYS, GlobalRules, ModelDescriptor, ModelRegistry, ModelRules,
    ScrubValidationReport, Settings, eligible_models, quote_label, realize_rules, resolve_rules,
    validate_scrubbers_with,
};
use dbscrub_generate::{FakeDataPool, FakerCatalog};

use crate::errors::ScrubError;
use crate::trim::{TrimReport, TrimSettings, Trimmer};
use crate::update::{UpdatePlan, UpdateReport, apply_update};

/// Flags of a single scrub invocation.
#[derive(Debug, Clone)]
pub struct ScrubOptions {
    /// Only this `app_label.model` label.
    pub model: Option<String>,
    pub keep_sessions: bool,
    pub remove_fake_data: bool,
    pub older_than_days: u32,
    /// Trim configured models without updating any field.
    pub trim_only: bool,
}

impl Default for ScrubOptions {
    fn default() -> Self {
        Self {
            model: None,
            keep_sessions: false,
            remove_fake_data: false,
            older_than_days: DEFAULT_OLDER_THAN_DAYS,
            trim_only: false,
        }
    }
}

/// What happened to one model.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelReport {
    pub model: String,
    pub kept: Vec<String>,
    pub disabled: Vec<String>,
    pub pool_values_added: u64,
    pub trim: Option<TrimReport>,
    pub update: Option<UpdateReport>,
}

/// Rows removed by the post-run cleanup.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions_deleted: Option<u64>,
    pub fake_data_deleted: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrubReport {
    pub environment: Option<String>,
    pub models: Vec<ModelReport>,
    pub cleanup: CleanupReport,
}

/// Result of a run that did not fail outright.
#[derive(Debug)]
pub enum ScrubOutcome {
    Completed(ScrubReport),
    /// The environment is missing or not in the allow-list; nothing ran.
    EnvironmentRejected { environment: Option<String> },
    /// Strict mode found text fields without policy; nothing ran.
    StrictModeViolation(ScrubValidationReport),
}

/// Applies settings and programmatic rules to a database.
pub struct ScrubRunner<'a> {
    pool: PgPool,
    settings: &'a Settings,
    registry: &'a ModelRegistry,
    declared: BTreeMap<String, ModelRules>,
}

impl<'a> ScrubRunner<'a> {
    pub fn new(pool: PgPool, settings: &'a Settings, registry: &'a ModelRegistry) -> Self {
        Self {
            pool,
            settings,
            registry,
            declared: BTreeMap::new(),
        }
    }

    /// Register rules for a model in code, e.g. `Rule::generate` closures.
    ///
    /// Fields override the settings file per field; exclusions and signals
    /// are added; a trim window replaces the configured one.
    pub fn with_model_rules(mut self, label: impl Into<String>, rules: ModelRules) -> Self {
        self.declared.insert(label.into(), rules);
        self
    }

    fn declared_rules(&self, label: &str) -> dbscrub_core::Result<Option<ModelRules>> {
        let configured = self.settings.model_rules(label)?;
        let Some(extra) = self.declared.get(label) else {
            return Ok(configured);
        };
        let mut merged = configured.unwrap_or_default();
        merged
            .fields
            .extend(extra.fields.iter().map(|(name, rule)| (name.clone(), rule.clone())));
        merged
            .options
            .exclude
            .extend(extra.options.exclude.iter().cloned());
        merged
            .options
            .disconnect_signals
            .extend(extra.options.disconnect_signals.iter().cloned());
        if extra.options.trim.is_some() {
            merged.options.trim = extra.options.trim.clone();
        }
        Ok(Some(merged))
    }

    /// Text fields of eligible models with no policy in any source.
    pub fn validate(&self) -> Result<ScrubValidationReport, ScrubError> {
        Ok(validate_scrubbers_with(self.registry, self.settings, |label| {
            self.declared_rules(label)
        })?)
    }

    pub async fn run(&self, options: &ScrubOptions) -> Result<ScrubOutcome, ScrubError> {
        let environment = self.settings.effective_environment();
        if !self.settings.environment_allowed(environment.as_deref()) {
            return Ok(ScrubOutcome::EnvironmentRejected { environment });
        }

        if self.settings.strict_mode {
            let report = self.validate()?;
            if !report.is_ok() {
                warn!(
                    models = report.unscrubbed.len(),
                    "strict mode: text fields without scrub policy"
                );
                return Ok(ScrubOutcome::StrictModeViolation(report));
            }
        }

        let global = self.settings.global_rules()?;
        let models = eligible_models(self.registry, self.settings, options.model.as_deref())?;
        if let Some(label) = &options.model
            && models.is_empty()
        {
            warn!(model = %label, "model is filtered out by proxy, managed or app settings");
        }

        // Nothing is mutated until every provider and locale is known.
        for (provider, locale) in self.faker_targets(&models, &global, options.trim_only)? {
            FakerCatalog::validate(&provider, &locale)?;
        }

        let fake = self.fake_data_pool()?;

        info!(
            environment = environment.as_deref().unwrap_or_default(),
            models = models.len(),
            trim_only = options.trim_only,
            "scrub started"
        );

        let mut report = ScrubReport {
            environment,
            ..ScrubReport::default()
        };
        for model in models {
            if let Some(model_report) = self.scrub_model(model, &global, &fake, options).await? {
                report.models.push(model_report);
            }
        }

        report.cleanup = self
            .cleanup_with(&fake, options.keep_sessions, options.remove_fake_data)
            .await?;

        info!(models = report.models.len(), "scrub finished");
        Ok(ScrubOutcome::Completed(report))
    }

    /// Faker pairs of the settings file, of rules declared in code, and of
    /// every generator the selected models realize to.
    fn faker_targets(
        &self,
        models: &[&ModelDescriptor],
        global: &GlobalRules,
        trim_only: bool,
    ) -> Result<BTreeSet<(String, String)>, ScrubError> {
        let locale = &self.settings.locale;
        let mut targets: BTreeSet<_> = self.settings.faker_providers()?.into_iter().collect();
        for rules in self.declared.values() {
            targets.extend(rules.fields.values().filter_map(|rule| rule.faker_target(locale)));
        }
        if !trim_only {
            for model in models {
                let declared = self.declared_rules(&model.label())?;
                let resolved = resolve_rules(model, global, declared.as_ref());
                targets.extend(realize_rules(model, &resolved, locale)?.providers());
            }
        }
        Ok(targets)
    }

    async fn scrub_model(
        &self,
        model: &ModelDescriptor,
        global: &GlobalRules,
        fake: &FakeDataPool,
        options: &ScrubOptions,
    ) -> Result<Option<ModelReport>, ScrubError> {
        let label = model.label();
        let declared = self.declared_rules(&label)?;
        let resolved = resolve_rules(model, global, declared.as_ref());
        let trim_options = declared
            .as_ref()
            .and_then(|rules| rules.options.trim.as_ref());

        let update_wanted = !options.trim_only && !resolved.is_empty();
        if !update_wanted && trim_options.is_none() {
            return Ok(None);
        }

        let mut report = ModelReport {
            model: label.clone(),
            kept: resolved.kept.clone(),
            ..ModelReport::default()
        };

        if let Some(trim) = trim_options {
            let trimmer = Trimmer::new(
                &self.pool,
                model,
                trim,
                options.older_than_days,
                TrimSettings {
                    page_size: self.settings.trim_page_size,
                    workers: self.settings.delete_workers(),
                },
            );
            report.trim = Some(trimmer.run().await?);
        }

        if !update_wanted {
            return Ok(Some(report));
        }

        let realized = realize_rules(model, &resolved, &self.settings.locale)?;
        report.disabled = realized.disabled.clone();
        if realized.is_empty() {
            info!(model = %label, "every rule disabled, nothing to update");
            return Ok(Some(report));
        }

        for (provider, locale) in realized.providers() {
            let filled = fake.ensure(&provider, &locale).await?;
            report.pool_values_added += filled.inserted;
        }

        info!(
            model = %label,
            fields = ?realized.fields.iter().map(|f| f.field.as_str()).collect::<Vec<_>>(),
            "scrubbing model"
        );

        let model_options = declared.map(|rules| rules.options).unwrap_or_default();
        let plan = UpdatePlan {
            model,
            realized: &realized,
            exclude: &model_options.exclude,
            pool_table: fake.table(),
            pool_size: fake.entries_per_provider(),
        };
        report.update = Some(apply_update(&self.pool, &plan, &model_options.disconnect_signals).await?);
        Ok(Some(report))
    }

    fn fake_data_pool(&self) -> Result<FakeDataPool, ScrubError> {
        Ok(FakeDataPool::new(
            self.pool.clone(),
            &self.settings.fake_data_table,
            self.settings.entries_per_provider,
            self.settings.seed,
        )?)
    }

    /// Create the fake-data table ahead of parallel workers.
    pub async fn prepare_fake_data(&self) -> Result<(), ScrubError> {
        self.fake_data_pool()?.create_table().await?;
        Ok(())
    }

    /// Delete session rows unless kept, and the fake-data pool on request.
    pub async fn cleanup(
        &self,
        keep_sessions: bool,
        remove_fake_data: bool,
    ) -> Result<CleanupReport, ScrubError> {
        let fake = self.fake_data_pool()?;
        self.cleanup_with(&fake, keep_sessions, remove_fake_data).await
    }

    async fn cleanup_with(
        &self,
        fake: &FakeDataPool,
        keep_sessions: bool,
        remove_fake_data: bool,
    ) -> Result<CleanupReport, ScrubError> {
        let mut report = CleanupReport::default();

        if !keep_sessions && let Some(table) = &self.settings.sessions_table {
            let deleted = self.delete_all(table).await?;
            info!(table = %table, rows = deleted, "sessions deleted");
            report.sessions_deleted = Some(deleted);
        }

        if remove_fake_data {
            let deleted = fake.clear().await?;
            info!(table = %self.settings.fake_data_table, rows = deleted, "fake data removed");
            report.fake_data_deleted = Some(deleted);
        }

        Ok(report)
    }

    async fn delete_all(&self, label: &str) -> Result<u64, ScrubError> {
        let table = quote_label(label)?;
        let exists: Option<String> = sqlx::query_scalar("select to_regclass($1)::text")
            .bind(&table)
            .fetch_one(&self.pool)
            .await?;
        if exists.is_none() {
            warn!(table = %label, "table does not exist, nothing to delete");
            return Ok(0);
        }
        let result = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use dbscrub_core::{FieldDescriptor, FieldKind, Generator, ModelKind, Rule};
    use dbscrub_generate::GenerationError;
    use sqlx::postgres::PgPoolOptions;

    use super::*;

    fn model(name: &str, column: &str) -> ModelDescriptor {
        ModelDescriptor {
            app_label: "public".to_string(),
            name: name.to_string(),
            kind: ModelKind::Table,
            primary_key: vec!["id".to_string()],
            fields: vec![
                FieldDescriptor::new("id", FieldKind::BigInteger, "bigint"),
                FieldDescriptor::new(column, FieldKind::Text, "text"),
            ],
            dependents: Vec::new(),
        }
    }

    fn staging() -> Settings {
        Settings {
            environment: Some("STAGING".to_string()),
            ..Settings::default()
        }
    }

    fn rules(field: &str, rule: Rule) -> ModelRules {
        let mut rules = ModelRules::default();
        rules.fields.insert(field.to_string(), rule);
        rules
    }

    // The pool never connects: a run that gets past validation fails on I/O instead.
    fn unused_pool() -> PgPool {
        PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://127.0.0.1:1/unused")
            .unwrap()
    }

    #[tokio::test]
    async fn declared_locale_is_rejected_before_any_model_runs() {
        let settings = staging();
        let registry = ModelRegistry::new(vec![
            model("a_users", "bio"),
            model("b_phones", "phone"),
        ]);
        let runner = ScrubRunner::new(unused_pool(), &settings, &registry)
            .with_model_rules("public.a_users", rules("bio", Rule::Generate(Generator::Lorem)))
            .with_model_rules(
                "public.b_phones",
                rules(
                    "phone",
                    Rule::Generate(Generator::Faker {
                        provider: "phone_number".to_string(),
                        locale: Some("fr_FR".to_string()),
                    }),
                ),
            );

        let err = runner.run(&ScrubOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ScrubError::Generation(GenerationError::UnknownLocale(ref locale)) if locale == "fr_FR"
        ));
    }

    #[tokio::test]
    async fn configured_provider_is_rejected_before_any_model_runs() {
        let settings = Settings::from_toml(
            r#"
            environment = "STAGING"

            [models."public.a_users".fields]
            bio = "lorem"

            [models."public.b_phones".fields]
            phone = { faker = "fax_number" }
            "#,
        )
        .unwrap();
        let registry = ModelRegistry::new(vec![
            model("a_users", "bio"),
            model("b_phones", "phone"),
        ]);
        let runner = ScrubRunner::new(unused_pool(), &settings, &registry);

        let err = runner.run(&ScrubOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ScrubError::Generation(GenerationError::UnknownProvider(ref provider)) if provider == "fax_number"
        ));
    }
}
