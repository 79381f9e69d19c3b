//! Core contracts for dbscrub.
//!
//! Defines the model registry, rule types, settings, and the pure parts of a
//! scrub run: rule resolution, realization, and policy validation.

pub mod config;
pub mod error;
pub mod model;
pub mod realizer;
pub mod redaction;
pub mod resolver;
pub mod rules;
pub mod sql;
pub mod validation;

pub use config::{
    DEFAULT_OLDER_THAN_DAYS, DisconnectSignal, ENVIRONMENT_VAR, GlobalRules, ModelOptions,
    ModelRules, Settings, TrimDirection, TrimOptions,
};
pub use error::{Error, Result};
pub use model::{
    FieldDescriptor, FieldKind, FkAction, ModelDescriptor, ModelKind, ModelRegistry, Relation,
    parse_model_label,
};
pub use realizer::{RealizedField, RealizedRules, realize_rules};
pub use redaction::{RedactedUrl, redact_database_url};
pub use resolver::{ResolvedRule, ResolvedRules, has_policy, resolve_rules};
pub use rules::{
    GenerateFn, Generator, LOREM_IPSUM, RealizeContext, Rule, RuleSpec, ScrubExpr, ScrubValue,
    SqlValue,
};
pub use sql::{quote_ident, quote_label, quote_relation};
pub use validation::{
    ScrubValidationReport, UnscrubbedModel, eligible_models, validate_scrubbers,
    validate_scrubbers_with,
};
