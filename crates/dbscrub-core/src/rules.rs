use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{FieldDescriptor, ModelDescriptor};

/// Fixed text written by the `lorem` scrubber.
pub const LOREM_IPSUM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do \
eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud \
exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat.";

/// A plain value bound into an update statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Falsy literals disable a rule during realization.
    pub fn is_falsy(&self) -> bool {
        match self {
            SqlValue::Null => true,
            SqlValue::Bool(value) => !value,
            SqlValue::Int(value) => *value == 0,
            SqlValue::Float(value) => *value == 0.0,
            SqlValue::Text(value) => value.is_empty(),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(SqlValue::Null),
            serde_json::Value::Bool(value) => Ok(SqlValue::Bool(*value)),
            serde_json::Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Ok(SqlValue::Int(value))
                } else if let Some(value) = number.as_f64() {
                    Ok(SqlValue::Float(value))
                } else {
                    Err(Error::InvalidConfig(format!(
                        "numeric literal {number} is out of range"
                    )))
                }
            }
            serde_json::Value::String(value) => Ok(SqlValue::Text(value.clone())),
            other => Err(Error::InvalidConfig(format!(
                "literal rule values must be scalars, got {other}"
            ))),
        }
    }
}

/// SQL-side expression evaluated per row by the bulk update.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrubExpr {
    /// Explicit value, never treated as disabled.
    Value(SqlValue),
    /// Current value of another column of the same row.
    Column(String),
    /// `md5` of the column's current value, optionally truncated.
    Hash {
        column: String,
        max_length: Option<i32>,
    },
    /// Value picked from the fake-data pool at offset `mod_pk`.
    Pooled { provider: String, locale: String },
    Concat(Vec<ScrubExpr>),
}

impl ScrubExpr {
    fn collect_providers(&self, out: &mut BTreeSet<(String, String)>) {
        match self {
            ScrubExpr::Pooled { provider, locale } => {
                out.insert((provider.clone(), locale.clone()));
            }
            ScrubExpr::Concat(parts) => {
                for part in parts {
                    part.collect_providers(out);
                }
            }
            _ => {}
        }
    }
}

/// A realized rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrubValue {
    Literal(SqlValue),
    Expr(ScrubExpr),
}

impl ScrubValue {
    pub fn text(value: impl Into<String>) -> Self {
        ScrubValue::Literal(SqlValue::Text(value.into()))
    }

    /// A falsy literal removes the field from the update.
    pub fn is_disabled(&self) -> bool {
        matches!(self, ScrubValue::Literal(value) if value.is_falsy())
    }

    /// `(provider, locale)` pairs this value reads from the fake-data pool.
    pub fn providers(&self) -> BTreeSet<(String, String)> {
        let mut out = BTreeSet::new();
        if let ScrubValue::Expr(expr) = self {
            expr.collect_providers(&mut out);
        }
        out
    }
}

/// Programmatic generator invoked once per field.
pub trait GenerateFn: Send + Sync {
    fn generate(&self, field: &FieldDescriptor) -> ScrubValue;
}

impl<F> GenerateFn for F
where
    F: Fn(&FieldDescriptor) -> ScrubValue + Send + Sync,
{
    fn generate(&self, field: &FieldDescriptor) -> ScrubValue {
        self(field)
    }
}

/// Inputs available while realizing a generator.
#[derive(Debug, Clone, Copy)]
pub struct RealizeContext<'a> {
    pub model: &'a ModelDescriptor,
    pub locale: &'a str,
}

/// Built-in and custom value generators.
#[derive(Clone)]
pub enum Generator {
    Faker {
        provider: String,
        locale: Option<String>,
    },
    Hash {
        max_length: Option<i32>,
    },
    Lorem,
    Empty,
    Null,
    /// Text with `{column}` placeholders; `{{` and `}}` escape braces.
    Template(String),
    Custom(Arc<dyn GenerateFn>),
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generator::Faker { provider, locale } => f
                .debug_struct("Faker")
                .field("provider", provider)
                .field("locale", locale)
                .finish(),
            Generator::Hash { max_length } => f
                .debug_struct("Hash")
                .field("max_length", max_length)
                .finish(),
            Generator::Lorem => f.write_str("Lorem"),
            Generator::Empty => f.write_str("Empty"),
            Generator::Null => f.write_str("Null"),
            Generator::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Generator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Generator {
    pub fn realize(&self, field: &FieldDescriptor, ctx: &RealizeContext<'_>) -> Result<ScrubValue> {
        let value = match self {
            Generator::Faker { provider, locale } => ScrubValue::Expr(ScrubExpr::Pooled {
                provider: provider.clone(),
                locale: locale.clone().unwrap_or_else(|| ctx.locale.to_string()),
            }),
            Generator::Hash { max_length } => ScrubValue::Expr(ScrubExpr::Hash {
                column: field.name.clone(),
                max_length: max_length.or(field.max_length),
            }),
            Generator::Lorem => ScrubValue::Expr(ScrubExpr::Value(SqlValue::Text(
                truncate(LOREM_IPSUM, field.max_length),
            ))),
            Generator::Empty => ScrubValue::Expr(ScrubExpr::Value(SqlValue::Text(String::new()))),
            Generator::Null => ScrubValue::Expr(ScrubExpr::Value(SqlValue::Null)),
            Generator::Template(template) => {
                ScrubValue::Expr(parse_template(template, ctx.model)?)
            }
            Generator::Custom(generate) => generate.generate(field),
        };
        Ok(value)
    }
}

fn truncate(text: &str, max_length: Option<i32>) -> String {
    match max_length {
        Some(limit) if limit >= 0 => text.chars().take(limit as usize).collect(),
        _ => text.to_string(),
    }
}

fn parse_template(template: &str, model: &ModelDescriptor) -> Result<ScrubExpr> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut column = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    column.push(next);
                }
                if !closed || column.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "malformed placeholder in template '{template}'"
                    )));
                }
                if model.field(&column).is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "template '{template}' references unknown field {}.{column}",
                        model.label()
                    )));
                }
                if !literal.is_empty() {
                    parts.push(ScrubExpr::Value(SqlValue::Text(std::mem::take(&mut literal))));
                }
                parts.push(ScrubExpr::Column(column));
            }
            '}' => {
                return Err(Error::InvalidConfig(format!(
                    "unbalanced '}}' in template '{template}'"
                )));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        parts.push(ScrubExpr::Value(SqlValue::Text(literal)));
    }

    Ok(match parts.len() {
        0 => ScrubExpr::Value(SqlValue::Text(String::new())),
        1 => parts.remove(0),
        _ => ScrubExpr::Concat(parts),
    })
}

/// Scrubbing action for one field.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Exclude the field from scrubbing.
    Keep,
    Literal(SqlValue),
    Generate(Generator),
}

impl Rule {
    pub fn generate<F>(generate: F) -> Self
    where
        F: Fn(&FieldDescriptor) -> ScrubValue + Send + Sync + 'static,
    {
        Rule::Generate(Generator::Custom(Arc::new(generate)))
    }

    pub fn faker(provider: impl Into<String>) -> Self {
        Rule::Generate(Generator::Faker {
            provider: provider.into(),
            locale: None,
        })
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Rule::Keep)
    }

    pub fn faker_provider(&self) -> Option<&str> {
        match self {
            Rule::Generate(Generator::Faker { provider, .. }) => Some(provider.as_str()),
            _ => None,
        }
    }

    /// Faker provider and the locale it resolves to under `default_locale`.
    pub fn faker_target(&self, default_locale: &str) -> Option<(String, String)> {
        match self {
            Rule::Generate(Generator::Faker { provider, locale }) => Some((
                provider.clone(),
                locale.as_deref().unwrap_or(default_locale).to_string(),
            )),
            _ => None,
        }
    }
}

/// Optional parameters for the hash scrubber.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashSpec {
    #[serde(default)]
    pub max_length: Option<i32>,
}

/// Rule as written in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSpec {
    /// `"keep"`, `"disable"`, `"lorem"`, `"empty"`, `"null"` or `"hash"`.
    Keyword(String),
    Table(RuleTableSpec),
}

/// Table form of a rule; exactly one action key must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleTableSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrubber: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl RuleSpec {
    pub fn to_rule(&self) -> Result<Rule> {
        match self {
            RuleSpec::Keyword(keyword) => keyword_rule(keyword),
            RuleSpec::Table(table) => table.to_rule(),
        }
    }
}

impl RuleTableSpec {
    fn to_rule(&self) -> Result<Rule> {
        let actions = [
            self.value.is_some(),
            self.faker.is_some(),
            self.scrubber.is_some(),
            self.hash.is_some(),
            self.template.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if actions != 1 {
            return Err(Error::InvalidConfig(
                "a rule table needs exactly one of value, faker, scrubber, hash or template"
                    .to_string(),
            ));
        }
        if self.locale.is_some() && self.faker.is_none() {
            return Err(Error::InvalidConfig(
                "locale is only valid together with faker".to_string(),
            ));
        }

        if let Some(value) = &self.value {
            return Ok(Rule::Literal(SqlValue::from_json(value)?));
        }
        if let Some(provider) = &self.faker {
            return Ok(Rule::Generate(Generator::Faker {
                provider: provider.clone(),
                locale: self.locale.clone(),
            }));
        }
        if let Some(scrubber) = &self.scrubber {
            return keyword_rule(scrubber);
        }
        if let Some(hash) = &self.hash {
            return Ok(Rule::Generate(Generator::Hash {
                max_length: hash.max_length,
            }));
        }
        match &self.template {
            Some(template) => Ok(Rule::Generate(Generator::Template(template.clone()))),
            None => Err(Error::InvalidConfig("empty rule".to_string())),
        }
    }
}

fn keyword_rule(keyword: &str) -> Result<Rule> {
    match keyword {
        "keep" => Ok(Rule::Keep),
        "disable" => Ok(Rule::Literal(SqlValue::Null)),
        "lorem" => Ok(Rule::Generate(Generator::Lorem)),
        "empty" => Ok(Rule::Generate(Generator::Empty)),
        "null" => Ok(Rule::Generate(Generator::Null)),
        "hash" => Ok(Rule::Generate(Generator::Hash { max_length: None })),
        other => Err(Error::InvalidConfig(format!("unknown scrubber '{other}'"))),
    }
}
