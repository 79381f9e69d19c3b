use crate::error::Result;
use crate::model::parse_model_label;

/// Quote a Postgres identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote `schema.table` as a qualified relation name.
pub fn quote_relation(app_label: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(app_label), quote_ident(name))
}

/// Quote a `schema.table` label.
pub fn quote_label(label: &str) -> Result<String> {
    let (app_label, name) = parse_model_label(label)?;
    Ok(quote_relation(app_label, name))
}
