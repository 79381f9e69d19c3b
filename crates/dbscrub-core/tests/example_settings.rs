use std::path::Path;

use dbscrub_core::{FieldKind, Rule, Settings, SqlValue, TrimDirection};

fn example() -> Settings {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../dbscrub.example.toml");
    Settings::load(&path).expect("example settings load")
}

#[test]
fn example_settings_parse() {
    let settings = example();
    assert!(settings.strict_mode);
    assert_eq!(settings.seed, Some(42));
    assert_eq!(settings.delete_workers(), 8);
    assert!(settings.environment_allowed(Some("STAGING")));

    let global = settings.global_rules().unwrap();
    assert!(global.by_type.contains_key(&FieldKind::Text));
    assert!(global.by_type.contains_key(&FieldKind::Json));
    assert!(global.by_name["id"].is_keep());

    let pair = |provider: &str, locale: &str| (provider.to_string(), locale.to_string());
    assert_eq!(
        settings.faker_providers().unwrap(),
        vec![
            pair("first_name", "en_US"),
            pair("last_name", "en_US"),
            pair("phone_number", "pt_BR"),
            pair("safe_email", "en_US"),
        ]
    );
}

#[test]
fn example_model_options() {
    let settings = example();

    let users = settings.model_rules("public.users").unwrap().unwrap();
    assert!(matches!(users.fields["nickname"], Rule::Literal(SqlValue::Text(ref v)) if v.is_empty()));
    assert_eq!(
        users.options.exclude,
        vec![("is_staff".to_string(), SqlValue::Bool(true))]
    );

    let invoices = settings.model_rules("billing.invoices").unwrap().unwrap();
    let trim = invoices.options.trim.unwrap();
    assert_eq!(trim.direction, TrimDirection::Older);
    assert_eq!(trim.dependents.len(), 2);
    assert_eq!(
        invoices.options.disconnect_signals[0].table.as_deref(),
        Some("billing.invoice_lines")
    );

    assert!(settings.model_rules("public.orders").unwrap().is_none());
}
