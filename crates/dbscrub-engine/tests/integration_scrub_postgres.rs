use std::collections::BTreeMap;
use std::{env, fs, path::Path};

use anyhow::{Context, Result, bail};
use dbscrub_core::{
    FieldDescriptor, ModelOptions, ModelRegistry, ModelRules, Rule, ScrubValue, Settings,
    TrimDirection, TrimOptions,
};
use dbscrub_engine::{
    ScrubError, ScrubOptions, ScrubOutcome, ScrubRunner, TrimSettings, Trimmer, mod_pk_sql,
};
use dbscrub_introspect::{IntrospectOptions, load_models_with_options};
use sqlx::{PgPool, postgres::PgPoolOptions};

fn database_url() -> Option<String> {
    env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok()
}

async fn connect() -> Result<Option<PgPool>> {
    let Some(db_url) = database_url() else {
        eprintln!("skipping: set TEST_DATABASE_URL or DATABASE_URL for integration tests");
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(&db_url)
        .await
        .context("connecting to Postgres")?;
    Ok(Some(pool))
}

async fn load_fixture(pool: &PgPool, file: &str, schema: &str) -> Result<ModelRegistry> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sql/postgres")
        .join(file);
    let script =
        fs::read_to_string(&path).with_context(|| format!("reading fixture {}", path.display()))?;
    sqlx::raw_sql(&script)
        .execute(pool)
        .await
        .with_context(|| format!("executing fixture {}", path.display()))?;

    let registry = load_models_with_options(
        pool,
        IntrospectOptions {
            schemas: Some(vec![schema.to_string()]),
            ..IntrospectOptions::default()
        },
    )
    .await?;
    Ok(registry)
}

fn settings(toml: &str) -> Result<Settings> {
    Ok(Settings::from_toml(toml)?)
}

#[tokio::test]
async fn kept_fields_survive_and_generated_values_are_written() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "002_scrub_keep.sql", "scrub_keep").await?;
    let settings = settings(
        r#"
        environment = "STAGING"
        apps = ["scrub_keep"]
        fake_data_table = "scrub_keep.fake_data"
        "#,
    )?;

    let rules = ModelRules {
        fields: BTreeMap::from([
            ("name".to_string(), Rule::Keep),
            (
                "email".to_string(),
                Rule::generate(|_: &FieldDescriptor| ScrubValue::text("x@example.com")),
            ),
        ]),
        options: ModelOptions::default(),
    };
    let runner =
        ScrubRunner::new(pool.clone(), &settings, &registry).with_model_rules("scrub_keep.users", rules);

    let report = match runner.run(&ScrubOptions::default()).await? {
        ScrubOutcome::Completed(report) => report,
        other => bail!("unexpected outcome: {other:?}"),
    };
    assert_eq!(report.models.len(), 1);
    assert_eq!(report.models[0].kept, vec!["name".to_string()]);
    assert_eq!(report.models[0].update.as_ref().map(|u| u.rows), Some(1));

    let (name, email): (String, String) =
        sqlx::query_as("select name, email from scrub_keep.users")
            .fetch_one(&pool)
            .await?;
    assert_eq!(name, "Alice Example");
    assert_eq!(email, "x@example.com");

    Ok(())
}

#[tokio::test]
async fn strict_mode_aborts_before_mutating() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "003_scrub_strict.sql", "scrub_strict").await?;
    let settings = settings(
        r#"
        environment = "STAGING"
        strict_mode = true
        apps = ["scrub_strict"]
        fake_data_table = "scrub_strict.fake_data"

        [global.fields]
        email = "lorem"
        "#,
    )?;

    let runner = ScrubRunner::new(pool.clone(), &settings, &registry);
    let report = match runner.run(&ScrubOptions::default()).await? {
        ScrubOutcome::StrictModeViolation(report) => report,
        other => bail!("unexpected outcome: {other:?}"),
    };
    assert_eq!(report.unscrubbed.len(), 1);
    assert_eq!(report.unscrubbed[0].label, "scrub_strict.profiles");
    assert_eq!(report.unscrubbed[0].fields, vec!["bio".to_string()]);

    let untouched: i64 = sqlx::query_scalar(
        "select count(*) from scrub_strict.profiles where email like '%@corp.example' and bio like '%secret bio'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(untouched, 2);

    Ok(())
}

#[tokio::test]
async fn pooled_values_are_spread_by_mod_pk() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "004_scrub_pool.sql", "scrub_pool").await?;
    let contacts = registry.get("scrub_pool.contacts")?;

    for pool_size in [10_u32, 50] {
        let sql = format!(
            "select count(distinct m)::bigint, min(m)::bigint, max(m)::bigint \
             from (select {} as m from scrub_pool.contacts as scrub_target) as groups",
            mod_pk_sql(contacts, pool_size)
        );
        let (groups, min, max): (i64, i64, i64) = sqlx::query_as(&sql).fetch_one(&pool).await?;
        assert_eq!(groups, i64::from(pool_size).min(25));
        assert!(min >= 0);
        assert!(max < i64::from(pool_size));
    }

    let settings = settings(
        r#"
        environment = "STAGING"
        apps = ["scrub_pool"]
        fake_data_table = "scrub_pool.fake_data"
        entries_per_provider = 10
        seed = 7

        [global.fields]
        email = { faker = "safe_email" }
        score = { value = 0 }

        [models."scrub_pool.contacts".options]
        exclude = { is_vip = true }
        "#,
    )?;
    let runner = ScrubRunner::new(pool.clone(), &settings, &registry);
    let options = ScrubOptions {
        remove_fake_data: true,
        ..ScrubOptions::default()
    };
    let report = match runner.run(&options).await? {
        ScrubOutcome::Completed(report) => report,
        other => bail!("unexpected outcome: {other:?}"),
    };
    let model = &report.models[0];
    assert_eq!(model.disabled, vec!["score".to_string()]);
    assert_eq!(model.pool_values_added, 10);
    assert_eq!(model.update.as_ref().map(|u| u.rows), Some(24));
    assert_eq!(report.cleanup.fake_data_deleted, Some(10));

    let (rows, distinct, leaked): (i64, i64, i64) = sqlx::query_as(
        "select count(*), count(distinct email), count(*) filter (where email like '%@corp.example') \
         from scrub_pool.contacts where not is_vip",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(rows, 24);
    assert_eq!(distinct, 10);
    assert_eq!(leaked, 0);

    let vip: String = sqlx::query_scalar("select email from scrub_pool.contacts where is_vip")
        .fetch_one(&pool)
        .await?;
    assert_eq!(vip, "person1@corp.example");

    let scores: i64 =
        sqlx::query_scalar("select count(*) from scrub_pool.contacts where score = 5")
            .fetch_one(&pool)
            .await?;
    assert_eq!(scores, 25);

    Ok(())
}

#[tokio::test]
async fn trim_forces_protected_rows_and_skips_refused_ones() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "005_trim.sql", "scrub_trim").await?;
    let customers = registry.get("scrub_trim.customers")?;

    let options = TrimOptions {
        attribute: "created_at".to_string(),
        direction: TrimDirection::Older,
        dependents: vec!["scrub_trim.orders".to_string()],
    };
    let trimmer = Trimmer::new(
        &pool,
        customers,
        &options,
        1095,
        TrimSettings {
            page_size: 2,
            workers: 2,
        },
    );
    let report = trimmer.run().await?;

    assert_eq!(report.candidates, 3);
    assert_eq!(report.pages, 2);
    assert_eq!(report.dependents_deleted, 2);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.forced, 1);
    // the locked row is refused once in the row pages and once in the sweep
    assert_eq!(report.skipped, 2);
    assert_eq!(report.swept, 0);

    let remaining: Vec<i64> =
        sqlx::query_scalar("select id from scrub_trim.customers order by id")
            .fetch_all(&pool)
            .await?;
    assert_eq!(remaining, vec![3, 4]);

    let orders: Vec<i64> = sqlx::query_scalar("select customer_id from scrub_trim.orders")
        .fetch_all(&pool)
        .await?;
    assert_eq!(orders, vec![4]);

    Ok(())
}

#[tokio::test]
async fn unsupported_rule_locale_fails_before_any_model_is_touched() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "006_scrub_locale.sql", "scrub_locale").await?;
    let settings = settings(
        r#"
        environment = "STAGING"
        apps = ["scrub_locale"]
        fake_data_table = "scrub_locale.fake_data"

        [models."scrub_locale.a_users".fields]
        bio = "lorem"

        [models."scrub_locale.b_phones".fields]
        phone = { faker = "phone_number", locale = "fr_FR" }
        "#,
    )?;

    let runner = ScrubRunner::new(pool.clone(), &settings, &registry);
    let err = match runner.run(&ScrubOptions::default()).await {
        Err(err) => err,
        Ok(other) => bail!("unexpected outcome: {other:?}"),
    };
    assert!(matches!(err, ScrubError::Generation(_)));
    assert!(err.to_string().contains("fr_FR"));

    let untouched: i64 =
        sqlx::query_scalar("select count(*) from scrub_locale.a_users where bio like '%secret bio'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(untouched, 2);

    let pool_table: Option<String> =
        sqlx::query_scalar("select to_regclass('scrub_locale.fake_data')::text")
            .fetch_one(&pool)
            .await?;
    assert_eq!(pool_table, None);

    Ok(())
}

#[tokio::test]
async fn pool_too_small_for_unique_column_reports_the_pool_size() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "007_scrub_unique.sql", "scrub_unique").await?;
    let settings = settings(
        r#"
        environment = "STAGING"
        apps = ["scrub_unique"]
        fake_data_table = "scrub_unique.fake_data"
        entries_per_provider = 5
        seed = 3

        [global.fields]
        email = { faker = "safe_email" }
        "#,
    )?;

    let runner = ScrubRunner::new(pool.clone(), &settings, &registry);
    let err = match runner.run(&ScrubOptions::default()).await {
        Err(err) => err,
        Ok(other) => bail!("unexpected outcome: {other:?}"),
    };
    let ScrubError::Integrity { model, hint, .. } = &err else {
        bail!("expected an integrity error, got {err}");
    };
    assert_eq!(model, "scrub_unique.accounts");
    assert!(hint.contains("entries_per_provider (currently 5)"));

    // the failed update is rolled back
    let untouched: i64 = sqlx::query_scalar(
        "select count(*) from scrub_unique.accounts where email like '%@corp.example'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(untouched, 10);

    Ok(())
}

#[tokio::test]
async fn disconnected_trigger_is_silent_during_update_and_enabled_after() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "008_scrub_signals.sql", "scrub_signals").await?;
    let settings = settings(
        r#"
        environment = "STAGING"
        apps = ["scrub_signals"]
        fake_data_table = "scrub_signals.fake_data"

        [models."scrub_signals.profiles".fields]
        bio = "lorem"

        [models."scrub_signals.profiles".options]
        disconnect_signals = [{ trigger = "profiles_audit" }]
        "#,
    )?;

    let runner = ScrubRunner::new(pool.clone(), &settings, &registry);
    let report = match runner.run(&ScrubOptions::default()).await? {
        ScrubOutcome::Completed(report) => report,
        other => bail!("unexpected outcome: {other:?}"),
    };
    let profiles = report
        .models
        .iter()
        .find(|model| model.model == "scrub_signals.profiles")
        .context("profiles report")?;
    assert_eq!(profiles.update.as_ref().map(|u| u.rows), Some(3));

    let private: i64 =
        sqlx::query_scalar("select count(*) from scrub_signals.profiles where bio like 'private%'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(private, 0);

    let audited: i64 = sqlx::query_scalar("select count(*) from scrub_signals.profile_audit")
        .fetch_one(&pool)
        .await?;
    assert_eq!(audited, 0);

    let enabled: String = sqlx::query_scalar(
        "select tgenabled::text from pg_trigger \
         where tgrelid = 'scrub_signals.profiles'::regclass and tgname = 'profiles_audit'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(enabled, "O");

    // with the trigger back on, later updates are audited again
    sqlx::query("update scrub_signals.profiles set bio = 'after' where id = 1")
        .execute(&pool)
        .await?;
    let audited: i64 = sqlx::query_scalar("select count(*) from scrub_signals.profile_audit")
        .fetch_one(&pool)
        .await?;
    assert_eq!(audited, 1);

    Ok(())
}

#[tokio::test]
async fn newer_direction_trims_recent_rows_only() -> Result<()> {
    let Some(pool) = connect().await? else {
        return Ok(());
    };
    let registry = load_fixture(&pool, "009_trim_newer.sql", "scrub_newer").await?;
    let events = registry.get("scrub_newer.events")?;

    let options = TrimOptions {
        attribute: "created_at".to_string(),
        direction: TrimDirection::Newer,
        dependents: Vec::new(),
    };
    let trimmer = Trimmer::new(
        &pool,
        events,
        &options,
        30,
        TrimSettings {
            page_size: 10,
            workers: 2,
        },
    );
    let report = trimmer.run().await?;

    assert_eq!(report.candidates, 2);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.skipped, 0);

    let remaining: Vec<i64> = sqlx::query_scalar("select id from scrub_newer.events order by id")
        .fetch_all(&pool)
        .await?;
    assert_eq!(remaining, vec![1, 2]);

    Ok(())
}
