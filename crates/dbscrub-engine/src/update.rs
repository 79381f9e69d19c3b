use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use dbscrub_core::{
    DisconnectSignal, Error, ModelDescriptor, RealizedRules, ScrubExpr, ScrubValue, SqlValue,
    quote_ident, quote_label, quote_relation,
};
use dbscrub_generate::LocaleKey;

use crate::errors::{ScrubError, classify_update_error};

/// Alias of the updated table inside the statement.
const TARGET: &str = "scrub_target";

/// Everything needed to render one model's bulk update.
#[derive(Debug, Clone, Copy)]
pub struct UpdatePlan<'a> {
    pub model: &'a ModelDescriptor,
    pub realized: &'a RealizedRules,
    /// Rows matching every `(column, value)` pair are left untouched.
    pub exclude: &'a [(String, SqlValue)],
    /// Quoted name of the fake-data table.
    pub pool_table: &'a str,
    pub pool_size: u32,
}

/// Rows touched by one bulk update.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UpdateReport {
    pub model: String,
    pub fields: Vec<String>,
    pub rows: u64,
}

fn target_column(column: &str) -> String {
    format!("{}.{}", quote_ident(TARGET), quote_ident(column))
}

/// Row partition index in `0..pool_size`, used as the pool offset.
///
/// Integer keys map directly; anything else goes through `hashtext`.
pub fn mod_pk_sql(model: &ModelDescriptor, pool_size: u32) -> String {
    let p = pool_size;
    let hashed = |expr: String| format!("((hashtext({expr})::bigint % {p}) + {p}) % {p}");
    match model.single_primary_key() {
        Some(field) if field.kind.is_integer() => {
            let column = target_column(&field.name);
            format!("(({column} % {p}) + {p}) % {p}")
        }
        Some(field) => hashed(format!("{}::text", target_column(&field.name))),
        None if !model.primary_key.is_empty() => {
            let columns: Vec<String> = model
                .primary_key
                .iter()
                .map(|column| target_column(column))
                .collect();
            hashed(format!("row({})::text", columns.join(", ")))
        }
        None => hashed(format!("{}.ctid::text", quote_ident(TARGET))),
    }
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: &SqlValue) {
    match value {
        SqlValue::Null => {
            builder.push("NULL");
        }
        SqlValue::Bool(value) => {
            builder.push_bind(*value);
        }
        SqlValue::Int(value) => {
            builder.push_bind(*value);
        }
        SqlValue::Float(value) => {
            builder.push_bind(*value);
        }
        SqlValue::Text(value) => {
            builder.push_bind(value.clone());
        }
    }
}

fn push_expr(
    builder: &mut QueryBuilder<'static, Postgres>,
    expr: &ScrubExpr,
    plan: &UpdatePlan<'_>,
    mod_pk: &str,
) -> Result<(), ScrubError> {
    match expr {
        ScrubExpr::Value(value) => push_value(builder, value),
        ScrubExpr::Column(column) => {
            builder.push(target_column(column));
        }
        ScrubExpr::Hash { column, max_length } => {
            let digest = format!("md5({}::text)", target_column(column));
            match max_length {
                Some(limit) if *limit > 0 => builder.push(format!("left({digest}, {limit})")),
                _ => builder.push(digest),
            };
        }
        ScrubExpr::Pooled { provider, locale } => {
            let locale = LocaleKey::parse(locale)?;
            builder.push(format!(
                "(SELECT content FROM {} WHERE provider = ",
                plan.pool_table
            ));
            builder.push_bind(provider.clone());
            builder.push(" AND locale = ");
            builder.push_bind(locale.as_str().to_string());
            builder.push(format!(" AND provider_offset = {mod_pk})"));
        }
        ScrubExpr::Concat(parts) => {
            builder.push("concat(");
            for (index, part) in parts.iter().enumerate() {
                if index > 0 {
                    builder.push(", ");
                }
                push_expr(builder, part, plan, mod_pk)?;
            }
            builder.push(")");
        }
    }
    Ok(())
}

/// Render `UPDATE ... SET ... WHERE NOT (exclude)` with bound values.
pub fn build_update(plan: &UpdatePlan<'_>) -> Result<QueryBuilder<'static, Postgres>, ScrubError> {
    let model = plan.model;
    let label = model.label();
    let mod_pk = mod_pk_sql(model, plan.pool_size);
    let mut builder = QueryBuilder::new(format!(
        "UPDATE {} AS {} SET ",
        quote_relation(&model.app_label, &model.name),
        quote_ident(TARGET)
    ));

    for (index, realized) in plan.realized.fields.iter().enumerate() {
        let field = model.field(&realized.field).ok_or_else(|| {
            Error::Other(format!("realized rule for unknown field {label}.{}", realized.field))
        })?;
        if index > 0 {
            builder.push(", ");
        }
        builder.push(quote_ident(&field.name)).push(" = ");

        let cast = !field.kind.is_text();
        if cast {
            builder.push("CAST(");
        }
        match &realized.value {
            ScrubValue::Literal(value) => push_value(&mut builder, value),
            ScrubValue::Expr(expr) => push_expr(&mut builder, expr, plan, &mod_pk)?,
        }
        if cast {
            builder.push(format!(" AS {})", field.data_type));
        }
    }

    if !plan.exclude.is_empty() {
        builder.push(" WHERE NOT (");
        for (index, (column, value)) in plan.exclude.iter().enumerate() {
            let field = model.field(column).ok_or_else(|| {
                Error::InvalidConfig(format!("exclude references unknown field {label}.{column}"))
            })?;
            if index > 0 {
                builder.push(" AND ");
            }
            builder.push(format!("{} IS NOT DISTINCT FROM ", target_column(column)));
            if matches!(value, SqlValue::Null) {
                builder.push("NULL");
            } else {
                builder.push("CAST(");
                push_value(&mut builder, value);
                builder.push(format!(" AS {})", field.data_type));
            }
        }
        builder.push(")");
    }

    Ok(builder)
}

/// `ALTER TABLE ... ENABLE|DISABLE TRIGGER ...` for a disconnected signal.
pub fn trigger_sql(
    model: &ModelDescriptor,
    signal: &DisconnectSignal,
    enable: bool,
) -> Result<String, ScrubError> {
    let table = match &signal.table {
        Some(label) => quote_label(label)?,
        None => quote_relation(&model.app_label, &model.name),
    };
    let trigger = match signal.trigger.as_str() {
        "ALL" | "USER" => signal.trigger.clone(),
        name => quote_ident(name),
    };
    let action = if enable { "ENABLE" } else { "DISABLE" };
    Ok(format!("ALTER TABLE {table} {action} TRIGGER {trigger}"))
}

/// Run the bulk update for one model inside a transaction.
///
/// Disconnected triggers are disabled for the update and re-enabled before
/// commit; a failure rolls both back.
pub async fn apply_update(
    pool: &PgPool,
    plan: &UpdatePlan<'_>,
    signals: &[DisconnectSignal],
) -> Result<UpdateReport, ScrubError> {
    let label = plan.model.label();
    let mut builder = build_update(plan)?;
    debug!(model = %label, sql = builder.sql(), "update statement built");

    let mut tx = pool.begin().await?;
    for signal in signals {
        let sql = trigger_sql(plan.model, signal, false)?;
        sqlx::query(&sql).execute(&mut *tx).await?;
    }

    let result = builder
        .build()
        .execute(&mut *tx)
        .await
        .map_err(|err| classify_update_error(&label, err, plan.pool_size))?;

    for signal in signals {
        let sql = trigger_sql(plan.model, signal, true)?;
        sqlx::query(&sql).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    let report = UpdateReport {
        model: label,
        fields: plan
            .realized
            .fields
            .iter()
            .map(|realized| realized.field.clone())
            .collect(),
        rows: result.rows_affected(),
    };
    info!(
        model = %report.model,
        rows = report.rows,
        fields = report.fields.len(),
        "model scrubbed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use dbscrub_core::{FieldDescriptor, FieldKind, ModelKind, RealizedField};

    use super::*;

    fn users() -> ModelDescriptor {
        ModelDescriptor {
            app_label: "public".to_string(),
            name: "users".to_string(),
            kind: ModelKind::Table,
            primary_key: vec!["id".to_string()],
            fields: vec![
                FieldDescriptor::new("id", FieldKind::Integer, "integer"),
                FieldDescriptor::new("name", FieldKind::Text, "character varying(50)"),
                FieldDescriptor::new("email", FieldKind::Text, "text"),
                FieldDescriptor::new("age", FieldKind::Integer, "integer"),
                FieldDescriptor::new("is_staff", FieldKind::Boolean, "boolean"),
            ],
            dependents: Vec::new(),
        }
    }

    fn realized(fields: Vec<(&str, ScrubValue)>) -> RealizedRules {
        RealizedRules {
            fields: fields
                .into_iter()
                .map(|(field, value)| RealizedField {
                    field: field.to_string(),
                    value,
                })
                .collect(),
            disabled: Vec::new(),
        }
    }

    #[test]
    fn renders_literals_with_casts_and_exclusion() {
        let model = users();
        let rules = realized(vec![
            ("name", ScrubValue::text("x")),
            ("age", ScrubValue::Expr(ScrubExpr::Value(SqlValue::Int(0)))),
        ]);
        let exclude = vec![("is_staff".to_string(), SqlValue::Bool(true))];
        let plan = UpdatePlan {
            model: &model,
            realized: &rules,
            exclude: &exclude,
            pool_table: "\"public\".\"scrubber_fake_data\"",
            pool_size: 1000,
        };
        let builder = build_update(&plan).unwrap();
        assert_eq!(
            builder.sql(),
            "UPDATE \"public\".\"users\" AS \"scrub_target\" SET \"name\" = $1, \
             \"age\" = CAST($2 AS integer) WHERE NOT \
             (\"scrub_target\".\"is_staff\" IS NOT DISTINCT FROM CAST($3 AS boolean))"
        );
    }

    #[test]
    fn pooled_values_read_the_pool_at_mod_pk() {
        let model = users();
        let rules = realized(vec![(
            "email",
            ScrubValue::Expr(ScrubExpr::Pooled {
                provider: "safe_email".to_string(),
                locale: "en".to_string(),
            }),
        )]);
        let plan = UpdatePlan {
            model: &model,
            realized: &rules,
            exclude: &[],
            pool_table: "\"public\".\"scrubber_fake_data\"",
            pool_size: 50,
        };
        let builder = build_update(&plan).unwrap();
        assert_eq!(
            builder.sql(),
            "UPDATE \"public\".\"users\" AS \"scrub_target\" SET \"email\" = \
             (SELECT content FROM \"public\".\"scrubber_fake_data\" WHERE provider = $1 \
             AND locale = $2 AND provider_offset = \
             ((\"scrub_target\".\"id\" % 50) + 50) % 50)"
        );
    }

    #[test]
    fn templates_and_hashes_render_as_sql_expressions() {
        let model = users();
        let rules = realized(vec![
            (
                "email",
                ScrubValue::Expr(ScrubExpr::Concat(vec![
                    ScrubExpr::Value(SqlValue::Text("user".to_string())),
                    ScrubExpr::Column("id".to_string()),
                    ScrubExpr::Value(SqlValue::Text("@example.invalid".to_string())),
                ])),
            ),
            (
                "name",
                ScrubValue::Expr(ScrubExpr::Hash {
                    column: "name".to_string(),
                    max_length: Some(50),
                }),
            ),
        ]);
        let plan = UpdatePlan {
            model: &model,
            realized: &rules,
            exclude: &[],
            pool_table: "\"public\".\"scrubber_fake_data\"",
            pool_size: 50,
        };
        let sql = build_update(&plan).unwrap().sql().to_string();
        assert!(sql.contains("\"email\" = concat($1, \"scrub_target\".\"id\", $2)"));
        assert!(sql.contains("\"name\" = left(md5(\"scrub_target\".\"name\"::text), 50)"));
    }

    #[test]
    fn unknown_exclude_column_is_rejected() {
        let model = users();
        let rules = realized(vec![("name", ScrubValue::text("x"))]);
        let exclude = vec![("is_admin".to_string(), SqlValue::Bool(true))];
        let plan = UpdatePlan {
            model: &model,
            realized: &rules,
            exclude: &exclude,
            pool_table: "\"public\".\"scrubber_fake_data\"",
            pool_size: 50,
        };
        assert!(matches!(
            build_update(&plan),
            Err(ScrubError::Core(Error::InvalidConfig(_)))
        ));
    }

    #[test]
    fn mod_pk_hashes_non_integer_and_composite_keys() {
        let mut model = users();
        model.fields[0] = FieldDescriptor::new("id", FieldKind::Uuid, "uuid");
        assert_eq!(
            mod_pk_sql(&model, 10),
            "((hashtext(\"scrub_target\".\"id\"::text)::bigint % 10) + 10) % 10"
        );

        model.primary_key = vec!["id".to_string(), "email".to_string()];
        assert!(mod_pk_sql(&model, 10).contains("row(\"scrub_target\".\"id\", \"scrub_target\".\"email\")"));

        model.primary_key.clear();
        assert!(mod_pk_sql(&model, 10).contains("\"scrub_target\".ctid"));
    }

    #[test]
    fn trigger_statements_quote_names_but_not_keywords() {
        let model = users();
        let named = DisconnectSignal {
            trigger: "users_audit".to_string(),
            table: None,
        };
        assert_eq!(
            trigger_sql(&model, &named, false).unwrap(),
            "ALTER TABLE \"public\".\"users\" DISABLE TRIGGER \"users_audit\""
        );
        let all = DisconnectSignal {
            trigger: "USER".to_string(),
            table: Some("audit.events".to_string()),
        };
        assert_eq!(
            trigger_sql(&model, &all, true).unwrap(),
            "ALTER TABLE \"audit\".\"events\" ENABLE TRIGGER USER"
        );
    }
}
