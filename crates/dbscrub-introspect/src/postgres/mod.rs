use sqlx::PgPool;
use tracing::debug;

use dbscrub_core::{ModelRegistry, Result};

use crate::adapter::Adapter;
use crate::options::IntrospectOptions;

mod mapper;
mod queries;

/// Adapter for PostgreSQL databases.
#[derive(Debug, Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Create a new adapter using a pre-configured pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Adapter for PostgresAdapter {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn load_models(&self, opts: &IntrospectOptions) -> Result<ModelRegistry> {
        load(&self.pool, opts).await
    }
}

/// Load models with default options.
pub async fn load_models(pool: &PgPool) -> Result<ModelRegistry> {
    load_models_with_options(pool, IntrospectOptions::default()).await
}

/// Load models with caller-provided options.
pub async fn load_models_with_options(
    pool: &PgPool,
    opts: IntrospectOptions,
) -> Result<ModelRegistry> {
    load(pool, &opts).await
}

async fn load(pool: &PgPool, opts: &IntrospectOptions) -> Result<ModelRegistry> {
    let schemas = mapper::filter_schemas(queries::list_schemas(pool).await?, opts);
    let mut models = Vec::new();

    for schema_name in &schemas {
        let raw_tables = queries::list_tables_in_schema(pool, schema_name).await?;
        let mut tables = mapper::map_tables(schema_name, raw_tables, opts);

        for model in &mut tables {
            let raw_columns = queries::list_columns(pool, schema_name, &model.name).await?;
            let unique_keys = queries::list_unique_keys(pool, schema_name, &model.name).await?;
            model.fields = mapper::map_columns(raw_columns, &unique_keys);

            if let Some(pk) = queries::get_primary_key(pool, schema_name, &model.name).await? {
                if let [column] = pk.columns.as_slice()
                    && let Some(field) = model.fields.iter_mut().find(|field| &field.name == column)
                {
                    field.is_unique = true;
                }
                model.primary_key = pk.columns;
            }
        }

        models.extend(tables);
    }

    let foreign_keys = queries::list_foreign_keys(pool, &schemas).await?;
    mapper::attach_dependents(&mut models, foreign_keys);

    debug!(schemas = schemas.len(), models = models.len(), "catalog loaded");

    Ok(ModelRegistry::new(models))
}
