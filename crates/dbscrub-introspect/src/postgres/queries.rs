use sqlx::{FromRow, PgPool};

use dbscrub_core::{Error, Result};

fn db_error(err: sqlx::Error) -> Error {
    Error::Db(err.to_string())
}

pub async fn list_schemas(pool: &PgPool) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>("select nspname::text from pg_namespace order by nspname")
        .fetch_all(pool)
        .await
        .map_err(db_error)
}

#[derive(Debug, FromRow)]
pub struct RawTable {
    pub name: String,
    pub relkind: String,
}

pub async fn list_tables_in_schema(pool: &PgPool, schema: &str) -> Result<Vec<RawTable>> {
    sqlx::query_as::<_, RawTable>(
        r#"
        select
          c.relname::text as name,
          c.relkind::text as relkind
        from pg_class c
        join pg_namespace n on n.oid = c.relnamespace
        where n.nspname = $1
          and c.relkind in ('r','p','v','m','f')
          and not c.relispartition
        order by c.relname
        "#,
    )
    .bind(schema)
    .fetch_all(pool)
    .await
    .map_err(db_error)
}

#[derive(Debug, FromRow)]
pub struct RawColumn {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
    pub is_enum: bool,
    pub is_nullable: bool,
    pub is_generated: bool,
    pub character_max_length: Option<i32>,
}

pub async fn list_columns(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<RawColumn>> {
    sqlx::query_as::<_, RawColumn>(
        r#"
        select
          a.attname::text as name,
          pg_catalog.format_type(a.atttypid, a.atttypmod) as data_type,
          t.typname::text as udt_name,
          (t.typtype = 'e') as is_enum,
          (not a.attnotnull) as is_nullable,
          (a.attgenerated <> '' or a.attidentity = 'a') as is_generated,
          ic.character_maximum_length::int4 as character_max_length
        from pg_attribute a
        join pg_class c on c.oid = a.attrelid
        join pg_namespace n on n.oid = c.relnamespace
        join pg_type t on t.oid = a.atttypid
        left join information_schema.columns ic
          on ic.table_schema = n.nspname and ic.table_name = c.relname and ic.column_name = a.attname
        where n.nspname = $1
          and c.relname = $2
          and a.attnum > 0
          and not a.attisdropped
        order by a.attnum
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(db_error)
}

#[derive(Debug, FromRow)]
pub struct RawKey {
    pub columns: Vec<String>,
}

pub async fn get_primary_key(pool: &PgPool, schema: &str, table: &str) -> Result<Option<RawKey>> {
    sqlx::query_as::<_, RawKey>(
        r#"
        select
          array_agg(att.attname::text order by ord.ordinality) as columns
        from pg_constraint con
        join pg_class rel on rel.oid = con.conrelid
        join pg_namespace nsp on nsp.oid = rel.relnamespace
        join unnest(con.conkey) with ordinality as ord(attnum, ordinality) on true
        join pg_attribute att on att.attrelid = rel.oid and att.attnum = ord.attnum
        where nsp.nspname = $1
          and rel.relname = $2
          and con.contype = 'p'
        group by con.conname
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_optional(pool)
    .await
    .map_err(db_error)
}

pub async fn list_unique_keys(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<RawKey>> {
    sqlx::query_as::<_, RawKey>(
        r#"
        select
          array_agg(att.attname::text order by ord.ordinality) as columns
        from pg_index i
        join pg_class rel on rel.oid = i.indrelid
        join pg_namespace nsp on nsp.oid = rel.relnamespace
        join unnest(i.indkey) with ordinality as ord(attnum, ordinality) on true
        join pg_attribute att on att.attrelid = rel.oid and att.attnum = ord.attnum
        where nsp.nspname = $1
          and rel.relname = $2
          and i.indisunique
          and not i.indisprimary
        group by i.indexrelid
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(db_error)
}

#[derive(Debug, FromRow)]
pub struct RawForeignKey {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete_code: String,
}

/// Every foreign key declared in the given schemas.
pub async fn list_foreign_keys(pool: &PgPool, schemas: &[String]) -> Result<Vec<RawForeignKey>> {
    sqlx::query_as::<_, RawForeignKey>(
        r#"
        select
          con.conname::text as name,
          src_nsp.nspname::text as schema,
          src_rel.relname::text as table,
          array_agg(src_att.attname::text order by s_ord.ordinality) as columns,
          ref_nsp.nspname::text as referenced_schema,
          ref_rel.relname::text as referenced_table,
          array_agg(ref_att.attname::text order by s_ord.ordinality) as referenced_columns,
          con.confdeltype::text as on_delete_code
        from pg_constraint con
        join pg_class src_rel on src_rel.oid = con.conrelid
        join pg_namespace src_nsp on src_nsp.oid = src_rel.relnamespace
        join pg_class ref_rel on ref_rel.oid = con.confrelid
        join pg_namespace ref_nsp on ref_nsp.oid = ref_rel.relnamespace
        join unnest(con.conkey, con.confkey) with ordinality as s_ord(src_attnum, ref_attnum, ordinality) on true
        join pg_attribute src_att on src_att.attrelid = src_rel.oid and src_att.attnum = s_ord.src_attnum
        join pg_attribute ref_att on ref_att.attrelid = ref_rel.oid and ref_att.attnum = s_ord.ref_attnum
        where src_nsp.nspname = any($1)
          and con.contype = 'f'
        group by
          con.conname, src_nsp.nspname, src_rel.relname,
          ref_nsp.nspname, ref_rel.relname, con.confdeltype
        order by src_nsp.nspname, src_rel.relname, con.conname
        "#,
    )
    .bind(schemas)
    .fetch_all(pool)
    .await
    .map_err(db_error)
}
