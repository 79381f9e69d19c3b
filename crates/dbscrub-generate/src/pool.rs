use std::collections::HashSet;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use dbscrub_core::quote_label;

use crate::errors::GenerationError;
use crate::faker::{FakerCatalog, LocaleKey};

/// Rows inserted per statement while filling the pool.
const INSERT_BATCH: usize = 1000;

/// Attempts at a value not yet in the pool before suffixing the offset.
const MAX_DUPLICATE_RETRIES: usize = 10;

/// Values added to the pool for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub provider: String,
    pub locale: String,
    pub existing: u64,
    pub inserted: u64,
}

/// Cache table of pre-generated faker values.
#[derive(Debug, Clone)]
pub struct FakeDataPool {
    pool: PgPool,
    table: String,
    entries_per_provider: u32,
    seed: Option<u64>,
}

impl FakeDataPool {
    pub fn new(
        pool: PgPool,
        table: &str,
        entries_per_provider: u32,
        seed: Option<u64>,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            pool,
            table: quote_label(table)?,
            entries_per_provider,
            seed,
        })
    }

    /// Quoted name of the pool table.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn entries_per_provider(&self) -> u32 {
        self.entries_per_provider
    }

    /// Create the pool table if missing. Concurrent callers are serialized.
    pub async fn create_table(&self) -> Result<(), GenerationError> {
        let sql = format!(
            "create table if not exists {} (
               provider text not null,
               locale text not null,
               provider_offset integer not null,
               content text not null,
               primary key (provider, locale, provider_offset)
             )",
            self.table
        );
        let mut tx = self.pool.begin().await?;
        lock(&mut tx, &self.table).await?;
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Make sure offsets `0..entries_per_provider` exist for the provider.
    ///
    /// The fill runs in one transaction holding a lock on the provider and
    /// locale, so parallel runs never generate the same offsets twice.
    pub async fn ensure(&self, provider: &str, locale: &str) -> Result<PoolReport, GenerationError> {
        FakerCatalog::validate(provider, locale)?;
        let locale_key = LocaleKey::parse(locale)?;
        self.create_table().await?;

        let mut tx = self.pool.begin().await?;
        lock(
            &mut tx,
            &format!("{}:{provider}:{}", self.table, locale_key.as_str()),
        )
        .await?;

        let sql = format!(
            "select provider_offset, content from {} \
             where provider = $1 and locale = $2 and provider_offset < $3",
            self.table
        );
        let existing: Vec<(i32, String)> = sqlx::query_as(&sql)
            .bind(provider)
            .bind(locale_key.as_str())
            .bind(self.entries_per_provider as i32)
            .fetch_all(&mut *tx)
            .await?;

        let present: HashSet<i32> = existing.iter().map(|(offset, _)| *offset).collect();
        let mut seen: HashSet<String> = existing.into_iter().map(|(_, content)| content).collect();
        let missing: Vec<i32> = (0..self.entries_per_provider as i32)
            .filter(|offset| !present.contains(offset))
            .collect();

        let report = PoolReport {
            provider: provider.to_string(),
            locale: locale_key.as_str().to_string(),
            existing: present.len() as u64,
            inserted: missing.len() as u64,
        };

        if missing.is_empty() {
            tx.commit().await?;
            debug!(provider, locale = %locale_key.as_str(), "fake data pool already filled");
            return Ok(report);
        }

        let mut rng = self.rng_for(provider, locale_key);
        let mut rows = Vec::with_capacity(missing.len());
        for offset in missing {
            let content = unique_value(provider, locale_key, offset, &mut seen, &mut rng)?;
            rows.push((offset, content));
        }

        for chunk in rows.chunks(INSERT_BATCH) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "insert into {} (provider, locale, provider_offset, content) ",
                self.table
            ));
            builder.push_values(chunk, |mut row, (offset, content)| {
                row.push_bind(provider)
                    .push_bind(locale_key.as_str())
                    .push_bind(*offset)
                    .push_bind(content.as_str());
            });
            builder.push(" on conflict do nothing");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(
            provider,
            locale = %locale_key.as_str(),
            inserted = report.inserted,
            "fake data pool filled"
        );
        Ok(report)
    }

    /// Delete every pooled value; a missing table is not an error.
    pub async fn clear(&self) -> Result<u64, GenerationError> {
        let exists: Option<String> = sqlx::query_scalar("select to_regclass($1)::text")
            .bind(&self.table)
            .fetch_one(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(0);
        }
        let result = sqlx::query(&format!("delete from {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn rng_for(&self, provider: &str, locale: LocaleKey) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(hash_seed(
                seed,
                &format!("{provider}:{}", locale.as_str()),
            )),
            None => ChaCha8Rng::from_os_rng(),
        }
    }
}

/// Transaction-scoped advisory lock on `key`.
async fn lock(conn: &mut PgConnection, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("select pg_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

fn unique_value(
    provider: &str,
    locale: LocaleKey,
    offset: i32,
    seen: &mut HashSet<String>,
    rng: &mut dyn RngCore,
) -> Result<String, GenerationError> {
    for _ in 0..MAX_DUPLICATE_RETRIES {
        let value = FakerCatalog::generate(provider, locale, rng)?;
        if seen.insert(value.clone()) {
            return Ok(value);
        }
    }
    let value = format!("{}-{offset}", FakerCatalog::generate(provider, locale, rng)?);
    seen.insert(value.clone());
    Ok(value)
}

fn hash_seed(seed: u64, key: &str) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
