use std::sync::Arc;

use serde::Serialize;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use dbscrub_core::{
    FieldDescriptor, ModelDescriptor, Relation, TrimDirection, TrimOptions, quote_ident,
    quote_relation,
};

use crate::errors::{ScrubError, sqlstate};

/// SQLSTATEs raised by protective foreign keys.
const PROTECTED_SQLSTATES: [&str; 2] = ["23503", "23001"];

/// Rows selected for deletion: `attribute` compared with `now() - older_than_days`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimWindow {
    pub attribute: String,
    pub direction: TrimDirection,
    pub older_than_days: u32,
}

impl TrimWindow {
    pub fn new(options: &TrimOptions, older_than_days: u32) -> Self {
        Self {
            attribute: options.attribute.clone(),
            direction: options.direction,
            older_than_days,
        }
    }

    /// Predicate over the model's rows.
    pub fn condition(&self) -> String {
        let op = match self.direction {
            TrimDirection::Older => "<",
            TrimDirection::Newer => ">=",
        };
        format!(
            "{} {op} now() - make_interval(days => {})",
            quote_ident(&self.attribute),
            self.older_than_days.min(i32::MAX as u32)
        )
    }
}

/// Tuning for a trim run.
#[derive(Debug, Clone, Copy)]
pub struct TrimSettings {
    pub page_size: u32,
    pub workers: usize,
}

/// Outcome of deleting one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(u64),
    /// Deleted after overriding a protective constraint.
    Forced(u64),
    Skipped,
}

/// Counters for one model's trim.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TrimReport {
    pub model: String,
    pub candidates: u64,
    pub pages: u64,
    pub dependents_deleted: u64,
    pub deleted: u64,
    pub forced: u64,
    pub skipped: u64,
    pub swept: u64,
}

impl TrimReport {
    fn record(&mut self, outcome: DeleteOutcome, dependent: bool) {
        match outcome {
            DeleteOutcome::Deleted(rows) if dependent => self.dependents_deleted += rows,
            DeleteOutcome::Deleted(rows) => self.deleted += rows,
            DeleteOutcome::Forced(rows) => {
                self.forced += 1;
                if dependent {
                    self.dependents_deleted += rows;
                } else {
                    self.deleted += rows;
                }
            }
            DeleteOutcome::Skipped => self.skipped += 1,
        }
    }
}

fn statement<'q>(sql: &'q str, key: Option<&'q str>) -> Query<'q, Postgres, PgArguments> {
    let query = sqlx::query(sql);
    match key {
        Some(key) => query.bind(key),
        None => query,
    }
}

/// Failures that say nothing about the row: the database itself is gone.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Run a delete, retrying once with constraints overridden when a
/// protective foreign key rejects it.
///
/// Row-level failures are logged and reported as `Skipped`; only a lost
/// connection is returned as an error. `key` is bound as `$1` when given.
pub async fn force_delete(
    pool: &PgPool,
    sql: &str,
    key: Option<&str>,
) -> Result<DeleteOutcome, sqlx::Error> {
    let err = match statement(sql, key).execute(pool).await {
        Ok(result) => return Ok(DeleteOutcome::Deleted(result.rows_affected())),
        Err(err) if is_connection_error(&err) => return Err(err),
        Err(err) => err,
    };
    let shown = key.unwrap_or("*");

    let protected = sqlstate(&err).is_some_and(|code| PROTECTED_SQLSTATES.contains(&code.as_str()));
    if !protected {
        warn!(key = shown, error = %err, "delete failed, skipping row");
        return Ok(DeleteOutcome::Skipped);
    }

    debug!(key = shown, error = %err, "protected row, retrying with constraints overridden");
    match delete_overriding_constraints(pool, sql, key).await {
        Ok(rows) => Ok(DeleteOutcome::Forced(rows)),
        Err(err) if is_connection_error(&err) => Err(err),
        Err(err) => {
            warn!(key = shown, error = %err, "forced delete failed, skipping row");
            Ok(DeleteOutcome::Skipped)
        }
    }
}

async fn delete_overriding_constraints(
    pool: &PgPool,
    sql: &str,
    key: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET LOCAL session_replication_role = replica")
        .execute(&mut *tx)
        .await?;
    let result = statement(sql, key).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Bulk deleter for one model and window.
pub struct Trimmer<'a> {
    pool: &'a PgPool,
    model: &'a ModelDescriptor,
    window: TrimWindow,
    dependents: Vec<&'a Relation>,
    settings: TrimSettings,
}

impl<'a> Trimmer<'a> {
    /// Declared dependents that are not incoming relations of the model
    /// are logged and ignored.
    pub fn new(
        pool: &'a PgPool,
        model: &'a ModelDescriptor,
        options: &TrimOptions,
        older_than_days: u32,
        settings: TrimSettings,
    ) -> Self {
        let dependents = options
            .dependents
            .iter()
            .filter_map(|label| {
                let relation = model.dependent(label);
                if relation.is_none() {
                    warn!(
                        model = %model.label(),
                        dependent = %label,
                        "declared dependent has no foreign key to the model"
                    );
                }
                relation
            })
            .collect();
        Self {
            pool,
            model,
            window: TrimWindow::new(options, older_than_days),
            dependents,
            settings,
        }
    }

    fn table(&self) -> String {
        quote_relation(&self.model.app_label, &self.model.name)
    }

    pub fn count_sql(&self) -> String {
        format!(
            "SELECT count(*) FROM {} WHERE {}",
            self.table(),
            self.window.condition()
        )
    }

    /// Next page of candidate keys, as text; `$1` is the page size and
    /// `$2` the last key of the previous page.
    pub fn page_sql(&self, pk: &FieldDescriptor, first: bool) -> String {
        let column = quote_ident(&pk.name);
        let after = if first {
            String::new()
        } else {
            format!(" AND {column} > CAST($2 AS {})", pk.data_type)
        };
        format!(
            "SELECT {column}::text FROM {} WHERE {}{after} ORDER BY {column} LIMIT $1",
            self.table(),
            self.window.condition()
        )
    }

    pub fn delete_row_sql(&self, pk: &FieldDescriptor) -> String {
        format!(
            "DELETE FROM {} WHERE {} = CAST($1 AS {})",
            self.table(),
            quote_ident(&pk.name),
            pk.data_type
        )
    }

    /// Delete the dependent rows referencing the model row keyed by `$1`.
    pub fn delete_dependents_sql(&self, relation: &Relation, pk: &FieldDescriptor) -> String {
        let columns: Vec<String> = relation.columns.iter().map(|c| quote_ident(c)).collect();
        let referenced: Vec<String> = relation
            .referenced_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect();
        format!(
            "DELETE FROM {} WHERE ({}) IN (SELECT {} FROM {} WHERE {} = CAST($1 AS {}))",
            quote_relation(&relation.app_label, &relation.model),
            columns.join(", "),
            referenced.join(", "),
            self.table(),
            quote_ident(&pk.name),
            pk.data_type
        )
    }

    pub fn sweep_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {}", self.table(), self.window.condition())
    }

    /// Delete dependents, then rows, page by page, then sweep the window.
    pub async fn run(&self) -> Result<TrimReport, ScrubError> {
        let label = self.model.label();
        let mut report = TrimReport {
            model: label.clone(),
            ..TrimReport::default()
        };

        let candidates: i64 = sqlx::query_scalar(&self.count_sql())
            .fetch_one(self.pool)
            .await?;
        report.candidates = candidates.max(0) as u64;
        let page_size = u64::from(self.settings.page_size.max(1));
        report.pages = report.candidates.div_ceil(page_size);

        info!(
            model = %label,
            attribute = %self.window.attribute,
            older_than = self.window.older_than_days,
            candidates = report.candidates,
            pages = report.pages,
            "trim started"
        );

        match self.model.single_primary_key() {
            Some(pk) if report.candidates > 0 => {
                for relation in &self.dependents {
                    let sql = self.delete_dependents_sql(relation, pk);
                    self.delete_pages(pk, Arc::from(sql), true, &mut report)
                        .await?;
                }
                let sql = self.delete_row_sql(pk);
                self.delete_pages(pk, Arc::from(sql), false, &mut report)
                    .await?;
            }
            Some(_) => {}
            None => debug!(model = %label, "no single-column primary key, sweeping only"),
        }

        match force_delete(self.pool, &self.sweep_sql(), None).await? {
            DeleteOutcome::Deleted(rows) => report.swept = rows,
            DeleteOutcome::Forced(rows) => {
                report.forced += 1;
                report.swept = rows;
            }
            DeleteOutcome::Skipped => report.skipped += 1,
        }

        info!(
            model = %label,
            deleted = report.deleted,
            dependents = report.dependents_deleted,
            forced = report.forced,
            skipped = report.skipped,
            swept = report.swept,
            "trim finished"
        );
        Ok(report)
    }

    async fn delete_pages(
        &self,
        pk: &FieldDescriptor,
        sql: Arc<str>,
        dependent: bool,
        report: &mut TrimReport,
    ) -> Result<(), ScrubError> {
        let label = self.model.label();
        let limit = i64::from(self.settings.page_size.max(1));
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let phase = if dependent { "dependents" } else { "rows" };
        let mut last: Option<String> = None;
        let mut page = 0_u64;

        loop {
            let keys: Vec<String> = match &last {
                None => {
                    sqlx::query_scalar(&self.page_sql(pk, true))
                        .bind(limit)
                        .fetch_all(self.pool)
                        .await?
                }
                Some(after) => {
                    sqlx::query_scalar(&self.page_sql(pk, false))
                        .bind(limit)
                        .bind(after)
                        .fetch_all(self.pool)
                        .await?
                }
            };
            let Some(tail) = keys.last().cloned() else {
                break;
            };
            page += 1;

            let mut tasks = JoinSet::new();
            for key in keys {
                let pool = self.pool.clone();
                let sql = Arc::clone(&sql);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    force_delete(&pool, &sql, Some(&key)).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => report.record(outcome, dependent),
                    Ok(Err(err)) => {
                        tasks.abort_all();
                        return Err(err.into());
                    }
                    Err(err) => {
                        warn!(model = %label, error = %err, "delete task failed");
                        report.skipped += 1;
                    }
                }
            }

            info!(
                model = %label,
                page,
                pages = report.pages,
                phase,
                "trim page done"
            );
            last = Some(tail);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dbscrub_core::{FieldKind, FkAction, ModelKind};

    use super::*;

    fn orders_parent() -> ModelDescriptor {
        ModelDescriptor {
            app_label: "shop".to_string(),
            name: "customers".to_string(),
            kind: ModelKind::Table,
            primary_key: vec!["id".to_string()],
            fields: vec![
                FieldDescriptor::new("id", FieldKind::BigInteger, "bigint"),
                FieldDescriptor::new("created_at", FieldKind::Timestamp, "timestamp with time zone"),
            ],
            dependents: vec![Relation {
                name: "orders_customer_fk".to_string(),
                app_label: "shop".to_string(),
                model: "orders".to_string(),
                columns: vec!["customer_id".to_string()],
                referenced_columns: vec!["id".to_string()],
                on_delete: FkAction::Restrict,
            }],
        }
    }

    fn options(direction: TrimDirection) -> TrimOptions {
        TrimOptions {
            attribute: "created_at".to_string(),
            direction,
            dependents: vec!["shop.orders".to_string(), "shop.refunds".to_string()],
        }
    }

    #[test]
    fn window_direction_picks_the_comparison() {
        let older = TrimWindow::new(&options(TrimDirection::Older), 30);
        assert_eq!(
            older.condition(),
            "\"created_at\" < now() - make_interval(days => 30)"
        );
        let newer = TrimWindow::new(&options(TrimDirection::Newer), 30);
        assert!(newer.condition().contains(">= now()"));
    }

    #[test]
    fn record_counts_forced_rows_as_deleted() {
        let mut report = TrimReport::default();
        report.record(DeleteOutcome::Deleted(1), false);
        report.record(DeleteOutcome::Forced(1), false);
        report.record(DeleteOutcome::Deleted(3), true);
        report.record(DeleteOutcome::Skipped, false);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.forced, 1);
        assert_eq!(report.dependents_deleted, 3);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn lost_connection_is_an_error_not_a_skipped_row() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://127.0.0.1:1/unused")
            .unwrap();
        let result = force_delete(&pool, "DELETE FROM \"shop\".\"customers\"", None).await;
        assert!(matches!(
            result,
            Err(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
        ));
    }

    #[tokio::test]
    async fn builds_keyset_and_dependent_statements() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let model = orders_parent();
        let trimmer = Trimmer::new(
            &pool,
            &model,
            &options(TrimDirection::Older),
            90,
            TrimSettings {
                page_size: 250,
                workers: 4,
            },
        );
        assert_eq!(trimmer.dependents.len(), 1);

        let pk = model.single_primary_key().unwrap();
        assert_eq!(
            trimmer.page_sql(pk, false),
            "SELECT \"id\"::text FROM \"shop\".\"customers\" WHERE \"created_at\" < now() - \
             make_interval(days => 90) AND \"id\" > CAST($2 AS bigint) ORDER BY \"id\" LIMIT $1"
        );
        assert_eq!(
            trimmer.delete_dependents_sql(trimmer.dependents[0], pk),
            "DELETE FROM \"shop\".\"orders\" WHERE (\"customer_id\") IN (SELECT \"id\" FROM \
             \"shop\".\"customers\" WHERE \"id\" = CAST($1 AS bigint))"
        );
        assert_eq!(
            trimmer.delete_row_sql(pk),
            "DELETE FROM \"shop\".\"customers\" WHERE \"id\" = CAST($1 AS bigint)"
        );
    }
}
