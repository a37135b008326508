//! Cost store: one row per upstream call (tokens, latency, status).
//!
//! The backend is selected by a single URL — `postgresql://…` gets a
//! connection pool, `sqlite:///…` a local file (created on demand). The
//! `costs` table is created if absent; there are no further migrations.
//! Every operation is fail-soft: a storage error is logged and the
//! caller never sees it.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::llm::types::RequestContext;

const CREATE_TABLE_SQLITE: &str = "\
CREATE TABLE IF NOT EXISTS costs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ts            TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    provider      TEXT NOT NULL,
    model         TEXT NOT NULL,
    input_tokens  INTEGER DEFAULT 0,
    output_tokens INTEGER DEFAULT 0,
    latency_ms    INTEGER DEFAULT 0,
    heinzel_id    TEXT,
    session_id    TEXT,
    task_id       TEXT,
    status        TEXT DEFAULT 'success',
    error_message TEXT
)";

const CREATE_TABLE_PG: &str = "\
CREATE TABLE IF NOT EXISTS costs (
    id            BIGSERIAL PRIMARY KEY,
    ts            TIMESTAMPTZ DEFAULT NOW(),
    provider      TEXT NOT NULL,
    model         TEXT NOT NULL,
    input_tokens  BIGINT DEFAULT 0,
    output_tokens BIGINT DEFAULT 0,
    latency_ms    BIGINT DEFAULT 0,
    heinzel_id    TEXT,
    session_id    TEXT,
    task_id       TEXT,
    status        TEXT DEFAULT 'success',
    error_message TEXT
)";

const INSERT_SQLITE: &str = "\
INSERT INTO costs (ts, provider, model, input_tokens, output_tokens, latency_ms,
                   heinzel_id, session_id, task_id, status, error_message)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_PG: &str = "\
INSERT INTO costs (ts, provider, model, input_tokens, output_tokens, latency_ms,
                   heinzel_id, session_id, task_id, status, error_message)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";

const SELECT_COLUMNS: &str = "\
SELECT id, ts, provider, model, input_tokens, output_tokens, latency_ms,
       heinzel_id, session_id, task_id, status, error_message
FROM costs";

// BIGINT/DOUBLE casts keep the aggregate types identical across backends
const SUMMARY_COLUMNS: &str = "\
SELECT CAST(COUNT(*) AS BIGINT),
       CAST(COALESCE(SUM(input_tokens), 0) AS BIGINT),
       CAST(COALESCE(SUM(output_tokens), 0) AS BIGINT),
       CAST(COALESCE(AVG(latency_ms), 0) AS DOUBLE PRECISION),
       CAST(COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0) AS BIGINT)
FROM costs";

/// One persisted cost row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CostRow {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub latency_ms: i64,
    pub heinzel_id: Option<String>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
}

/// Input for one insert. `status` is `success`, `error`, or `rate_limit`.
#[derive(Debug, Clone)]
pub struct NewCostRow {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub context: RequestContext,
    pub status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CostFilter {
    pub session_id: Option<String>,
    pub heinzel_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostSummary {
    pub total_requests: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub avg_latency_ms: f64,
    pub error_count: i64,
}

pub enum CostStore {
    Postgres(PgPool),
    Sqlite(SqlitePool),
    /// Backend unreachable at startup; every operation becomes a no-op.
    Disabled,
}

impl CostStore {
    /// Connect and create the `costs` table if absent. Connection
    /// failures disable the store rather than failing startup.
    pub async fn connect(url: &str) -> Self {
        if url.starts_with("postgresql") || url.starts_with("postgres://") {
            match Self::connect_pg(url).await {
                Ok(store) => store,
                Err(e) => {
                    tracing::warn!(error = %e, "cost store: postgres unavailable, disabled");
                    CostStore::Disabled
                }
            }
        } else {
            match Self::connect_sqlite(url).await {
                Ok(store) => store,
                Err(e) => {
                    tracing::warn!(error = %e, url, "cost store: sqlite unavailable, disabled");
                    CostStore::Disabled
                }
            }
        }
    }

    async fn connect_pg(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .connect(url)
            .await?;
        sqlx::query(CREATE_TABLE_PG).execute(&pool).await?;
        tracing::info!("cost store: postgres connected");
        Ok(CostStore::Postgres(pool))
    }

    async fn connect_sqlite(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::query(CREATE_TABLE_SQLITE).execute(&pool).await?;
        tracing::info!(url, "cost store: sqlite connected");
        Ok(CostStore::Sqlite(pool))
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, CostStore::Disabled)
    }

    pub async fn close(&self) {
        match self {
            CostStore::Postgres(pool) => pool.close().await,
            CostStore::Sqlite(pool) => pool.close().await,
            CostStore::Disabled => {}
        }
    }

    /// Append one row. Errors are logged and swallowed.
    pub async fn insert(&self, row: &NewCostRow) {
        let ts = Utc::now();
        let result = match self {
            CostStore::Postgres(pool) => sqlx::query(INSERT_PG)
                .bind(ts)
                .bind(&row.provider)
                .bind(&row.model)
                .bind(row.input_tokens as i64)
                .bind(row.output_tokens as i64)
                .bind(row.latency_ms as i64)
                .bind(&row.context.heinzel_id)
                .bind(&row.context.session_id)
                .bind(&row.context.task_id)
                .bind(&row.status)
                .bind(&row.error_message)
                .execute(pool)
                .await
                .map(|_| ()),
            CostStore::Sqlite(pool) => sqlx::query(INSERT_SQLITE)
                .bind(ts)
                .bind(&row.provider)
                .bind(&row.model)
                .bind(row.input_tokens as i64)
                .bind(row.output_tokens as i64)
                .bind(row.latency_ms as i64)
                .bind(&row.context.heinzel_id)
                .bind(&row.context.session_id)
                .bind(&row.context.task_id)
                .bind(&row.status)
                .bind(&row.error_message)
                .execute(pool)
                .await
                .map(|_| ()),
            CostStore::Disabled => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "cost store: insert failed (non-critical)");
        }
    }

    /// Filtered rows, newest first. Limit is capped at 1000.
    pub async fn query(&self, filter: &CostFilter) -> Vec<CostRow> {
        let limit = effective_limit(filter.limit);
        let result = match self {
            CostStore::Postgres(pool) => {
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_COLUMNS);
                push_filters(&mut qb, filter);
                qb.push(" ORDER BY ts DESC LIMIT ").push_bind(limit);
                qb.build_query_as::<CostRow>().fetch_all(pool).await
            }
            CostStore::Sqlite(pool) => {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
                push_filters(&mut qb, filter);
                qb.push(" ORDER BY ts DESC LIMIT ").push_bind(limit);
                qb.build_query_as::<CostRow>().fetch_all(pool).await
            }
            CostStore::Disabled => Ok(Vec::new()),
        };
        match result {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "cost store: query failed");
                Vec::new()
            }
        }
    }

    /// Aggregates over the filtered rows: request count, token sums,
    /// average latency, error count.
    pub async fn summary(&self, filter: &CostFilter) -> CostSummary {
        macro_rules! summary_from {
            ($row:expr) => {
                CostSummary {
                    total_requests: $row.try_get(0).unwrap_or(0),
                    total_input_tokens: $row.try_get(1).unwrap_or(0),
                    total_output_tokens: $row.try_get(2).unwrap_or(0),
                    avg_latency_ms: $row.try_get(3).unwrap_or(0.0),
                    error_count: $row.try_get(4).unwrap_or(0),
                }
            };
        }

        let result = match self {
            CostStore::Postgres(pool) => {
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SUMMARY_COLUMNS);
                push_filters(&mut qb, filter);
                qb.build().fetch_one(pool).await.map(|row| summary_from!(row))
            }
            CostStore::Sqlite(pool) => {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SUMMARY_COLUMNS);
                push_filters(&mut qb, filter);
                qb.build().fetch_one(pool).await.map(|row| summary_from!(row))
            }
            CostStore::Disabled => Ok(CostSummary::default()),
        };
        match result {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(error = %e, "cost store: summary failed");
                CostSummary::default()
            }
        }
    }

    /// Retention: delete rows older than `cutoff`. Returns the number of
    /// deleted rows (0 on failure).
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> u64 {
        let result = match self {
            CostStore::Postgres(pool) => sqlx::query("DELETE FROM costs WHERE ts < $1")
                .bind(cutoff)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            CostStore::Sqlite(pool) => sqlx::query("DELETE FROM costs WHERE ts < ?")
                .bind(cutoff)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            CostStore::Disabled => Ok(0),
        };
        match result {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "cost store: retention delete failed");
                0
            }
        }
    }
}

fn effective_limit(limit: usize) -> i64 {
    let limit = if limit == 0 { 100 } else { limit };
    limit.min(1000) as i64
}

fn push_filters<'a, DB>(qb: &mut QueryBuilder<'a, DB>, filter: &'a CostFilter)
where
    DB: sqlx::Database,
    &'a str: sqlx::Encode<'a, DB> + sqlx::Type<DB>,
    DateTime<Utc>: sqlx::Encode<'a, DB> + sqlx::Type<DB>,
{
    let mut first = true;
    macro_rules! sep {
        () => {{
            let s = if first { " WHERE " } else { " AND " };
            first = false;
            s
        }};
    }
    macro_rules! push_eq {
        ($column:literal, $value:expr) => {
            if let Some(v) = $value {
                qb.push(sep!()).push(concat!($column, " = ")).push_bind(v.as_str());
            }
        };
    }
    push_eq!("session_id", &filter.session_id);
    push_eq!("heinzel_id", &filter.heinzel_id);
    push_eq!("provider", &filter.provider);
    push_eq!("model", &filter.model);
    push_eq!("status", &filter.status);
    if let Some(since) = filter.since {
        qb.push(sep!()).push("ts >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        qb.push(sep!()).push("ts <= ").push_bind(until);
    }
    let _ = first;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> CostStore {
        let url = format!("sqlite://{}/costs.db", dir.path().display());
        let store = CostStore::connect(&url).await;
        assert!(store.is_connected());
        store
    }

    fn row(
        input: u64,
        output: u64,
        latency: u64,
        status: &str,
        session: Option<&str>,
    ) -> NewCostRow {
        NewCostRow {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            input_tokens: input,
            output_tokens: output,
            latency_ms: latency,
            context: RequestContext {
                session_id: session.map(String::from),
                ..Default::default()
            },
            status: status.into(),
            error_message: (status == "error").then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn summary_aggregates_rows() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.insert(&row(100, 50, 200, "success", Some("s1"))).await;
        store.insert(&row(200, 80, 300, "success", Some("s1"))).await;
        store.insert(&row(0, 0, 50, "error", Some("s2"))).await;

        let summary = store.summary(&CostFilter::default()).await;
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_input_tokens, 300);
        assert_eq!(summary.total_output_tokens, 130);
        assert_eq!(summary.error_count, 1);
        let expected_avg = (200.0 + 300.0 + 50.0) / 3.0;
        assert!((summary.avg_latency_ms - expected_avg).abs() < 1e-6);
    }

    #[tokio::test]
    async fn query_filters_and_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.insert(&row(1, 1, 10, "success", Some("s1"))).await;
        store.insert(&row(2, 2, 20, "error", Some("s2"))).await;
        store.insert(&row(3, 3, 30, "success", Some("s1"))).await;

        let all = store.query(&CostFilter::default()).await;
        assert_eq!(all.len(), 3);
        // ties on ts are possible within a test, ids always ascend
        assert!(all.iter().any(|r| r.input_tokens == 3));

        let s1 = store
            .query(&CostFilter {
                session_id: Some("s1".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(s1.len(), 2);

        let errors = store
            .query(&CostFilter {
                status: Some("error".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_message.as_deref(), Some("boom"));

        let limited = store
            .query(&CostFilter {
                limit: 1,
                ..Default::default()
            })
            .await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn time_filters_bound_the_result() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.insert(&row(1, 1, 10, "success", None)).await;

        let future_only = store
            .query(&CostFilter {
                since: Some(Utc::now() + chrono::Duration::days(1)),
                ..Default::default()
            })
            .await;
        assert!(future_only.is_empty());

        let deleted = store.delete_older_than(Utc::now() + chrono::Duration::days(1)).await;
        assert_eq!(deleted, 1);
        assert!(store.query(&CostFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn disabled_store_is_inert() {
        let store = CostStore::Disabled;
        store.insert(&row(1, 1, 1, "success", None)).await;
        assert!(store.query(&CostFilter::default()).await.is_empty());
        assert_eq!(store.summary(&CostFilter::default()).await, CostSummary::default());
    }
}
