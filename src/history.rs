use crate::source::Support;
use crate::stat::{HashSample, HistoricalRow, RawStatRecord};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::time::SystemTime;
use tokio::sync::OnceCell;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, info};

/// Columns every compatible history table has.
const REQUIRED_COLUMNS: [&str; 5] = ["database", "query", "total_time", "calls", "captured_at"];

/// Server-side approximation of [crate::normalize::normalize] used to group windows without a native hash.
const NORMALIZED_QUERY: &str = r"btrim(regexp_replace(regexp_replace(regexp_replace(query, '/\*.*?\*/', '', 'g'), '\s+', ' ', 'g'), '\?(, ?\?)+', '?', 'g'))";

/// Restricts a historical read.
#[derive(Clone, Copy, Debug)]
pub struct HistoryFilter<'a> {
    pub database_id: &'a str,
    pub start_at: Option<SystemTime>,
    pub end_at: Option<SystemTime>,
    pub query_hash: Option<i64>,
}

impl<'a> HistoryFilter<'a> {
    pub fn new(database_id: &'a str) -> Self {
        Self { database_id, start_at: None, end_at: None, query_hash: None }
    }
}

/// Shape of the history table, resolved from one `information_schema` pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HistorySchema {
    pub enabled: bool,
    pub query_hash: Support,
    pub user: Support,
}

impl HistorySchema {
    pub fn from_columns(columns: &[String]) -> Self {
        let has = |name: &str| columns.iter().any(|c| c == name);
        Self {
            enabled: REQUIRED_COLUMNS.into_iter().all(|c| has(c)),
            query_hash: Support::from_bool(has("query_hash")),
            user: Support::from_bool(has("user")),
        }
    }
}

/// Durable, append-only log of captured statement statistics.
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    /// Whether the backing table exists with the expected columns. Never fails.
    async fn enabled(&self) -> bool;

    /// Whether captured rows keep their native hash.
    async fn supports_query_hash(&self) -> bool;

    /// Whether captured rows keep the role name. When they don't, every historical row has `user = None`.
    async fn supports_user(&self) -> bool;

    /// Writes all rows in a single statement, so either every row is visible afterwards or none is.
    async fn append(&self, rows: Vec<HistoricalRow>) -> anyhow::Result<u64>;

    /// One summed row per `(hash or normalized text, user)` over the window. Empty when disabled.
    ///
    /// The representative text is the first in `'?' -> '!'` byte order so a window always reports the same text,
    /// and [RawStatRecord::explainable_query] carries the last one in that order.
    async fn query(&self, filter: &HistoryFilter<'_>) -> anyhow::Result<Vec<RawStatRecord>>;

    /// Per-capture samples for one native hash since `since`, oldest first.
    async fn hash_series(&self, database_id: &str, query_hash: i64, since: SystemTime) -> anyhow::Result<Vec<HashSample>>;

    /// Deletes rows captured before `before`, returning how many were removed.
    async fn prune(&self, database_id: &str, before: SystemTime) -> anyhow::Result<u64>;
}

/// [HistoricalStore] backed by a Postgres table, `pghero_query_stats` by default.
pub struct PgHistoricalStore {
    pool: Pool,
    table: String,
    text_limit: i32,
    schema: OnceCell<HistorySchema>,
}

impl PgHistoricalStore {
    pub fn new(pool: Pool, table: &str, text_limit: i32) -> Self {
        Self { pool, table: table.to_string(), text_limit, schema: OnceCell::new() }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn schema(&self) -> anyhow::Result<HistorySchema> {
        let schema = self
            .schema
            .get_or_try_init(|| async {
                let db = self.pool.get().await?;
                let sql = "
                    SELECT column_name::text FROM information_schema.columns
                    WHERE table_schema = current_schema() AND table_name = $1
                ";
                let columns: Vec<String> = db.query(sql, &[&self.table]).await?.iter().map(|r| r.get(0)).collect();
                let schema = HistorySchema::from_columns(&columns);
                debug!(table = %self.table, ?schema, "resolved history schema");
                Ok::<_, anyhow::Error>(schema)
            })
            .await?;
        Ok(*schema)
    }

    /// Key the server groups `query` under when the table has no `query_hash` column.
    pub async fn grouping_key(&self, query: &str) -> anyhow::Result<String> {
        let sql = format!("SELECT {NORMALIZED_QUERY} FROM (SELECT $1::text AS query) AS sample");
        let db = self.pool.get().await?;
        Ok(db.query_one(&sql, &[&query]).await?.get(0))
    }

    /// Creates the history table with every optional column.
    pub async fn create_table(&self) -> anyhow::Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id bigserial PRIMARY KEY,
                database text NOT NULL,
                query text NOT NULL,
                total_time float8 NOT NULL,
                calls bigint NOT NULL,
                captured_at timestamptz NOT NULL,
                query_hash bigint,
                "user" text
            );
            CREATE INDEX IF NOT EXISTS {table}_database_captured_at_idx ON {table} USING btree (database, captured_at);
            "#,
            table = self.table,
        );
        self.pool.get().await?.batch_execute(&sql).await?;
        info!(table = %self.table, "created history table");
        Ok(())
    }
}

#[async_trait]
impl HistoricalStore for PgHistoricalStore {
    async fn enabled(&self) -> bool {
        match self.schema().await {
            Ok(schema) => schema.enabled,
            Err(error) => {
                debug!(%error, "history schema introspection failed");
                false
            }
        }
    }

    async fn supports_query_hash(&self) -> bool {
        matches!(self.schema().await, Ok(HistorySchema { enabled: true, query_hash: Support::Supported, .. }))
    }

    async fn supports_user(&self) -> bool {
        matches!(self.schema().await, Ok(HistorySchema { enabled: true, user: Support::Supported, .. }))
    }

    async fn append(&self, rows: Vec<HistoricalRow>) -> anyhow::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let schema = self.schema().await?;
        if !schema.enabled {
            anyhow::bail!("history table {} is missing or incompatible", self.table);
        }
        let mut fields = vec!["database", "query", "total_time", "calls", "captured_at"];
        let mut types = vec![Type::TEXT, Type::TEXT, Type::FLOAT8, Type::INT8, Type::TIMESTAMPTZ];
        if schema.query_hash.is_supported() {
            fields.push("query_hash");
            types.push(Type::INT8);
        }
        if schema.user.is_supported() {
            fields.push(r#""user""#);
            types.push(Type::TEXT);
        }
        let sql = format!("COPY {} ({}) FROM STDIN BINARY", self.table, fields.join(", "));
        let db = self.pool.get().await?;
        let stmt = db.copy_in(&db.prepare_cached(&sql).await?).await?;
        let writer = BinaryCopyInWriter::new(stmt, &types);
        futures::pin_mut!(writer);
        for row in &rows {
            let mut values: Vec<&(dyn ToSql + Sync)> = vec![&row.database_id, &row.query, &row.total_time_ms, &row.calls, &row.captured_at];
            if schema.query_hash.is_supported() {
                values.push(&row.query_hash);
            }
            if schema.user.is_supported() {
                values.push(&row.user);
            }
            writer.as_mut().write(&values).await?;
        }
        Ok(writer.finish().await?)
    }

    async fn query(&self, filter: &HistoryFilter<'_>) -> anyhow::Result<Vec<RawStatRecord>> {
        let schema = self.schema().await?;
        if !schema.enabled {
            return Ok(Vec::new());
        }
        let (grouping, query_hash, hash_filter) = if schema.query_hash.is_supported() {
            ("query_hash", "query_hash", "query_hash IS NOT NULL AND ($4::bigint IS NULL OR query_hash = $4)")
        } else if filter.query_hash.is_some() {
            return Ok(Vec::new());
        } else {
            (NORMALIZED_QUERY, "NULL::bigint", "$4::bigint IS NULL")
        };
        let user = if schema.user.is_supported() { r#""user""# } else { "NULL::text" };
        let sql = format!(
            r#"
            WITH grouped AS (
                SELECT
                    {grouping} AS grouping_key,
                    {query_hash} AS query_hash,
                    {user} AS "user",
                    array_agg(LEFT(query, {text_limit}) ORDER BY REPLACE(LEFT(query, 1000), '?', '!') COLLATE "C" ASC) AS queries,
                    SUM(total_time)::float8 AS total_time,
                    SUM(calls)::bigint AS calls
                FROM {table}
                WHERE database = $1
                    AND ($2::timestamptz IS NULL OR captured_at >= $2)
                    AND ($3::timestamptz IS NULL OR captured_at <= $3)
                    AND {hash_filter}
                GROUP BY 1, 2, 3
            )
            SELECT query_hash, "user", queries[1], queries[array_length(queries, 1)], total_time, calls
            FROM grouped
            ORDER BY total_time DESC
            "#,
            text_limit = self.text_limit,
            table = self.table,
        );
        let db = self.pool.get().await?;
        let params: [&(dyn ToSql + Sync); 4] = [&filter.database_id, &filter.start_at, &filter.end_at, &filter.query_hash];
        let mut results = Vec::new();
        for row in db.query(&db.prepare_cached(&sql).await?, &params).await? {
            results.push(RawStatRecord {
                query_hash: row.get(0),
                user: row.get(1),
                query: row.get(2),
                explainable_query: row.get(3),
                total_time_ms: row.get(4),
                calls: row.get(5),
                captured_at: None,
            });
        }
        Ok(results)
    }

    async fn hash_series(&self, database_id: &str, query_hash: i64, since: SystemTime) -> anyhow::Result<Vec<HashSample>> {
        let schema = self.schema().await?;
        if !schema.enabled || !schema.query_hash.is_supported() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT captured_at, total_time, calls FROM {}
            WHERE database = $1 AND captured_at >= $2 AND query_hash = $3
            ORDER BY captured_at ASC",
            self.table
        );
        let db = self.pool.get().await?;
        let mut results = Vec::new();
        for row in db.query(&db.prepare_cached(&sql).await?, &[&database_id, &since, &query_hash]).await? {
            let total_time_ms: f64 = row.get(1);
            let calls: i64 = row.get(2);
            results.push(HashSample {
                captured_at: row.get(0),
                total_minutes: total_time_ms / 60_000.0,
                average_time_ms: if calls > 0 { total_time_ms / calls as f64 } else { 0.0 },
                calls,
            });
        }
        Ok(results)
    }

    async fn prune(&self, database_id: &str, before: SystemTime) -> anyhow::Result<u64> {
        if !self.schema().await?.enabled {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE database = $1 AND captured_at < $2", self.table);
        let db = self.pool.get().await?;
        Ok(db.execute(&db.prepare_cached(&sql).await?, &[&database_id, &before]).await?)
    }
}
