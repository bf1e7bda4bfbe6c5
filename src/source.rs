use crate::stat::RawStatRecord;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use tokio::sync::OnceCell;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tracing::debug;

/// Whether an optional server feature can be relied on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Support {
    Supported,
    Unsupported,
}

impl Support {
    pub fn from_bool(value: bool) -> Self {
        if value { Support::Supported } else { Support::Unsupported }
    }

    pub fn is_supported(self) -> bool {
        self == Support::Supported
    }
}

/// Server features resolved once per connection pool from `server_version_num`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capabilities {
    pub server_version_num: i32,
    /// `pg_stat_statements.queryid` exists from 9.4.
    pub query_hash: Support,
    /// `total_time` was renamed to `total_exec_time` in 13.
    pub total_time_column: &'static str,
}

impl Capabilities {
    pub fn from_server_version(server_version_num: i32) -> Self {
        Self {
            server_version_num,
            query_hash: Support::from_bool(server_version_num >= 90400),
            total_time_column: if server_version_num >= 130000 { "total_exec_time" } else { "total_time" },
        }
    }
}

/// Whether live statistics can be read right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Availability {
    Available,
    Unavailable,
}

/// Outcome of reading `pg_stat_statements` once.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readability {
    Readable,
    /// The credential lacks access, which is distinct from the extension being absent.
    PermissionDenied,
    /// Missing, or installed without `shared_preload_libraries`.
    Unreadable,
}

/// The three capability probes, evaluated in diagnosis order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Probe {
    /// The extension can be created on this server.
    pub available: bool,
    /// The extension exists in the current database.
    pub installed: bool,
    /// The current credential can read the view.
    pub readable: bool,
}

impl Probe {
    pub fn usable(&self) -> bool {
        self.installed && self.readable
    }

    pub fn availability(&self) -> Availability {
        if self.usable() { Availability::Available } else { Availability::Unavailable }
    }
}

/// Restricts a live read.
#[derive(Clone, Copy, Debug)]
pub struct StatsFilter<'a> {
    /// `datname` to read; `None` means `current_database()`.
    pub database: Option<&'a str>,
    pub query_hash: Option<i64>,
    pub limit: i64,
}

/// Read side of the live, volatile statement counters.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Evaluates the capability probes. Never fails: an unreachable server probes as all `false`.
    async fn probe(&self) -> Probe;

    /// Current counters, highest total time first. Empty (not an error) when the extension is unusable.
    async fn current_stats(&self, filter: &StatsFilter<'_>) -> anyhow::Result<Vec<RawStatRecord>>;

    /// Resets the counters for the whole server. Returns `false` when the extension is unusable.
    async fn reset(&self) -> anyhow::Result<bool>;
}

/// Cross-process mutual exclusion for one reset domain.
#[async_trait]
pub trait DomainLock: Send + Sync {
    type Guard: Send;

    /// Non-blocking: `None` when another holder has the lock.
    async fn try_lock(&self, domain: &str) -> anyhow::Result<Option<Self::Guard>>;

    async fn unlock(&self, guard: Self::Guard) -> anyhow::Result<()>;
}

/// [StatsSource] backed by the `pg_stat_statements` extension.
pub struct PgStatStatements {
    pool: Pool,
    text_limit: i32,
    capabilities: OnceCell<Capabilities>,
}

impl PgStatStatements {
    pub fn new(pool: Pool, text_limit: i32) -> Self {
        Self { pool, text_limit, capabilities: OnceCell::new() }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn capabilities(&self) -> anyhow::Result<Capabilities> {
        let capabilities = self
            .capabilities
            .get_or_try_init(|| async {
                let db = self.pool.get().await?;
                let version: String = db.query_one("SHOW server_version_num", &[]).await?.get(0);
                let capabilities = Capabilities::from_server_version(version.trim().parse()?);
                debug!(?capabilities, "resolved server capabilities");
                Ok::<_, anyhow::Error>(capabilities)
            })
            .await?;
        Ok(*capabilities)
    }

    pub async fn available(&self) -> anyhow::Result<bool> {
        let db = self.pool.get().await?;
        let sql = "SELECT COUNT(*) FROM pg_available_extensions WHERE name = 'pg_stat_statements'";
        Ok(db.query_one(sql, &[]).await?.get::<_, i64>(0) > 0)
    }

    pub async fn installed(&self) -> anyhow::Result<bool> {
        let db = self.pool.get().await?;
        let sql = "SELECT COUNT(*) FROM pg_extension WHERE extname = 'pg_stat_statements'";
        Ok(db.query_one(sql, &[]).await?.get::<_, i64>(0) > 0)
    }

    pub async fn readable(&self) -> anyhow::Result<Readability> {
        let db = self.pool.get().await?;
        match db.query("SELECT 1 FROM pg_stat_statements LIMIT 1", &[]).await {
            Ok(_) => Ok(Readability::Readable),
            Err(e) if e.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) => Ok(Readability::PermissionDenied),
            Err(e) if e.as_db_error().is_some() => Ok(Readability::Unreadable),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [Probe::usable], but connection failures are returned instead of reading as "unusable".
    pub async fn usable(&self) -> anyhow::Result<bool> {
        Ok(self.installed().await? && self.readable().await? == Readability::Readable)
    }

    pub async fn enable(&self) -> anyhow::Result<()> {
        self.pool.get().await?.batch_execute("CREATE EXTENSION IF NOT EXISTS pg_stat_statements").await?;
        Ok(())
    }

    pub async fn disable(&self) -> anyhow::Result<()> {
        self.pool.get().await?.batch_execute("DROP EXTENSION IF EXISTS pg_stat_statements").await?;
        Ok(())
    }
}

#[async_trait]
impl StatsSource for PgStatStatements {
    async fn probe(&self) -> Probe {
        let available = self.available().await.unwrap_or_else(|error| {
            debug!(%error, "pg_stat_statements availability probe failed");
            false
        });
        let installed = self.installed().await.unwrap_or_else(|error| {
            debug!(%error, "pg_stat_statements installation probe failed");
            false
        });
        let readable = match self.readable().await {
            Ok(Readability::Readable) => true,
            Ok(Readability::PermissionDenied) => {
                debug!("pg_stat_statements is not readable with the current credential");
                false
            }
            Ok(Readability::Unreadable) => false,
            Err(error) => {
                debug!(%error, "pg_stat_statements read probe failed");
                false
            }
        };
        Probe { available, installed, readable }
    }

    async fn current_stats(&self, filter: &StatsFilter<'_>) -> anyhow::Result<Vec<RawStatRecord>> {
        if !self.usable().await? {
            return Ok(Vec::new());
        }
        let capabilities = self.capabilities().await?;
        let (query_hash, hash_filter) = if capabilities.query_hash.is_supported() {
            ("queryid", "($3::bigint IS NULL OR queryid = $3)")
        } else if filter.query_hash.is_some() {
            return Ok(Vec::new());
        } else {
            ("NULL::bigint", "$3::bigint IS NULL")
        };
        let sql = format!(
            "SELECT
                LEFT(query, {text_limit}) AS query,
                {query_hash} AS query_hash,
                pg_roles.rolname::text AS user,
                {total_time}::float8 AS total_time,
                calls::bigint AS calls
            FROM pg_stat_statements
            INNER JOIN pg_database ON pg_database.oid = pg_stat_statements.dbid
            INNER JOIN pg_roles ON pg_roles.oid = pg_stat_statements.userid
            WHERE pg_database.datname = COALESCE($1::text, current_database())
                AND calls > 0
                AND {hash_filter}
            ORDER BY 4 DESC
            LIMIT $2",
            text_limit = self.text_limit,
            total_time = capabilities.total_time_column,
        );
        let db = self.pool.get().await?;
        let params: [&(dyn ToSql + Sync); 3] = [&filter.database, &filter.limit, &filter.query_hash];
        let mut results = Vec::new();
        for row in db.query(&db.prepare_cached(&sql).await?, &params).await? {
            let query: Option<String> = row.get(0);
            results.push(RawStatRecord {
                query: query.unwrap_or_default(),
                query_hash: row.get(1),
                user: row.get(2),
                total_time_ms: row.get(3),
                calls: row.get(4),
                explainable_query: None,
                captured_at: None,
            });
        }
        Ok(results)
    }

    async fn reset(&self) -> anyhow::Result<bool> {
        if !self.usable().await? {
            return Ok(false);
        }
        self.pool.get().await?.batch_execute("SELECT pg_stat_statements_reset()").await?;
        Ok(true)
    }
}

/// A session advisory lock held on a dedicated pooled connection.
///
/// Dropping the guard without [DomainLock::unlock] detaches the connection from the pool so the session, and with
/// it the lock, ends instead of leaking into the next checkout.
pub struct AdvisoryLock {
    client: Option<Object>,
    key: String,
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            drop(Object::take(client));
        }
    }
}

fn lock_key(domain: &str) -> String {
    format!("pg_query_stats:{domain}")
}

#[async_trait]
impl DomainLock for PgStatStatements {
    type Guard = AdvisoryLock;

    async fn try_lock(&self, domain: &str) -> anyhow::Result<Option<AdvisoryLock>> {
        let client = self.pool.get().await?;
        let key = lock_key(domain);
        let locked: bool = client.query_one("SELECT pg_try_advisory_lock(hashtext($1))", &[&key]).await?.get(0);
        if !locked {
            return Ok(None);
        }
        Ok(Some(AdvisoryLock { client: Some(client), key }))
    }

    async fn unlock(&self, mut guard: AdvisoryLock) -> anyhow::Result<()> {
        let Some(client) = guard.client.take() else {
            return Ok(());
        };
        let unlocked = client.query_one("SELECT pg_advisory_unlock(hashtext($1))", &[&guard.key]).await;
        match unlocked {
            Ok(_) => Ok(()),
            Err(e) => {
                drop(Object::take(client));
                Err(e.into())
            }
        }
    }
}
