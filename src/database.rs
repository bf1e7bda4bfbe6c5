use crate::aggregate::Aggregator;
use crate::capture::{CaptureCoordinator, CaptureOutcome};
use crate::config::{CaptureMode, Config, DatabaseConfig, Settings};
use crate::error::CaptureError;
use crate::history::{HistoricalStore, PgHistoricalStore};
use crate::source::{PgStatStatements, Probe, Readability, StatsSource};
use crate::stat::{AggregatedStat, HashSample, QueryStatsOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Every wait on the pool or the server is bounded by `settings`.
fn pool(url: &str, settings: &Settings) -> anyhow::Result<deadpool_postgres::Pool> {
    let mut pg_config = tokio_postgres::Config::from_str(url)?;
    pg_config.connect_timeout(settings.connect_timeout());
    let statement_timeout = format!("-c statement_timeout={}", settings.statement_timeout().as_millis());
    let options = match pg_config.get_options() {
        Some(options) => format!("{options} {statement_timeout}"),
        None => statement_timeout,
    };
    pg_config.options(&options);
    let mgr_config = deadpool_postgres::ManagerConfig { recycling_method: deadpool_postgres::RecyclingMethod::Fast };
    let mgr = deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
    let pool = deadpool_postgres::Pool::builder(mgr)
        .runtime(deadpool_postgres::Runtime::Tokio1)
        .wait_timeout(Some(settings.connect_timeout()))
        .create_timeout(Some(settings.connect_timeout()))
        .recycle_timeout(Some(settings.connect_timeout()))
        .build()?;
    Ok(pool)
}

/// One registered logical database. Every operation takes this handle explicitly instead of a "current database".
pub struct Database {
    config: DatabaseConfig,
    settings: Arc<Settings>,
    source: PgStatStatements,
    history: Arc<PgHistoricalStore>,
}

impl Database {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn display_name(&self) -> &str {
        self.config.display_name()
    }

    pub fn reset_domain_id(&self) -> &str {
        self.config.reset_domain_id()
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn source(&self) -> &PgStatStatements {
        &self.source
    }

    pub fn history(&self) -> &PgHistoricalStore {
        &self.history
    }

    /// Ranked statistics from live counters and, when requested, the history table.
    pub async fn query_stats(&self, options: &QueryStatsOptions) -> anyhow::Result<Vec<AggregatedStat>> {
        let database_name = self.config.database_name();
        let aggregator = Aggregator {
            source: &self.source,
            history: &*self.history,
            database_id: self.id(),
            database_name: database_name.as_deref(),
            row_limit: self.settings.row_limit,
        };
        aggregator.query_stats(options).await
    }

    /// [Self::query_stats] narrowed to entries over both slow query thresholds.
    pub async fn slow_queries(&self, options: &QueryStatsOptions) -> anyhow::Result<Vec<AggregatedStat>> {
        let mut stats = self.query_stats(options).await?;
        stats.retain(|s| s.calls >= self.settings.slow_query_calls && s.average_time_ms >= self.settings.slow_query_ms);
        Ok(stats)
    }

    pub async fn probe(&self) -> Probe {
        self.source.probe().await
    }

    /// The extension can be installed on this server.
    pub async fn query_stats_available(&self) -> bool {
        self.probe().await.available
    }

    /// Installed and readable with the current credential.
    pub async fn query_stats_enabled(&self) -> bool {
        self.probe().await.usable()
    }

    pub async fn query_stats_extension_enabled(&self) -> bool {
        self.source.installed().await.unwrap_or(false)
    }

    pub async fn query_stats_readable(&self) -> bool {
        matches!(self.source.readable().await, Ok(Readability::Readable))
    }

    pub async fn historical_query_stats_enabled(&self) -> bool {
        self.config.capture_query_stats != CaptureMode::Disabled && self.history.enabled().await
    }

    pub async fn enable_query_stats(&self) -> anyhow::Result<()> {
        self.source.enable().await
    }

    pub async fn disable_query_stats(&self) -> anyhow::Result<()> {
        self.source.disable().await
    }

    /// Resets the live counters for the whole server without capturing them first.
    pub async fn reset_query_stats(&self) -> anyhow::Result<bool> {
        self.source.reset().await
    }

    /// The last 24 hours of captures for one native hash.
    pub async fn query_hash_stats(&self, query_hash: i64) -> anyhow::Result<Vec<HashSample>> {
        if !self.historical_query_stats_enabled().await {
            return Ok(Vec::new());
        }
        let since = SystemTime::now() - Duration::from_secs(24 * 60 * 60);
        self.history.hash_series(self.id(), query_hash, since).await
    }

    /// Deletes history older than the retention period.
    pub async fn clean_query_stats(&self) -> anyhow::Result<u64> {
        let before = SystemTime::now() - self.settings.history_retention();
        let deleted = self.history.prune(self.id(), before).await?;
        info!(database = self.id(), deleted, "cleaned query stats");
        Ok(deleted)
    }
}

/// Registry of every configured database sharing one history table.
pub struct Monitor {
    config: Config,
    settings: Arc<Settings>,
    databases: BTreeMap<String, Database>,
}

impl Monitor {
    /// Builds connection pools. No connection is opened until first use.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let settings = Arc::new(config.settings.clone());
        let stats_url = match (&settings.stats_database_url, config.primary_id()) {
            (Some(url), _) => url.clone(),
            (None, Some(primary)) => config.databases[primary].url.clone(),
            (None, None) => anyhow::bail!("at least one database must be configured"),
        };
        let history = Arc::new(PgHistoricalStore::new(pool(&stats_url, &settings)?, &settings.history_table, settings.query_text_limit));
        let mut databases = BTreeMap::new();
        for (id, database) in &config.databases {
            let source = PgStatStatements::new(pool(&database.url, &settings)?, settings.query_text_limit);
            let database = Database { config: database.clone(), settings: settings.clone(), source, history: history.clone() };
            databases.insert(id.clone(), database);
        }
        Ok(Self { config, settings, databases })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self, id: &str) -> Option<&Database> {
        self.databases.get(id)
    }

    pub fn primary(&self) -> Option<&Database> {
        self.database(self.config.primary_id()?)
    }

    pub fn databases(&self) -> impl Iterator<Item = &Database> {
        self.databases.values()
    }

    /// Captures and resets the counters of the reset domain owned by `id`.
    ///
    /// Members of another database's domain are captured by that owner, so they report
    /// [CaptureOutcome::Delegated] without touching anything.
    pub async fn capture_query_stats(&self, id: &str) -> Result<CaptureOutcome, CaptureError> {
        let database = self.database(id).ok_or_else(|| CaptureError::UnknownDatabase(id.to_string()))?;
        match &database.config.capture_query_stats {
            CaptureMode::Disabled => return Ok(CaptureOutcome::Disabled),
            CaptureMode::Member(owner) => return Ok(CaptureOutcome::Delegated { owner: owner.clone() }),
            CaptureMode::Own => {}
        }
        let domain = self.config.reset_domain(id).ok_or_else(|| CaptureError::UnknownDatabase(id.to_string()))?;
        let coordinator =
            CaptureCoordinator::new(&database.source, &*database.history, self.settings.capture_timeout(), self.settings.row_limit);
        coordinator.run(&domain).await
    }

    /// Runs [Self::capture_query_stats] for every database, one domain at a time.
    pub async fn capture_all(&self) -> Vec<(String, Result<CaptureOutcome, CaptureError>)> {
        let mut results = Vec::new();
        for id in self.databases.keys() {
            let result = self.capture_query_stats(id).await;
            // Data loss is logged at error level by the coordinator
            if let Some(error) = result.as_ref().err().filter(|e| !e.is_data_loss()) {
                warn!(database = %id, %error, "query stats capture skipped");
            }
            results.push((id.clone(), result));
        }
        results
    }

    /// Runs [Database::clean_query_stats] for every database.
    pub async fn clean_all(&self) -> anyhow::Result<u64> {
        let mut deleted = 0;
        for database in self.databases.values() {
            deleted += database.clean_query_stats().await?;
        }
        Ok(deleted)
    }
}
