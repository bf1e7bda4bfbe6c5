use crate::capture::{DomainMember, ResetDomain};
use anyhow::{Context, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PATH: &str = "config/pghero.yml";

/// Process-wide options. Every key is optional in the config file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Minimum average time for `slow_queries`.
    pub slow_query_ms: f64,
    /// Minimum calls for `slow_queries`.
    pub slow_query_calls: i64,
    /// Per-step timeout during capture: lock attempt, each member snapshot, append.
    pub capture_timeout_secs: u64,
    /// Bounds opening a connection and waiting for a pooled one.
    pub connect_timeout_secs: u64,
    /// Server-side `statement_timeout` for every pooled connection, which also bounds the counter reset.
    pub statement_timeout_secs: u64,
    /// Ceiling on live rows read per database.
    pub row_limit: i64,
    /// Characters of query text kept.
    pub query_text_limit: i32,
    pub history_retention_days: u64,
    pub history_table: String,
    /// Where captured stats are written. Defaults to the primary database.
    pub stats_database_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            slow_query_ms: 20.0,
            slow_query_calls: 100,
            capture_timeout_secs: 30,
            connect_timeout_secs: 10,
            statement_timeout_secs: 60,
            row_limit: 1_000_000,
            query_text_limit: 10_000,
            history_retention_days: 14,
            history_table: "pghero_query_stats".to_string(),
            stats_database_url: None,
        }
    }
}

impl Settings {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_days * 24 * 60 * 60)
    }
}

/// The `capture_query_stats` key of a database: `true`, `false`, or the id of the database that captures for it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(from = "CaptureSetting")]
pub enum CaptureMode {
    #[default]
    Own,
    Disabled,
    Member(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaptureSetting {
    Flag(bool),
    Database(String),
}

impl From<CaptureSetting> for CaptureMode {
    fn from(setting: CaptureSetting) -> Self {
        match setting {
            CaptureSetting::Flag(true) => CaptureMode::Own,
            CaptureSetting::Flag(false) => CaptureMode::Disabled,
            CaptureSetting::Database(id) => CaptureMode::Member(id),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Key in the `databases` map.
    #[serde(skip)]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// `datname` whose live stats belong to this database. Defaults to the database in `url`.
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub capture_query_stats: CaptureMode,
}

impl DatabaseConfig {
    pub fn new(id: &str, url: &str) -> Self {
        Self { id: id.to_string(), url: url.to_string(), display_name: None, database_name: None, capture_query_stats: CaptureMode::Own }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn database_name(&self) -> Option<String> {
        self.database_name.clone().or_else(|| {
            let config = tokio_postgres::Config::from_str(&self.url).ok()?;
            config.get_dbname().map(str::to_string)
        })
    }

    /// Id of the database owning this database's counters.
    pub fn reset_domain_id(&self) -> &str {
        match &self.capture_query_stats {
            CaptureMode::Member(owner) => owner,
            CaptureMode::Own | CaptureMode::Disabled => &self.id,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub databases: BTreeMap<String, DatabaseConfig>,
    #[serde(flatten)]
    pub settings: Settings,
}

impl Config {
    /// Loads `config/pghero.yml` (or `PGHERO_CONFIG_PATH`) for `PGHERO_ENV`, falling back to a single `primary`
    /// database from `PGHERO_DATABASE_URL` or `DATABASE_URL`.
    pub fn load() -> anyhow::Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
        }
        let path = std::env::var("PGHERO_CONFIG_PATH").unwrap_or(DEFAULT_PATH.to_string());
        let env = std::env::var("PGHERO_ENV").unwrap_or("development".to_string());
        let mut config = if Path::new(&path).exists() {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            Self::from_yaml(&text, &env).with_context(|| format!("parsing {path}"))?
        } else {
            let url = std::env::var("PGHERO_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .context("no config file and neither PGHERO_DATABASE_URL nor DATABASE_URL is set")?;
            Self::single(&url)
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn single(url: &str) -> Self {
        let mut databases = BTreeMap::new();
        databases.insert("primary".to_string(), DatabaseConfig::new("primary", url));
        Self { databases, settings: Settings::default() }
    }

    /// Parses the section for `env` from a file keyed by environment name.
    pub fn from_yaml(text: &str, env: &str) -> anyhow::Result<Self> {
        let mut envs: BTreeMap<String, Config> = serde_yaml::from_str(text)?;
        let mut config = envs.remove(env).with_context(|| format!("no {env} section"))?;
        for (id, database) in config.databases.iter_mut() {
            database.id = id.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides settings from `PGHERO_*` variables.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(value) = var("PGHERO_SLOW_QUERY_MS") {
            self.settings.slow_query_ms = value.parse().context("PGHERO_SLOW_QUERY_MS")?;
        }
        if let Some(value) = var("PGHERO_SLOW_QUERY_CALLS") {
            self.settings.slow_query_calls = value.parse().context("PGHERO_SLOW_QUERY_CALLS")?;
        }
        if let Some(value) = var("PGHERO_STATS_DATABASE_URL") {
            self.settings.stats_database_url = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.databases.is_empty() {
            bail!("at least one database must be configured");
        }
        let table = &self.settings.history_table;
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            bail!("history_table {table:?} must be a lowercase identifier");
        }
        let settings = &self.settings;
        if settings.capture_timeout_secs == 0 || settings.connect_timeout_secs == 0 || settings.statement_timeout_secs == 0 {
            bail!("capture_timeout_secs, connect_timeout_secs and statement_timeout_secs must be positive");
        }
        if settings.row_limit <= 0 || settings.query_text_limit <= 0 {
            bail!("row_limit and query_text_limit must be positive");
        }
        for (id, database) in &self.databases {
            tokio_postgres::Config::from_str(&database.url).with_context(|| format!("invalid url for database {id}"))?;
            if let CaptureMode::Member(owner) = &database.capture_query_stats {
                if owner == id {
                    bail!("database {id} cannot capture query stats through itself");
                }
                match self.databases.get(owner).map(|d| &d.capture_query_stats) {
                    Some(CaptureMode::Own) => {}
                    Some(_) => bail!("database {id} captures through {owner}, which does not capture its own query stats"),
                    None => bail!("database {id} captures through unknown database {owner}"),
                }
                if database.database_name().is_none() {
                    bail!("database {id} shares counters with {owner} and needs a database name");
                }
            }
        }
        Ok(())
    }

    /// `primary` when configured, otherwise the first id.
    pub fn primary_id(&self) -> Option<&str> {
        if self.databases.contains_key("primary") {
            return Some("primary");
        }
        self.databases.keys().next().map(String::as_str)
    }

    /// The domain owned by `owner`: the owner followed by every database that captures through it.
    pub fn reset_domain(&self, owner: &str) -> Option<ResetDomain> {
        let database = self.databases.get(owner)?;
        if database.reset_domain_id() != owner {
            return None;
        }
        let member = |d: &DatabaseConfig| DomainMember { id: d.id.clone(), database_name: d.database_name() };
        let mut members = vec![member(database)];
        for d in self.databases.values() {
            if d.capture_query_stats == CaptureMode::Member(owner.to_string()) {
                members.push(member(d));
            }
        }
        Some(ResetDomain { id: owner.to_string(), members })
    }
}
