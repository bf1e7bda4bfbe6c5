use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One statement row, either read live from `pg_stat_statements` or summed over a historical window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawStatRecord {
    pub query: String,
    /// `queryid` when the server and the history table both support it.
    pub query_hash: Option<i64>,
    pub user: Option<String>,
    pub total_time_ms: f64,
    pub calls: i64,
    /// Candidate text for `EXPLAIN`, taken from history only: the last text of the window in sort order. Live rows
    /// leave it `None`, since their text is the normalized template with `$n` placeholders.
    pub explainable_query: Option<String>,
    /// `None` for live rows.
    pub captured_at: Option<SystemTime>,
}

impl RawStatRecord {
    pub fn total_minutes(&self) -> f64 {
        self.total_time_ms / 60_000.0
    }
}

/// Persisted form of a [RawStatRecord], tagged with the logical database it was captured for.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoricalRow {
    pub database_id: String,
    pub query: String,
    pub query_hash: Option<i64>,
    pub user: Option<String>,
    pub total_time_ms: f64,
    pub calls: i64,
    pub captured_at: SystemTime,
}

impl HistoricalRow {
    pub fn new(database_id: &str, captured_at: SystemTime, record: RawStatRecord) -> Self {
        Self {
            database_id: database_id.to_string(),
            query: record.query,
            query_hash: record.query_hash,
            user: record.user,
            total_time_ms: record.total_time_ms,
            calls: record.calls,
            captured_at,
        }
    }
}

/// One ranked entry returned by `query_stats`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregatedStat {
    pub query: String,
    pub query_hash: Option<i64>,
    pub user: Option<String>,
    pub explainable_query: Option<String>,
    pub total_minutes: f64,
    pub calls: i64,
    pub average_time_ms: f64,
    /// Share of the total time of the returned result set, not of the whole server.
    pub total_percent: f64,
}

/// Ranking metric for `query_stats`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sort {
    #[default]
    TotalMinutes,
    AverageTime,
    Calls,
}

impl Sort {
    pub(crate) fn key(self, stat: &AggregatedStat) -> f64 {
        match self {
            Sort::TotalMinutes => stat.total_minutes,
            Sort::AverageTime => stat.average_time_ms,
            Sort::Calls => stat.calls as f64,
        }
    }
}

/// Options accepted by `query_stats`, with every default spelled out.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryStatsOptions {
    /// Include rows from the historical store.
    pub historical: bool,
    pub start_at: Option<SystemTime>,
    pub end_at: Option<SystemTime>,
    pub sort: Sort,
    pub min_average_time_ms: Option<f64>,
    pub min_calls: Option<i64>,
    pub query_hash: Option<i64>,
}

/// One point of the per-hash time series returned by `query_hash_stats`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HashSample {
    pub captured_at: SystemTime,
    pub total_minutes: f64,
    pub average_time_ms: f64,
    pub calls: i64,
}
