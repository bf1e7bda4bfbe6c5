//! Query statistics for Postgres, combining live `pg_stat_statements` counters with a durable history table.
//!
//! [Database::query_stats] merges both sources into one ranked list. [Monitor::capture_query_stats] copies the
//! live counters of every database in a reset domain into history and resets them once, under an advisory lock.

mod aggregate;
mod capture;
mod config;
mod database;
mod error;
mod history;
mod normalize;
mod source;
mod stat;

pub use aggregate::{Aggregator, TOP, merge};
pub use capture::{CaptureCoordinator, CaptureOutcome, DomainMember, ResetDomain};
pub use config::{CaptureMode, Config, DEFAULT_PATH, DatabaseConfig, Settings};
pub use database::{Database, Monitor};
pub use error::CaptureError;
pub use history::{HistoricalStore, HistoryFilter, HistorySchema, PgHistoricalStore};
pub use normalize::{explainable, normalize};
pub use source::{
    AdvisoryLock, Availability, Capabilities, DomainLock, PgStatStatements, Probe, Readability, StatsFilter, StatsSource, Support,
};
pub use stat::{AggregatedStat, HashSample, HistoricalRow, QueryStatsOptions, RawStatRecord, Sort};
