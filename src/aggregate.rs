use crate::history::{HistoricalStore, HistoryFilter};
use crate::normalize::{explainable, normalize};
use crate::source::{StatsFilter, StatsSource};
use crate::stat::{AggregatedStat, QueryStatsOptions, RawStatRecord};
use ahash::AHashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::time::SystemTime;
use tracing::debug;

/// Size of the ranked result before `min_average_time_ms`/`min_calls` are applied.
pub const TOP: usize = 100;

/// Read path combining live and historical statistics for one logical database.
///
/// Side-effect free. Running it while a capture cycle resets the counters may miss or double-count up to one
/// capture interval of activity; that skew is accepted.
pub struct Aggregator<'a, S: ?Sized, H: ?Sized> {
    pub source: &'a S,
    pub history: &'a H,
    pub database_id: &'a str,
    /// `datname` for live reads; `None` reads `current_database()`.
    pub database_name: Option<&'a str>,
    pub row_limit: i64,
}

impl<S: StatsSource + ?Sized, H: HistoricalStore + ?Sized> Aggregator<'_, S, H> {
    pub async fn query_stats(&self, options: &QueryStatsOptions) -> anyhow::Result<Vec<AggregatedStat>> {
        let with_history = options.historical && self.history.enabled().await;
        // A window that ended in the past has no live component
        let past_window = options.historical && options.end_at.is_some_and(|end| end < SystemTime::now());
        let mut live = if past_window {
            Vec::new()
        } else {
            let filter = StatsFilter { database: self.database_name, query_hash: options.query_hash, limit: self.row_limit };
            self.source.current_stats(&filter).await?
        };
        // Both sides must agree on the user to share a group
        if with_history && !self.history.supports_user().await {
            live.iter_mut().for_each(|r| r.user = None);
        }
        let historical = if with_history {
            let filter = HistoryFilter {
                database_id: self.database_id,
                start_at: options.start_at,
                end_at: options.end_at,
                query_hash: options.query_hash,
            };
            self.history.query(&filter).await?
        } else {
            Vec::new()
        };
        debug!(database = self.database_id, live = live.len(), historical = historical.len(), "merging query stats");
        Ok(merge(live, historical, options))
    }
}

/// Merges live and historical rows into the ranked, de-duplicated top [TOP].
///
/// Rows are grouped by `(query_hash, user)` where a hash exists, then regrouped by `(normalize(query), user)` to
/// catch the same statement reported under different or missing hashes. Percentages are relative to the merged
/// set, and the minimum filters only narrow the already truncated ranking.
pub fn merge(live: Vec<RawStatRecord>, historical: Vec<RawStatRecord>, options: &QueryStatsOptions) -> Vec<AggregatedStat> {
    let groups: Vec<Group> = live.into_iter().chain(historical).map(Group::from).collect();
    let groups = regroup(groups, |group, index| match group.query_hash {
        Some(hash) => HashKey::Hash(hash, group.user.clone()),
        None => HashKey::Unique(index),
    });
    let groups = regroup(groups, |group, _| (normalize(group.query.as_deref().unwrap_or_default()), group.user.clone()));

    let groups: Vec<Group> = groups.into_iter().filter(|g| g.calls > 0).collect();
    let all_minutes: f64 = groups.iter().map(|g| g.total_time_ms / 60_000.0).sum();
    let mut stats: Vec<AggregatedStat> = groups.into_iter().map(|g| g.finish(all_minutes)).collect();

    let sort = options.sort;
    stats.sort_by(|a, b| sort.key(b).total_cmp(&sort.key(a)));
    stats.truncate(TOP);
    if let Some(min) = options.min_average_time_ms {
        stats.retain(|s| s.average_time_ms >= min);
    }
    if let Some(min) = options.min_calls {
        stats.retain(|s| s.calls >= min);
    }
    stats
}

#[derive(Eq, Hash, PartialEq)]
enum HashKey {
    Hash(i64, Option<String>),
    /// Rows without a hash stay apart until the text pass.
    Unique(usize),
}

struct Group {
    query: Option<String>,
    query_hash: Option<i64>,
    user: Option<String>,
    total_time_ms: f64,
    calls: i64,
    candidates: Vec<String>,
}

impl From<RawStatRecord> for Group {
    fn from(record: RawStatRecord) -> Self {
        Self {
            query: Some(record.query).filter(|q| !q.is_empty()),
            query_hash: record.query_hash,
            user: record.user,
            total_time_ms: record.total_time_ms,
            calls: record.calls,
            candidates: record.explainable_query.into_iter().collect(),
        }
    }
}

impl Group {
    fn absorb(&mut self, other: Group) {
        if self.query.is_none() && other.query.is_some() {
            self.query = other.query;
            self.query_hash = other.query_hash;
        }
        if self.user.is_none() {
            self.user = other.user;
        }
        self.total_time_ms += other.total_time_ms;
        self.calls += other.calls;
        self.candidates.extend(other.candidates);
    }

    fn finish(mut self, all_minutes: f64) -> AggregatedStat {
        let total_minutes = self.total_time_ms / 60_000.0;
        self.candidates.sort();
        AggregatedStat {
            explainable_query: self.candidates.into_iter().find(|q| explainable(q)),
            query: self.query.unwrap_or_default(),
            query_hash: self.query_hash,
            user: self.user,
            total_minutes,
            calls: self.calls,
            average_time_ms: total_minutes * 60_000.0 / self.calls as f64,
            total_percent: if all_minutes > 0.0 { total_minutes * 100.0 / all_minutes } else { 0.0 },
        }
    }
}

/// Groups by `key`, keeping first-seen order so ties rank deterministically.
fn regroup<K: Eq + Hash>(groups: Vec<Group>, key: impl Fn(&Group, usize) -> K) -> Vec<Group> {
    let mut index: AHashMap<K, usize> = AHashMap::new();
    let mut merged: Vec<Group> = Vec::new();
    for (i, group) in groups.into_iter().enumerate() {
        match index.entry(key(&group, i)) {
            Entry::Occupied(entry) => merged[*entry.get()].absorb(group),
            Entry::Vacant(entry) => {
                entry.insert(merged.len());
                merged.push(group);
            }
        }
    }
    merged
}
