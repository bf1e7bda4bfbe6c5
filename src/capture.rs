use crate::error::CaptureError;
use crate::history::HistoricalStore;
use crate::source::{DomainLock, StatsFilter, StatsSource};
use crate::stat::{HistoricalRow, RawStatRecord};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Logical databases whose statistics live in one physical set of counters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResetDomain {
    /// Id of the owning database, which performs the capture.
    pub id: String,
    /// Owner first.
    pub members: Vec<DomainMember>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainMember {
    pub id: String,
    /// `datname` whose counters belong to this member.
    pub database_name: Option<String>,
}

/// How a capture request ended when nothing went wrong.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CaptureOutcome {
    /// Counters were reset and `rows` rows were written across `members` members.
    Captured { rows: u64, members: usize },
    /// Every member snapshot was empty, so nothing was reset or written.
    Empty,
    /// The history table is unusable, so the counters were left alone.
    HistoryDisabled,
    /// This database is captured by the owner of its reset domain.
    Delegated { owner: String },
    /// Capture is turned off for this database.
    Disabled,
}

/// Runs one snapshot, reset, persist cycle for a reset domain.
///
/// Holding the domain lock for the whole cycle keeps concurrent runners from reading the same pre-reset counters
/// twice. A failed or timed out snapshot of any member aborts the cycle before the reset, leaving both the counters
/// and the history untouched. The lock attempt, each snapshot and the append each get `timeout`.
pub struct CaptureCoordinator<'a, S: ?Sized, H: ?Sized> {
    source: &'a S,
    history: &'a H,
    timeout: Duration,
    row_limit: i64,
}

impl<'a, S, H> CaptureCoordinator<'a, S, H>
where
    S: StatsSource + DomainLock + ?Sized,
    H: HistoricalStore + ?Sized,
{
    pub fn new(source: &'a S, history: &'a H, timeout: Duration, row_limit: i64) -> Self {
        Self { source, history, timeout, row_limit }
    }

    pub async fn run(&self, domain: &ResetDomain) -> Result<CaptureOutcome, CaptureError> {
        if !self.history.enabled().await {
            warn!(domain = %domain.id, "history table is unavailable, leaving query stats in place");
            return Ok(CaptureOutcome::HistoryDisabled);
        }
        let guard = match tokio::time::timeout(self.timeout, self.source.try_lock(&domain.id)).await {
            Ok(Ok(Some(guard))) => guard,
            Ok(Ok(None)) => return Err(CaptureError::Locked { domain: domain.id.clone() }),
            Ok(Err(source)) => return Err(CaptureError::Lock { domain: domain.id.clone(), source }),
            Err(_) => {
                let source = anyhow::anyhow!("lock attempt timed out after {:?}", self.timeout);
                return Err(CaptureError::Lock { domain: domain.id.clone(), source });
            }
        };
        let result = self.cycle(domain).await;
        if let Err(error) = self.source.unlock(guard).await {
            warn!(domain = %domain.id, %error, "failed to release reset domain lock");
        }
        result
    }

    async fn cycle(&self, domain: &ResetDomain) -> Result<CaptureOutcome, CaptureError> {
        let captured_at = SystemTime::now();

        debug!(domain = %domain.id, members = domain.members.len(), "snapshotting");
        let mut snapshots: Vec<(&DomainMember, Vec<RawStatRecord>)> = Vec::with_capacity(domain.members.len());
        for member in &domain.members {
            let filter = StatsFilter { database: member.database_name.as_deref(), query_hash: None, limit: self.row_limit };
            let mut rows = match tokio::time::timeout(self.timeout, self.source.current_stats(&filter)).await {
                Ok(Ok(rows)) => rows,
                Ok(Err(source)) => return Err(CaptureError::Skipped { member: member.id.clone(), source }),
                Err(_) => {
                    let source = anyhow::anyhow!("snapshot timed out after {:?}", self.timeout);
                    return Err(CaptureError::Skipped { member: member.id.clone(), source });
                }
            };
            // Zero-call entries carry nothing to persist
            rows.retain(|r| r.calls > 0);
            debug!(domain = %domain.id, member = %member.id, rows = rows.len(), "captured snapshot");
            snapshots.push((member, rows));
        }
        if snapshots.iter().all(|(_, rows)| rows.is_empty()) {
            debug!(domain = %domain.id, "no query stats to capture");
            return Ok(CaptureOutcome::Empty);
        }

        // Not cancelled once issued; the server-side statement timeout bounds it
        debug!(domain = %domain.id, "resetting");
        match self.source.reset().await {
            Ok(true) => {}
            Ok(false) => return Err(CaptureError::Reset(anyhow::anyhow!("pg_stat_statements became unavailable"))),
            Err(source) => return Err(CaptureError::Reset(source)),
        }

        debug!(domain = %domain.id, "persisting");
        let members = snapshots.iter().filter(|(_, rows)| !rows.is_empty()).count();
        let rows: Vec<HistoricalRow> = snapshots
            .into_iter()
            .flat_map(|(member, rows)| rows.into_iter().map(move |r| HistoricalRow::new(&member.id, captured_at, r)))
            .collect();
        let count = rows.len();
        let appended = match tokio::time::timeout(self.timeout, self.history.append(rows)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("append timed out after {:?}", self.timeout)),
        };
        match appended {
            Ok(rows) => {
                info!(domain = %domain.id, rows, members, "captured query stats");
                Ok(CaptureOutcome::Captured { rows, members })
            }
            Err(source) => {
                error!(domain = %domain.id, rows = count, error = %source, "query stats were reset but could not be saved");
                Err(CaptureError::DataLoss { domain: domain.id.clone(), rows: count, source })
            }
        }
    }
}
