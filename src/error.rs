use thiserror::Error;

/// Why a capture cycle did not complete.
///
/// Only [CaptureError::DataLoss] means counters were lost: every other variant leaves the live counters
/// untouched so the next cycle picks them up.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture skipped: snapshot of {member} failed")]
    Skipped {
        member: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("capture skipped: reset domain {domain} is locked by another runner")]
    Locked { domain: String },
    #[error("capture skipped: could not acquire lock for reset domain {domain}")]
    Lock {
        domain: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("capture skipped: reset failed")]
    Reset(#[source] anyhow::Error),
    #[error("{rows} captured rows for reset domain {domain} were lost after reset")]
    DataLoss {
        domain: String,
        rows: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("unknown database {0}")]
    UnknownDatabase(String),
}

impl CaptureError {
    /// True for the post-reset persistence failure, which must be reported rather than retried.
    pub fn is_data_loss(&self) -> bool {
        matches!(self, CaptureError::DataLoss { .. })
    }
}
