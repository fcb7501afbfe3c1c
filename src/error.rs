use thiserror::Error;

/// Errors raised by the aggregation engine.
///
/// Only `RetriesExhausted` is expected to reach the ledger mutation path;
/// everything else is handled inside the engine up to the rebuild
/// escalation boundary.
#[derive(Debug, Error)]
pub enum CubeError {
    #[error("aggregate store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A delta drove an entry count below zero. Evidence of drift between
    /// the cube and the ledger; never clamped.
    #[error("entry count would go negative at {coordinate}")]
    NegativeCount { coordinate: String },

    #[error("ledger read failed during rebuild")]
    RebuildRead {
        #[source]
        source: sqlx::Error,
    },

    #[error("batch not applied after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<CubeError>,
    },

    #[error("malformed change event {entry_id}: {reason}")]
    InvalidEvent {
        entry_id: String,
        reason: &'static str,
    },

    #[error("invalid bulk change: {0}")]
    InvalidBulkChange(&'static str),
}

pub type CubeResult<T> = std::result::Result<T, CubeError>;

impl CubeError {
    /// Stable machine-readable code for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            CubeError::Store(_) => "CUBE/STORE",
            CubeError::NegativeCount { .. } => "CUBE/NEGATIVE_COUNT",
            CubeError::RebuildRead { .. } => "CUBE/REBUILD_READ",
            CubeError::RetriesExhausted { .. } => "CUBE/RETRIES_EXHAUSTED",
            CubeError::InvalidEvent { .. } => "CUBE/INVALID_EVENT",
            CubeError::InvalidBulkChange(_) => "CUBE/INVALID_BULK",
        }
    }

    /// Transient store failures are retried with backoff; anything else
    /// goes straight to the escalation path.
    pub fn is_transient(&self) -> bool {
        match self {
            CubeError::Store(err) => is_transient_sqlx(err),
            CubeError::RebuildRead { source } => is_transient_sqlx(source),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let msg = db.message();
            // SQLITE_BUSY / SQLITE_LOCKED surface through the busy_timeout.
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        sqlx::Error::Io(_) => true,
        _ => false,
    }
}

/// The aggregate_records CHECK constraint is where a negative count is caught.
pub(crate) fn is_count_check_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if db.message().contains("CHECK constraint failed")
                && db.message().contains("entry_count")
    )
}
