use thiserror::Error;

/// Crate-wide result type.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    // =========
    // Config / startup
    // =========
    #[error("configuration file IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse TOML config: {0}")]
    ConfigToml(#[from] toml::de::Error),

    #[error("missing configuration field: {0}")]
    MissingConfig(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Serialization
    // =========
    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    // =========
    // Database
    // =========
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    // =========
    // Metrics / Prometheus
    // =========
    #[error("prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    // =========
    // Table-reader domain errors (spec §7)
    // =========
    /// Query exhausted its per-query timeout budget. Feeds the page-size
    /// optimizer; does not count toward `successive_failure_count`.
    #[error("query timed out at page size {page_size}")]
    QueryTimeout { page_size: usize },

    /// Any other DB error encountered during a fetch. Increments the
    /// failure count and triggers backoff.
    #[error("transient database error: {0}")]
    TransientDb(String),

    /// SMS rejected a batch as too large for a single push, and the bounded
    /// backoff envelope (§4.5) was exhausted.
    #[error("SMS payload too large after retry budget exhausted")]
    SmsPayloadTooLarge,

    /// SMS push failed for a reason other than payload size. Fatal to the
    /// batch and to the worker.
    #[error("SMS push failed fatally: {0}")]
    SmsFatal(String),

    /// The replication slot this backfill depends on does not exist.
    /// Unrecoverable configuration error.
    #[error("replication slot not found: {0}")]
    SlotNotFound(String),

    /// An unflushed batch's `approximate_lsn` fell behind the current slot
    /// LSN; its provenance can no longer be trusted.
    #[error("stale batch detected: batch lsn {batch_lsn} < slot lsn {slot_lsn}")]
    StaleBatch { batch_lsn: i64, slot_lsn: i64 },

    /// The backfill was deactivated out from under the worker.
    #[error("backfill {0} is no longer active")]
    BackfillDeactivated(String),

    /// The consumer record this backfill targets has disappeared.
    #[error("consumer {0} is missing")]
    ConsumerMissing(String),

    /// The SMS process this worker monitors has died.
    #[error("SMS is down")]
    SmsDown,

    // =========
    // Task / runtime
    // =========
    #[error("failed to join task: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("shutdown requested")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for errors that should feed the page-size optimizer as a timeout
    /// sample rather than incrementing the successive-failure counter.
    pub fn is_query_timeout(&self) -> bool {
        matches!(self, AppError::QueryTimeout { .. })
    }

    /// True for the structural errors (§7) that terminate the worker rather
    /// than being recovered locally via backoff.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            AppError::SlotNotFound(_)
                | AppError::StaleBatch { .. }
                | AppError::BackfillDeactivated(_)
                | AppError::ConsumerMissing(_)
                | AppError::SmsDown
                | AppError::SmsFatal(_)
        )
    }
}

/// Distinguishable reasons the owner loop can stop for, surfaced to the
/// supervisor so it can decide whether to restart (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Finished,
    StaleBatch,
    BackfillDeactivated,
    ConsumerMissing,
    SmsDown,
    SmsFatal,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Finished => "finished",
            StopReason::StaleBatch => "stale_batch",
            StopReason::BackfillDeactivated => "backfill_deactivated",
            StopReason::ConsumerMissing => "consumer_missing",
            StopReason::SmsDown => "sms_down",
            StopReason::SmsFatal => "sms_fatal",
            StopReason::Error => "error",
        }
    }

    /// Whether a restart with a fresh cursor makes sense, vs. the backfill
    /// simply being done or deliberately stopped.
    pub fn is_restartable(&self) -> bool {
        matches!(self, StopReason::StaleBatch | StopReason::Error)
    }
}

impl From<&AppError> for StopReason {
    fn from(e: &AppError) -> Self {
        match e {
            AppError::StaleBatch { .. } => StopReason::StaleBatch,
            AppError::BackfillDeactivated(_) => StopReason::BackfillDeactivated,
            AppError::ConsumerMissing(_) => StopReason::ConsumerMissing,
            AppError::SmsDown => StopReason::SmsDown,
            AppError::SmsFatal(_) => StopReason::SmsFatal,
            _ => StopReason::Error,
        }
    }
}
