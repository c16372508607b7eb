use chunk::ChunkId;
use chunk_pools::{PoolError, SortedBuilderError};

/// Errors surfaced by an operation controller. Kinds, not call sites:
/// the attached context names the failing step.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// An impossible state was reached; fatal to the operation and to the
    /// controller hosting it.
    #[error("operation invariant violated: {0}")]
    InvariantViolation(String),

    /// Every replica of an input chunk is unreachable and the strategy
    /// says the operation cannot proceed.
    #[error("input chunk {chunk_id} is unavailable")]
    InputUnavailable { chunk_id: ChunkId },

    /// Too many transient job failures.
    #[error("failed job count exceeded the limit of {limit}")]
    FailedJobsLimitExceeded { limit: i64 },

    /// A user job exited with a non-retryable code.
    #[error("job failed fatally: {reason}")]
    FatalJobFailure { reason: String },

    /// No chunk-list reservations left; the task declines to schedule and
    /// waits for the pool to replenish.
    #[error("chunk list reservation exhausted")]
    ChunkListReservationExhausted,

    /// An RPC to the master failed during preparation.
    #[error("communication with master failed while {context}")]
    Communication {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    SortedBuilder(#[from] SortedBuilderError),

    #[error(transparent)]
    Persist(#[from] chunk_pools::persist::PersistError),
}

impl OperationError {
    /// Whether the operation may keep running after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperationError::InputUnavailable { .. }
                | OperationError::ChunkListReservationExhausted
        )
    }
}
