use crate::{AtomicChunkPool, SortedChunkPool, UnorderedChunkPool};
use chunk::{ChunkStripe, ChunkStripeList, StripeStatistics};
use std::sync::Arc;

/// Identifies one `add` transaction against a pool's input facet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct InputCookie(pub i32);

/// Identifies one `extract → completed/failed/aborted/lost` transaction
/// against a pool's output facet. A cookie survives replay: a failed or
/// lost job is re-extracted under the same cookie.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct OutputCookie(pub i32);

impl std::fmt::Display for InputCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for OutputCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire sentinel for "no cookie"; in-memory APIs use `Option` instead.
pub const NULL_COOKIE: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("stripe added to a finished pool")]
    AddAfterFinish,
    #[error("extract called before finish")]
    ExtractBeforeFinish,
    #[error("extract called while {0} stripes are suspended")]
    ExtractWithSuspendedStripes(usize),
    #[error("unknown {kind} cookie {cookie}")]
    UnknownCookie { kind: &'static str, cookie: i32 },
    #[error("cookie {cookie} is {actual}, expected {expected}")]
    CookieState {
        cookie: i32,
        actual: &'static str,
        expected: &'static str,
    },
    #[error("suspend and resume are not supported by the {0} pool")]
    SuspendUnsupported(&'static str),
    #[error("chunk {chunk_id} carries no partition statistics")]
    MissingPartitionStatistics { chunk_id: chunk::ChunkId },
    #[error(
        "chunk {chunk_id} carries {actual} partition entries, pool expects {expected}"
    )]
    PartitionCountMismatch {
        chunk_id: chunk::ChunkId,
        actual: usize,
        expected: usize,
    },
}

/// Input facet of a chunk pool.
pub trait PoolInput {
    /// Register an input stripe. Fails once the pool is finished.
    fn add(&mut self, stripe: Arc<ChunkStripe>) -> Result<InputCookie, PoolError>;

    /// Mark an input stripe transiently unavailable.
    fn suspend(&mut self, cookie: InputCookie) -> Result<(), PoolError>;

    /// Mark an input stripe available again. The replacement stripe
    /// supersedes the suspended one.
    fn resume(&mut self, cookie: InputCookie, stripe: Arc<ChunkStripe>) -> Result<(), PoolError>;

    /// No more inputs. Idempotent.
    fn finish(&mut self);
}

/// Output facet of a chunk pool.
pub trait PoolOutput {
    fn total_data_weight(&self) -> i64;
    fn running_data_weight(&self) -> i64;
    fn completed_data_weight(&self) -> i64;
    fn pending_data_weight(&self) -> i64;

    fn total_row_count(&self) -> i64;

    fn is_completed(&self) -> bool;

    fn total_job_count(&self) -> i64;
    fn pending_job_count(&self) -> i64;

    /// Approximate per-stripe statistics of the next job, used to estimate
    /// its memory footprint before extraction.
    fn approximate_stripe_statistics(&self) -> Vec<StripeStatistics>;

    /// Sum of locality scores of pending stripes preferring this address.
    fn locality(&self, address: &str) -> i64;

    /// Bind a pending job to an output cookie, preferring stripes local to
    /// `address`. Returns None when nothing is pending.
    fn extract(&mut self, address: Option<&str>) -> Result<Option<OutputCookie>, PoolError>;

    fn stripe_list(&self, cookie: OutputCookie) -> Result<Arc<ChunkStripeList>, PoolError>;

    fn completed(&mut self, cookie: OutputCookie) -> Result<(), PoolError>;
    fn failed(&mut self, cookie: OutputCookie) -> Result<(), PoolError>;
    fn aborted(&mut self, cookie: OutputCookie) -> Result<(), PoolError>;
    fn lost(&mut self, cookie: OutputCookie) -> Result<(), PoolError>;
}

/// ChunkPool is the closed set of pool shapes a task may own.
/// The shuffle pool is not a member: it multiplexes one input across
/// per-partition outputs and is held by its owner directly.
pub enum ChunkPool {
    Atomic(AtomicChunkPool),
    Unordered(UnorderedChunkPool),
    Sorted(SortedChunkPool),
}

impl ChunkPool {
    fn input(&mut self) -> &mut dyn PoolInput {
        match self {
            ChunkPool::Atomic(pool) => pool,
            ChunkPool::Unordered(pool) => pool,
            ChunkPool::Sorted(pool) => pool,
        }
    }

    fn output(&self) -> &dyn PoolOutput {
        match self {
            ChunkPool::Atomic(pool) => pool,
            ChunkPool::Unordered(pool) => pool,
            ChunkPool::Sorted(pool) => pool,
        }
    }

    fn output_mut(&mut self) -> &mut dyn PoolOutput {
        match self {
            ChunkPool::Atomic(pool) => pool,
            ChunkPool::Unordered(pool) => pool,
            ChunkPool::Sorted(pool) => pool,
        }
    }
}

impl PoolInput for ChunkPool {
    fn add(&mut self, stripe: Arc<ChunkStripe>) -> Result<InputCookie, PoolError> {
        self.input().add(stripe)
    }
    fn suspend(&mut self, cookie: InputCookie) -> Result<(), PoolError> {
        self.input().suspend(cookie)
    }
    fn resume(&mut self, cookie: InputCookie, stripe: Arc<ChunkStripe>) -> Result<(), PoolError> {
        self.input().resume(cookie, stripe)
    }
    fn finish(&mut self) {
        self.input().finish()
    }
}

impl PoolOutput for ChunkPool {
    fn total_data_weight(&self) -> i64 {
        self.output().total_data_weight()
    }
    fn running_data_weight(&self) -> i64 {
        self.output().running_data_weight()
    }
    fn completed_data_weight(&self) -> i64 {
        self.output().completed_data_weight()
    }
    fn pending_data_weight(&self) -> i64 {
        self.output().pending_data_weight()
    }
    fn total_row_count(&self) -> i64 {
        self.output().total_row_count()
    }
    fn is_completed(&self) -> bool {
        self.output().is_completed()
    }
    fn total_job_count(&self) -> i64 {
        self.output().total_job_count()
    }
    fn pending_job_count(&self) -> i64 {
        self.output().pending_job_count()
    }
    fn approximate_stripe_statistics(&self) -> Vec<StripeStatistics> {
        self.output().approximate_stripe_statistics()
    }
    fn locality(&self, address: &str) -> i64 {
        self.output().locality(address)
    }
    fn extract(&mut self, address: Option<&str>) -> Result<Option<OutputCookie>, PoolError> {
        self.output_mut().extract(address)
    }
    fn stripe_list(&self, cookie: OutputCookie) -> Result<Arc<ChunkStripeList>, PoolError> {
        self.output().stripe_list(cookie)
    }
    fn completed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.output_mut().completed(cookie)
    }
    fn failed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.output_mut().failed(cookie)
    }
    fn aborted(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.output_mut().aborted(cookie)
    }
    fn lost(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.output_mut().lost(cookie)
    }
}
