use crate::context::{JobId, JobKind};
use crate::resources::NodeResources;
use crate::spec::UserJobSpec;
use chunk::{ChunkStripeList, ChunkTreeId};
use chunk_pools::OutputCookie;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tasks in one group share a minimum-resource envelope used for the
/// scheduler's coarse admission check.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    pub name: String,
    pub min_needed_resources: NodeResources,
}

/// Which pool a task draws its jobs from. Pools live in controller-owned
/// arenas and tasks refer to them by index, so no reference cycles form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHandle {
    Pool(usize),
    ShufflePartition { pool: usize, partition: usize },
}

/// Task wraps one chunk pool with job-template selection and scheduling
/// bookkeeping.
pub struct Task {
    pub id: String,
    pub kind: JobKind,
    /// Template for maniac cookies of a sorted pool; ordinary merges swap
    /// in an unordered merge here.
    pub maniac_kind: Option<JobKind>,
    pub pool: PoolHandle,
    pub group: usize,
    pub priority: usize,
    pub locality_timeout: Duration,
    pub chunk_list_count_per_job: usize,
    pub user_job: Option<UserJobSpec>,
    pub key_columns: Vec<String>,
    /// Partition tag stamped on shuffle outputs.
    pub partition_index: Option<usize>,

    /// Addresses of input replicas, gathered as stripes were added;
    /// registered as locality hints when the operation starts running.
    pub hint_addresses: Vec<String>,

    pub(crate) delayed_time: Option<Instant>,
    pub(crate) cached_pending_job_count: i64,
    pub(crate) cached_total_needed_resources: NodeResources,
    pub(crate) start_row_index: i64,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        kind: JobKind,
        pool: PoolHandle,
        group: usize,
        locality_timeout: Duration,
        chunk_list_count_per_job: usize,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            maniac_kind: None,
            pool,
            group,
            priority: 0,
            locality_timeout,
            chunk_list_count_per_job,
            user_job: None,
            key_columns: Vec::new(),
            partition_index: None,
            hint_addresses: Vec::new(),
            delayed_time: None,
            cached_pending_job_count: 0,
            cached_total_needed_resources: NodeResources::zero(),
            start_row_index: 0,
        }
    }

    pub fn delayed_time(&self) -> Option<Instant> {
        self.delayed_time
    }

    pub fn set_delayed_time(&mut self, value: Option<Instant>) {
        self.delayed_time = value;
    }
}

/// Joblet records one extracted, started job until its terminal callback.
#[derive(Debug, Clone)]
pub struct Joblet {
    pub job_id: JobId,
    pub task_index: usize,
    pub cookie: OutputCookie,
    pub stripe_list: Arc<ChunkStripeList>,
    pub chunk_lists: Vec<ChunkTreeId>,
    pub address: String,
    pub start_row_index: i64,
}
