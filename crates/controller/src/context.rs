use crate::error::OperationError;
use crate::resources::NodeResources;
use crate::spec::{JobIoConfig, UserJobSpec};
use chunk::{ChunkSlice, ChunkStripeList, ChunkTreeId, InputChunk, NodeDirectory};
use futures::future::BoxFuture;
use std::sync::Arc;

/// JobId identifies one started job for the lifetime of the operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of work a job performs; selects the job template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobKind {
    Map,
    UnorderedMerge,
    OrderedMerge,
    SortedMerge,
    Erase,
    SortedReduce,
    JoinReduce,
    Partition,
}

/// Everything a node needs to start one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub input: Arc<ChunkStripeList>,
    /// One reserved chunk list per output table.
    pub output_chunk_lists: Vec<ChunkTreeId>,
    pub user_job: Option<UserJobSpec>,
    pub io_config: JobIoConfig,
    pub key_columns: Vec<String>,
    pub partition_tag: Option<usize>,
    pub start_row_index: i64,
    pub resources: NodeResources,
}

/// Descriptor of the node behind one heartbeat.
#[derive(Debug, Clone)]
pub struct ExecNodeDescriptor {
    pub address: String,
    pub resource_limits: NodeResources,
    pub resource_usage: NodeResources,
    /// Temporarily inflates available resources when the scheduler is
    /// preempting a lower-priority job on this node.
    pub resource_usage_discount: NodeResources,
}

impl ExecNodeDescriptor {
    pub fn has_enough_resources(&self, envelope: &NodeResources) -> bool {
        (self.resource_limits + self.resource_usage_discount)
            .dominates(&(self.resource_usage + *envelope))
    }
}

/// Per-heartbeat scheduling surface supplied by the node shard.
pub trait SchedulingContext {
    fn node_descriptor(&self) -> &ExecNodeDescriptor;
    fn running_jobs(&self) -> &[JobId];
    fn start_job(&mut self, spec: JobSpec) -> JobId;
    fn preempt_job(&mut self, job_id: JobId);
}

/// External collaborators of the controller core. Implementations talk
/// to masters and transaction coordinators; the core only sees futures.
pub trait Host: Send + Sync {
    fn node_directory(&self) -> Arc<NodeDirectory>;

    fn start_transactions(&self) -> BoxFuture<'static, Result<(), OperationError>>;

    fn lock_inputs(&self) -> BoxFuture<'static, Result<(), OperationError>>;

    /// Fetch the chunks of every input table, in table order.
    fn fetch_input_chunks(
        &self,
    ) -> BoxFuture<'static, Result<Vec<Arc<InputChunk>>, OperationError>>;

    /// Slice keyed chunks against the given key columns at roughly the
    /// target data weight per slice.
    fn fetch_chunk_slices(
        &self,
        chunks: Vec<Arc<InputChunk>>,
        key_columns: Vec<String>,
        slice_data_weight: i64,
    ) -> BoxFuture<'static, Result<Vec<ChunkSlice>, OperationError>>;

    /// Reserve a batch of output chunk lists.
    fn reserve_chunk_lists(
        &self,
        count: usize,
    ) -> BoxFuture<'static, Result<Vec<ChunkTreeId>, OperationError>>;

    /// Best-effort release of unused reservations; failures are logged
    /// by the implementation and never propagate.
    fn release_chunk_lists(&self, chunk_lists: Vec<ChunkTreeId>);

    /// Attach the ordered chunk trees to their output tables and commit.
    fn commit_outputs(
        &self,
        per_table: Vec<Vec<ChunkTreeId>>,
    ) -> BoxFuture<'static, Result<(), OperationError>>;
}
