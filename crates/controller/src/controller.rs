use crate::context::{Host, JobId, JobKind, JobSpec, SchedulingContext};
use crate::error::OperationError;
use crate::executor::{CancellableContext, PeriodicYielder};
use crate::resources::{io_memory_size, NodeResources, FOOTPRINT_MEMORY_SIZE};
use crate::schedule::PendingTaskRegistry;
use crate::spec::{
    ControllerConfig, MergeMode, OperationKindSpec, OperationSpec, UnavailableChunkStrategy,
};
use crate::task::{Joblet, PoolHandle, Task, TaskGroup};
use chunk::{
    ChunkId, ChunkSlice, ChunkStripe, ChunkStripeList, ChunkTreeId, InputChunk,
    InputStreamDescriptor, InputStreamDirectory, NodeDirectory, StripeStatistics,
};
use chunk_pools::sorted::{SortedJobBuilder, SortedJobBuilderOptions, SortedJobStub};
use chunk_pools::{
    AtomicChunkPool, ChunkPool, InputCookie, OutputCookie, OutputOrderEntry, PoolInput,
    PoolOutput, ShuffleChunkPool, SortedChunkPool, UnorderedChunkPool,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Initializing,
    Preparing,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Routes suspend/resume to the pool holding one registered input.
#[derive(Debug, Clone, Copy)]
enum InputHandle {
    Pool(usize),
    Shuffle(usize),
}

struct RegisteredInput {
    handle: InputHandle,
    cookie: InputCookie,
    stripe: Arc<ChunkStripe>,
    suspended: bool,
}

struct CompletedJob {
    task_index: usize,
    cookie: OutputCookie,
    /// One chunk tree per output table.
    chunk_trees: Vec<ChunkTreeId>,
}

/// OperationController holds the tasks of one operation, routes pool
/// callbacks, dispatches jobs against node heartbeats and assembles the
/// committed output.
///
/// Every method that touches state must run on the operation's control
/// executor; `prepare` and `commit` await boundary futures and are driven
/// to completion before and after the heartbeat phase respectively.
pub struct OperationController {
    spec: OperationSpec,
    config: ControllerConfig,
    host: Arc<dyn Host>,
    node_directory: Arc<NodeDirectory>,
    cancellable: CancellableContext,

    state: OperationState,
    result: Option<String>,

    pools: Vec<ChunkPool>,
    shuffle_pools: Vec<ShuffleChunkPool>,
    /// The pool whose output order defines the commit order, when one
    /// exists (sorted operations).
    ordered_pool: Option<usize>,

    tasks: Vec<Task>,
    task_groups: Vec<TaskGroup>,
    pending_tasks: PendingTaskRegistry,

    registered_inputs: Vec<RegisteredInput>,
    inputs_by_chunk: HashMap<ChunkId, Vec<usize>>,

    joblets: IndexMap<u64, Joblet>,
    completed_jobs: IndexMap<u64, CompletedJob>,

    chunk_list_reserve: Vec<ChunkTreeId>,

    cached_pending_job_count: i64,
    cached_needed_resources: NodeResources,

    running_job_count: i64,
    completed_job_count: i64,
    failed_job_count: i64,
    aborted_job_count: i64,
}

impl OperationController {
    pub fn new(spec: OperationSpec, config: ControllerConfig, host: Arc<dyn Host>) -> Self {
        let node_directory = host.node_directory();
        Self {
            spec,
            config,
            host,
            node_directory,
            cancellable: CancellableContext::new(),
            state: OperationState::Initializing,
            result: None,
            pools: Vec::new(),
            shuffle_pools: Vec::new(),
            ordered_pool: None,
            tasks: Vec::new(),
            task_groups: Vec::new(),
            pending_tasks: PendingTaskRegistry::new(),
            registered_inputs: Vec::new(),
            inputs_by_chunk: HashMap::new(),
            joblets: IndexMap::new(),
            completed_jobs: IndexMap::new(),
            chunk_list_reserve: Vec::new(),
            cached_pending_job_count: 0,
            cached_needed_resources: NodeResources::zero(),
            running_job_count: 0,
            completed_job_count: 0,
            failed_job_count: 0,
            aborted_job_count: 0,
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn cancellable_context(&self) -> &CancellableContext {
        &self.cancellable
    }

    pub fn pending_job_count(&self) -> i64 {
        self.cached_pending_job_count
    }

    pub fn needed_resources(&self) -> NodeResources {
        self.cached_needed_resources
    }

    pub fn running_job_count(&self) -> i64 {
        self.running_job_count
    }

    pub fn completed_job_count(&self) -> i64 {
        self.completed_job_count
    }

    pub fn failed_job_count(&self) -> i64 {
        self.failed_job_count
    }

    pub fn aborted_job_count(&self) -> i64 {
        self.aborted_job_count
    }

    pub fn is_completed(&self) -> bool {
        self.pools.iter().all(|pool| pool.is_completed())
            && self.shuffle_pools.iter().all(|pool| pool.is_completed())
    }

    // Preparation pipeline.

    /// Serial pipeline of boundary operations. Runs to completion before
    /// the first heartbeat is served, so the single-writer discipline of
    /// the control executor is preserved.
    pub async fn prepare(&mut self) -> Result<(), OperationError> {
        assert_eq!(self.state, OperationState::Initializing);
        self.state = OperationState::Preparing;
        tracing::info!("preparing operation");

        let cancellable = self.cancellable.clone();
        cancellable.run(self.host.start_transactions()).await?;
        cancellable.run(self.host.lock_inputs()).await?;
        let chunks = cancellable.run(self.host.fetch_input_chunks()).await?;

        match self.spec.operation.clone() {
            OperationKindSpec::Map(_) => self.prepare_unordered(chunks, JobKind::Map).await?,
            OperationKindSpec::Merge(merge) => match merge.mode {
                MergeMode::Unordered => {
                    self.prepare_unordered(chunks, JobKind::UnorderedMerge).await?
                }
                MergeMode::Ordered => {
                    self.prepare_ordered(chunks, JobKind::OrderedMerge).await?
                }
                MergeMode::Sorted => {
                    self.prepare_sorted(
                        chunks,
                        JobKind::SortedMerge,
                        Some(JobKind::UnorderedMerge),
                        merge.merge_by.clone(),
                        merge.merge_by.len(),
                        0,
                        !merge.force_transform,
                        merge.combine_chunks,
                        merge.force_transform,
                    )
                    .await?
                }
            },
            OperationKindSpec::Erase => self.prepare_ordered(chunks, JobKind::Erase).await?,
            OperationKindSpec::Reduce(reduce) => {
                let key_columns = if reduce.sort_by.is_empty() {
                    reduce.reduce_by.clone()
                } else {
                    reduce.sort_by.clone()
                };
                self.prepare_sorted(
                    chunks,
                    JobKind::SortedReduce,
                    None,
                    key_columns,
                    reduce.reduce_by.len(),
                    reduce.join_by.len(),
                    false,
                    false,
                    false,
                )
                .await?
            }
            OperationKindSpec::JoinReduce(reduce) => {
                let key_columns = if reduce.sort_by.is_empty() {
                    reduce.reduce_by.clone()
                } else {
                    reduce.sort_by.clone()
                };
                self.prepare_sorted(
                    chunks,
                    JobKind::JoinReduce,
                    None,
                    key_columns,
                    reduce.reduce_by.len(),
                    reduce.join_by.len(),
                    false,
                    false,
                    false,
                )
                .await?
            }
            OperationKindSpec::Sort(sort) => self.prepare_sort(chunks, sort).await?,
        }

        self.replenish_chunk_lists().await?;

        tracing::info!(
            task_count = self.tasks.len(),
            pool_count = self.pools.len() + self.shuffle_pools.len(),
            "operation prepared",
        );
        Ok(())
    }

    /// Start serving heartbeats: register every task's pending and
    /// locality hints.
    pub fn run(&mut self) {
        assert_eq!(self.state, OperationState::Preparing);
        self.state = OperationState::Running;

        for task_index in 0..self.tasks.len() {
            self.add_task_locality_hints(task_index);
            self.add_task_pending_hint(task_index);
        }
        tracing::info!(
            pending_job_count = self.cached_pending_job_count,
            "operation is running",
        );
    }

    fn input_stream_directory(&self, teleportable: bool) -> InputStreamDirectory {
        let descriptors = (0..self.spec.input_table_paths.len())
            .map(|index| {
                let is_foreign = self.spec.foreign_input_table_indices.contains(&index);
                InputStreamDescriptor::new(teleportable && !is_foreign, !is_foreign, false)
            })
            .collect();
        InputStreamDirectory::new(descriptors)
    }

    async fn prepare_unordered(
        &mut self,
        chunks: Vec<Arc<InputChunk>>,
        kind: JobKind,
    ) -> Result<(), OperationError> {
        let total_data_weight: i64 = chunks.iter().map(|chunk| chunk.data_weight).sum();
        let job_count = self.spec.suggested_job_count(total_data_weight);

        let mut pool = UnorderedChunkPool::new(self.node_directory.clone(), job_count);
        let mut yielder = PeriodicYielder::new(self.config.prepare_yield_period);

        let mut hint_addresses = Vec::new();
        for chunk in chunks {
            yielder.try_yield().await;
            for slice in ChunkSlice::whole(chunk).slice_by_rows(self.spec.data_weight_per_job) {
                let stripe = Arc::new(ChunkStripe::from_slice(slice));
                self.collect_hint_addresses(&stripe, &mut hint_addresses);
                pool.add(stripe)?;
            }
        }
        pool.finish();

        let pool_index = self.pools.len();
        self.pools.push(ChunkPool::Unordered(pool));

        let group = self.push_task_group("main");
        let mut task = Task::new(
            format!("{kind:?}"),
            kind,
            PoolHandle::Pool(pool_index),
            group,
            self.spec.locality_timeout,
            self.spec.output_table_paths.len(),
        );
        task.user_job = self.spec.user_job().cloned();
        task.hint_addresses = hint_addresses;
        self.tasks.push(task);
        Ok(())
    }

    /// Ordered merge and erase: jobs consume input in table order, packed
    /// to the per-job weight; the sorted pool's plan-order semantics give
    /// the deterministic commit order. Input small enough for a single
    /// job degenerates to an atomic pool consuming everything.
    async fn prepare_ordered(
        &mut self,
        chunks: Vec<Arc<InputChunk>>,
        kind: JobKind,
    ) -> Result<(), OperationError> {
        let total_data_weight: i64 = chunks.iter().map(|chunk| chunk.data_weight).sum();
        if self.spec.suggested_job_count(total_data_weight) == 1 {
            return self.prepare_atomic(chunks, kind);
        }

        let mut pool = SortedChunkPool::new(self.node_directory.clone());
        let mut yielder = PeriodicYielder::new(self.config.prepare_yield_period);

        let mut hint_addresses = Vec::new();
        let mut staged: Vec<ChunkSlice> = Vec::new();
        let mut staged_weight = 0;

        let flush =
            |pool: &mut SortedChunkPool, staged: &mut Vec<ChunkSlice>, staged_weight: &mut i64| {
                if staged.is_empty() {
                    return;
                }
                let slices = std::mem::take(staged);
                let row_count = slices.iter().map(ChunkSlice::row_count).sum();
                let slice_count = slices.len();
                pool.push_job(SortedJobStub {
                    stripes: vec![Arc::new(ChunkStripe::new(slices))],
                    data_weight: *staged_weight,
                    row_count,
                    slice_count,
                    primary_slice_count: slice_count,
                    is_maniac: false,
                });
                *staged_weight = 0;
            };

        for chunk in chunks {
            yielder.try_yield().await;
            for slice in ChunkSlice::whole(chunk).slice_by_rows(self.spec.data_weight_per_job) {
                let stripe = ChunkStripe::from_slice(slice.clone());
                self.collect_hint_addresses(&stripe, &mut hint_addresses);
                staged_weight += slice.data_weight();
                staged.push(slice);
                if staged_weight >= self.spec.data_weight_per_job {
                    flush(&mut pool, &mut staged, &mut staged_weight);
                }
            }
        }
        flush(&mut pool, &mut staged, &mut staged_weight);
        pool.finish();

        let pool_index = self.pools.len();
        self.ordered_pool = Some(pool_index);
        self.pools.push(ChunkPool::Sorted(pool));

        let group = self.push_task_group("main");
        let mut task = Task::new(
            format!("{kind:?}"),
            kind,
            PoolHandle::Pool(pool_index),
            group,
            self.spec.locality_timeout,
            self.spec.output_table_paths.len(),
        );
        task.hint_addresses = hint_addresses;
        self.tasks.push(task);
        Ok(())
    }

    fn prepare_atomic(
        &mut self,
        chunks: Vec<Arc<InputChunk>>,
        kind: JobKind,
    ) -> Result<(), OperationError> {
        let mut pool = AtomicChunkPool::new(self.node_directory.clone());
        let pool_index = self.pools.len();

        let mut hint_addresses = Vec::new();
        for chunk in chunks {
            let stripe = Arc::new(ChunkStripe::from_slice(ChunkSlice::whole(chunk)));
            self.collect_hint_addresses(&stripe, &mut hint_addresses);
            let cookie = pool.add(stripe.clone())?;
            self.register_input(InputHandle::Pool(pool_index), cookie, stripe);
        }
        pool.finish();
        self.pools.push(ChunkPool::Atomic(pool));

        let group = self.push_task_group("main");
        let mut task = Task::new(
            format!("{kind:?}"),
            kind,
            PoolHandle::Pool(pool_index),
            group,
            self.spec.locality_timeout,
            self.spec.output_table_paths.len(),
        );
        task.hint_addresses = hint_addresses;
        self.tasks.push(task);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_sorted(
        &mut self,
        chunks: Vec<Arc<InputChunk>>,
        kind: JobKind,
        maniac_kind: Option<JobKind>,
        key_columns: Vec<String>,
        prefix_length: usize,
        foreign_prefix_length: usize,
        enable_teleport: bool,
        combine_chunks: bool,
        force_transform: bool,
    ) -> Result<(), OperationError> {
        let directory = self.input_stream_directory(enable_teleport);
        let cancellable = self.cancellable.clone();

        let slices = cancellable
            .run(self.host.fetch_chunk_slices(
                chunks,
                key_columns.clone(),
                self.config.chunk_slice_data_weight,
            ))
            .await?;

        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                prefix_length: prefix_length.max(1),
                foreign_prefix_length,
                max_data_weight_per_job: self.spec.data_weight_per_job,
                max_data_slices_per_job: self.spec.max_data_slices_per_job,
                enable_teleport,
                force_transform,
                combine_chunks,
                desired_chunk_size: self.spec.job_io.table_writer.desired_chunk_size,
            },
            directory.clone(),
        );

        let mut hint_addresses = Vec::new();
        let mut yielder = PeriodicYielder::new(self.config.prepare_yield_period);
        for slice in slices {
            yielder.try_yield().await;
            self.collect_hint_addresses(&ChunkStripe::from_slice(slice.clone()), &mut hint_addresses);
            if directory.descriptor(slice.input_stream_index()).is_foreign() {
                builder.add_foreign(slice)?;
            } else {
                builder.add_primary(slice)?;
            }
        }

        let entries = builder.build()?;
        let pool = SortedChunkPool::from_entries(self.node_directory.clone(), entries);

        let pool_index = self.pools.len();
        self.ordered_pool = Some(pool_index);
        self.pools.push(ChunkPool::Sorted(pool));

        let group = self.push_task_group("main");
        let mut task = Task::new(
            format!("{kind:?}"),
            kind,
            PoolHandle::Pool(pool_index),
            group,
            self.spec.locality_timeout,
            self.spec.output_table_paths.len(),
        );
        task.maniac_kind = maniac_kind;
        task.user_job = self.spec.user_job().cloned();
        task.key_columns = key_columns;
        task.hint_addresses = hint_addresses;
        self.tasks.push(task);
        Ok(())
    }

    async fn prepare_sort(
        &mut self,
        chunks: Vec<Arc<InputChunk>>,
        sort: crate::spec::SortSpec,
    ) -> Result<(), OperationError> {
        let mut pool =
            ShuffleChunkPool::new(sort.partition_count, sort.data_weight_per_shuffle_job);
        let mut yielder = PeriodicYielder::new(self.config.prepare_yield_period);

        for chunk in chunks {
            yielder.try_yield().await;
            let stripe = Arc::new(ChunkStripe::from_slice(ChunkSlice::whole(chunk.clone())));
            let cookie = pool.add(stripe.clone())?;
            self.register_input(InputHandle::Shuffle(0), cookie, stripe);
        }
        pool.finish();

        self.shuffle_pools.push(pool);

        let group = self.push_task_group("shuffle");
        for partition in 0..sort.partition_count {
            let mut task = Task::new(
                format!("Partition({partition})"),
                JobKind::Partition,
                PoolHandle::ShufflePartition { pool: 0, partition },
                group,
                self.spec.locality_timeout,
                1,
            );
            task.key_columns = sort.sort_by.clone();
            task.partition_index = Some(partition);
            self.tasks.push(task);
        }
        Ok(())
    }

    fn push_task_group(&mut self, name: &str) -> usize {
        self.task_groups.push(TaskGroup {
            name: name.to_string(),
            min_needed_resources: NodeResources {
                user_slots: 1,
                cpu: 1.0,
                memory: FOOTPRINT_MEMORY_SIZE,
                network: 0,
            },
        });
        self.task_groups.len() - 1
    }

    fn collect_hint_addresses(&self, stripe: &ChunkStripe, into: &mut Vec<String>) {
        for slice in &stripe.slices {
            for replica in &slice.chunk().replicas {
                if let Some(descriptor) = self.node_directory.get(replica.node_id) {
                    if !into.contains(&descriptor.address) {
                        into.push(descriptor.address.clone());
                    }
                }
            }
        }
    }

    fn register_input(
        &mut self,
        handle: InputHandle,
        cookie: InputCookie,
        stripe: Arc<ChunkStripe>,
    ) {
        let index = self.registered_inputs.len();
        for slice in &stripe.slices {
            self.inputs_by_chunk
                .entry(slice.chunk_id())
                .or_default()
                .push(index);
        }
        self.registered_inputs.push(RegisteredInput {
            handle,
            cookie,
            stripe,
            suspended: false,
        });
    }

    // Pool access helpers.

    fn pool_pending_job_count(&self, handle: PoolHandle) -> i64 {
        match handle {
            PoolHandle::Pool(index) => self.pools[index].pending_job_count(),
            PoolHandle::ShufflePartition { pool, partition } => {
                self.shuffle_pools[pool].output_ref(partition).pending_run_count() as i64
            }
        }
    }

    fn pool_locality(&self, handle: PoolHandle, address: &str) -> i64 {
        match handle {
            PoolHandle::Pool(index) => self.pools[index].locality(address),
            // Shuffle outputs do not track locality.
            PoolHandle::ShufflePartition { .. } => 0,
        }
    }

    fn pool_statistics(&self, handle: PoolHandle) -> Vec<StripeStatistics> {
        match handle {
            PoolHandle::Pool(index) => self.pools[index].approximate_stripe_statistics(),
            PoolHandle::ShufflePartition { pool, partition } => self.shuffle_pools[pool]
                .output_ref(partition)
                .approximate_stripe_statistics(),
        }
    }

    fn pool_extract(
        &mut self,
        handle: PoolHandle,
        address: &str,
    ) -> Result<Option<OutputCookie>, OperationError> {
        Ok(match handle {
            PoolHandle::Pool(index) => self.pools[index].extract(Some(address))?,
            PoolHandle::ShufflePartition { pool, partition } => {
                self.shuffle_pools[pool].output(partition).extract()
            }
        })
    }

    fn pool_stripe_list(
        &self,
        handle: PoolHandle,
        cookie: OutputCookie,
    ) -> Result<Arc<ChunkStripeList>, OperationError> {
        Ok(match handle {
            PoolHandle::Pool(index) => self.pools[index].stripe_list(cookie)?,
            PoolHandle::ShufflePartition { pool, partition } => {
                self.shuffle_pools[pool].partition_stripe_list(partition, cookie)?
            }
        })
    }

    fn pool_completed(
        &mut self,
        handle: PoolHandle,
        cookie: OutputCookie,
    ) -> Result<(), OperationError> {
        match handle {
            PoolHandle::Pool(index) => self.pools[index].completed(cookie)?,
            PoolHandle::ShufflePartition { pool, partition } => {
                self.shuffle_pools[pool].output(partition).completed(cookie)?
            }
        }
        Ok(())
    }

    fn pool_failed(
        &mut self,
        handle: PoolHandle,
        cookie: OutputCookie,
    ) -> Result<(), OperationError> {
        match handle {
            PoolHandle::Pool(index) => self.pools[index].failed(cookie)?,
            PoolHandle::ShufflePartition { pool, partition } => {
                self.shuffle_pools[pool].output(partition).failed(cookie)?
            }
        }
        Ok(())
    }

    fn pool_aborted(
        &mut self,
        handle: PoolHandle,
        cookie: OutputCookie,
    ) -> Result<(), OperationError> {
        match handle {
            PoolHandle::Pool(index) => self.pools[index].aborted(cookie)?,
            PoolHandle::ShufflePartition { pool, partition } => {
                self.shuffle_pools[pool].output(partition).aborted(cookie)?
            }
        }
        Ok(())
    }

    fn pool_lost(
        &mut self,
        handle: PoolHandle,
        cookie: OutputCookie,
    ) -> Result<(), OperationError> {
        match handle {
            PoolHandle::Pool(index) => self.pools[index].lost(cookie)?,
            PoolHandle::ShufflePartition { pool, partition } => {
                self.shuffle_pools[pool].output(partition).lost(cookie)?
            }
        }
        Ok(())
    }

    // Task bookkeeping.

    fn job_resources(&self, task_index: usize, statistics: &[StripeStatistics]) -> NodeResources {
        let task = &self.tasks[task_index];
        let input_streams = statistics.len().max(1) as i64;
        let output_streams = self.spec.output_table_paths.len().max(1) as i64;

        let mut memory =
            io_memory_size(&self.spec.job_io, input_streams, output_streams) + FOOTPRINT_MEMORY_SIZE;
        let mut cpu = 1.0;
        if let Some(user_job) = &task.user_job {
            cpu = user_job.cpu_limit;
            memory += user_job.memory_reserve();
        }

        NodeResources {
            user_slots: 1,
            cpu,
            memory,
            network: 0,
        }
    }

    fn task_min_needed_resources(&self, task_index: usize) -> NodeResources {
        let statistics = self.pool_statistics(self.tasks[task_index].pool);
        self.job_resources(task_index, &statistics)
    }

    /// Incrementally maintain the operation-wide pending count and
    /// resource demand from this task's deltas.
    fn update_task(&mut self, task_index: usize) {
        let new_count = self.pool_pending_job_count(self.tasks[task_index].pool);
        let old_count = self.tasks[task_index].cached_pending_job_count;
        self.cached_pending_job_count += new_count - old_count;
        self.tasks[task_index].cached_pending_job_count = new_count;

        let new_resources = if new_count == 0 {
            NodeResources::zero()
        } else {
            self.task_min_needed_resources(task_index).scale(new_count)
        };
        let old_resources = self.tasks[task_index].cached_total_needed_resources;
        self.cached_needed_resources += new_resources - old_resources;
        self.tasks[task_index].cached_total_needed_resources = new_resources;

        if new_count != old_count {
            tracing::debug!(
                task = %self.tasks[task_index].id,
                old_count,
                new_count,
                needed = %self.cached_needed_resources,
                "pending job count updated",
            );
        }
    }

    fn add_task_pending_hint(&mut self, task_index: usize) {
        if self.pool_pending_job_count(self.tasks[task_index].pool) > 0 {
            let priority = self.tasks[task_index].priority;
            if self.pending_tasks.add_pending_hint(priority, task_index) {
                tracing::debug!(task = %self.tasks[task_index].id, "task pending hint added");
            }
        }
        self.update_task(task_index);
    }

    fn add_task_locality_hints(&mut self, task_index: usize) {
        let priority = self.tasks[task_index].priority;
        let addresses = self.tasks[task_index].hint_addresses.clone();
        for address in addresses {
            if self
                .pending_tasks
                .add_locality_hint(priority, task_index, &address)
            {
                tracing::trace!(
                    task = %self.tasks[task_index].id,
                    address = %address,
                    "task locality hint added",
                );
            }
        }
        self.update_task(task_index);
    }

    // Heartbeat dispatch.

    /// Coarse admission envelope: the smallest group envelope among tasks
    /// with pending jobs. A node failing this check cannot run anything.
    fn min_needed_resources(&self) -> NodeResources {
        let mut min: Option<NodeResources> = None;
        for task in &self.tasks {
            if task.cached_pending_job_count == 0 {
                continue;
            }
            let envelope = self.task_groups[task.group].min_needed_resources;
            min = Some(match min {
                None => envelope,
                Some(current) => NodeResources {
                    user_slots: current.user_slots.min(envelope.user_slots),
                    cpu: current.cpu.min(envelope.cpu),
                    memory: current.memory.min(envelope.memory),
                    network: current.network.min(envelope.network),
                },
            });
        }
        min.unwrap_or_else(NodeResources::zero)
    }

    /// Serve one node heartbeat: try local tasks by best locality, then
    /// global tasks under the delayed-execution rule.
    pub fn schedule_job(
        &mut self,
        context: &mut dyn SchedulingContext,
        now: Instant,
        is_starving: bool,
    ) -> Option<JobId> {
        if self.state != OperationState::Running {
            tracing::trace!("operation is not running, scheduling request ignored");
            return None;
        }
        if self.cached_pending_job_count == 0 {
            tracing::trace!("no pending jobs left, scheduling request ignored");
            return None;
        }
        if !context
            .node_descriptor()
            .has_enough_resources(&self.min_needed_resources())
        {
            return None;
        }

        let job = self.do_schedule_job(context, now, is_starving);
        if job.is_some() {
            self.running_job_count += 1;
        }
        job
    }

    fn do_schedule_job(
        &mut self,
        context: &mut dyn SchedulingContext,
        now: Instant,
        is_starving: bool,
    ) -> Option<JobId> {
        let address = context.node_descriptor().address.clone();

        // First try to find a local task for this node.
        for priority in self.pending_tasks.priorities_high_to_low() {
            let candidates: Vec<usize> = match self
                .pending_tasks
                .layer(priority)
                .address_to_local_tasks
                .get(&address)
            {
                Some(tasks) => tasks.iter().copied().collect(),
                None => continue,
            };

            let mut best_locality = 0;
            let mut best_task: Option<usize> = None;

            for task_index in candidates {
                // Drop stale entries as we go.
                let locality = self.pool_locality(self.tasks[task_index].pool, &address);
                if locality <= 0 {
                    if let Some(tasks) = self
                        .pending_tasks
                        .layer_mut(priority)
                        .address_to_local_tasks
                        .get_mut(&address)
                    {
                        tasks.shift_remove(&task_index);
                    }
                    tracing::trace!(
                        task = %self.tasks[task_index].id,
                        address = %address,
                        "task locality hint removed",
                    );
                    continue;
                }
                if locality <= best_locality {
                    continue;
                }
                if !context
                    .node_descriptor()
                    .has_enough_resources(&self.task_min_needed_resources(task_index))
                {
                    continue;
                }
                if self.pool_pending_job_count(self.tasks[task_index].pool) == 0 {
                    self.update_task(task_index);
                    continue;
                }
                best_locality = locality;
                best_task = Some(task_index);
            }

            if let Some(task_index) = best_task {
                if let Some(job_id) = self.schedule_task_job(task_index, context) {
                    let delay = self.tasks[task_index]
                        .delayed_time
                        .map(|since| now.saturating_duration_since(since));
                    tracing::debug!(
                        task = %self.tasks[task_index].id,
                        address = %address,
                        priority,
                        locality = best_locality,
                        ?delay,
                        "scheduled a local job",
                    );
                    self.tasks[task_index].delayed_time = None;
                    self.update_task(task_index);
                    return Some(job_id);
                }
            }
        }

        // Next look for other (global) tasks.
        for priority in self.pending_tasks.priorities_high_to_low() {
            let candidates: Vec<usize> = self
                .pending_tasks
                .layer(priority)
                .global_tasks
                .iter()
                .copied()
                .collect();

            for task_index in candidates {
                if self.pool_pending_job_count(self.tasks[task_index].pool) == 0 {
                    tracing::debug!(
                        task = %self.tasks[task_index].id,
                        "task pending hint removed",
                    );
                    self.pending_tasks.remove_pending_hint(priority, task_index);
                    self.update_task(task_index);
                    continue;
                }
                if !context
                    .node_descriptor()
                    .has_enough_resources(&self.task_min_needed_resources(task_index))
                {
                    continue;
                }

                // Use delayed execution unless starving: freshly sighted
                // tasks wait out their locality timeout for a local node.
                let must_wait = match self.tasks[task_index].delayed_time {
                    Some(since) => since + self.tasks[task_index].locality_timeout > now,
                    None => {
                        self.tasks[task_index].delayed_time = Some(now);
                        true
                    }
                };
                if !is_starving && must_wait {
                    continue;
                }

                if let Some(job_id) = self.schedule_task_job(task_index, context) {
                    tracing::debug!(
                        task = %self.tasks[task_index].id,
                        address = %address,
                        priority,
                        "scheduled a non-local job",
                    );
                    self.update_task(task_index);
                    return Some(job_id);
                }
            }
        }

        None
    }

    fn schedule_task_job(
        &mut self,
        task_index: usize,
        context: &mut dyn SchedulingContext,
    ) -> Option<JobId> {
        let chunk_list_count = self.tasks[task_index].chunk_list_count_per_job;
        if self.chunk_list_reserve.len() < chunk_list_count {
            tracing::debug!(
                task = %self.tasks[task_index].id,
                reserve = self.chunk_list_reserve.len(),
                "chunk list reserve too low to schedule",
            );
            return None;
        }

        let address = context.node_descriptor().address.clone();
        let handle = self.tasks[task_index].pool;

        let cookie = match self.pool_extract(handle, &address) {
            Ok(Some(cookie)) => cookie,
            Ok(None) => return None,
            Err(error) => {
                self.fail_operation(error);
                return None;
            }
        };
        let stripe_list = match self.pool_stripe_list(handle, cookie) {
            Ok(list) => list,
            Err(error) => {
                self.fail_operation(error);
                return None;
            }
        };

        // Compute the actual demand of this job and re-check it against
        // the node. This is the last chance to give up.
        let resources = self.job_resources(task_index, &stripe_list.statistics());
        if !context.node_descriptor().has_enough_resources(&resources) {
            if let Err(error) = self.pool_aborted(handle, cookie) {
                self.fail_operation(error);
            }
            return None;
        }

        tracing::debug!(
            total_count = stripe_list.total_chunk_count,
            local_count = stripe_list.local_chunk_count,
            data_weight = stripe_list.total_data_weight,
            "job chunks extracted",
        );

        let split = self.chunk_list_reserve.len() - chunk_list_count;
        let chunk_lists = self.chunk_list_reserve.split_off(split);

        let is_maniac = match handle {
            PoolHandle::Pool(index) => match &self.pools[index] {
                ChunkPool::Sorted(pool) => pool.is_maniac(cookie).unwrap_or(false),
                _ => false,
            },
            PoolHandle::ShufflePartition { .. } => false,
        };
        let (kind, start_row_index, user_job, key_columns) = {
            let task = &mut self.tasks[task_index];
            let kind = match (is_maniac, task.maniac_kind) {
                (true, Some(maniac_kind)) => maniac_kind,
                _ => task.kind,
            };
            let start_row_index = task.start_row_index;
            task.start_row_index += stripe_list.total_row_count;
            (
                kind,
                start_row_index,
                task.user_job.clone(),
                task.key_columns.clone(),
            )
        };

        let job_spec = JobSpec {
            kind,
            input: stripe_list.clone(),
            output_chunk_lists: chunk_lists.clone(),
            user_job,
            io_config: self.spec.job_io.clone(),
            key_columns,
            partition_tag: stripe_list.partition_tag,
            start_row_index,
            resources,
        };

        let job_id = context.start_job(job_spec);

        self.joblets.insert(
            job_id.0,
            Joblet {
                job_id,
                task_index,
                cookie,
                stripe_list,
                chunk_lists,
                address,
                start_row_index,
            },
        );

        Some(job_id)
    }

    // Job lifecycle callbacks.

    pub fn on_job_completed(
        &mut self,
        job_id: JobId,
        output_chunk_trees: Vec<ChunkTreeId>,
    ) -> Result<(), OperationError> {
        let joblet = self.take_joblet(job_id)?;
        let handle = self.tasks[joblet.task_index].pool;

        self.pool_completed(handle, joblet.cookie)?;
        self.running_job_count -= 1;
        self.completed_job_count += 1;

        self.completed_jobs.insert(
            job_id.0,
            CompletedJob {
                task_index: joblet.task_index,
                cookie: joblet.cookie,
                chunk_trees: output_chunk_trees,
            },
        );

        self.update_task(joblet.task_index);
        if self.is_completed() {
            tracing::info!("all jobs completed");
        }
        Ok(())
    }

    /// A running job was interrupted; the portion it read counts as
    /// completed and the unread slices become a follow-up job ordered
    /// right after it.
    pub fn on_job_interrupted(
        &mut self,
        job_id: JobId,
        output_chunk_trees: Vec<ChunkTreeId>,
        unread_slices: Vec<ChunkSlice>,
    ) -> Result<(), OperationError> {
        let task_index = self
            .joblets
            .get(&job_id.0)
            .ok_or_else(|| {
                OperationError::InvariantViolation(format!("unknown job {job_id}"))
            })?
            .task_index;
        let cookie = self.joblets[&job_id.0].cookie;

        let follow_up = match self.tasks[task_index].pool {
            PoolHandle::Pool(index) => match &mut self.pools[index] {
                ChunkPool::Sorted(pool) => pool.add_unread_slices(cookie, unread_slices)?,
                _ => {
                    return Err(OperationError::InvariantViolation(
                        "interruption is only supported for sorted tasks".to_string(),
                    ))
                }
            },
            PoolHandle::ShufflePartition { .. } => {
                return Err(OperationError::InvariantViolation(
                    "interruption is only supported for sorted tasks".to_string(),
                ))
            }
        };
        tracing::debug!(%job_id, follow_up = %follow_up, "job interrupted");

        self.on_job_completed(job_id, output_chunk_trees)?;
        self.add_task_pending_hint(task_index);
        Ok(())
    }

    pub fn on_job_failed(
        &mut self,
        job_id: JobId,
        fatal: bool,
        reason: &str,
    ) -> Result<(), OperationError> {
        let joblet = self.take_joblet(job_id)?;
        let handle = self.tasks[joblet.task_index].pool;

        self.pool_failed(handle, joblet.cookie)?;
        self.running_job_count -= 1;
        self.failed_job_count += 1;
        self.host.release_chunk_lists(joblet.chunk_lists.clone());

        tracing::debug!(%job_id, fatal, reason, "job failed");

        self.add_task_locality_hints(joblet.task_index);
        self.add_task_pending_hint(joblet.task_index);

        if fatal {
            self.fail_operation(OperationError::FatalJobFailure {
                reason: reason.to_string(),
            });
        } else if self.failed_job_count >= self.spec.max_failed_job_count {
            self.fail_operation(OperationError::FailedJobsLimitExceeded {
                limit: self.spec.max_failed_job_count,
            });
        }
        Ok(())
    }

    pub fn on_job_aborted(&mut self, job_id: JobId) -> Result<(), OperationError> {
        let joblet = self.take_joblet(job_id)?;
        let handle = self.tasks[joblet.task_index].pool;

        self.pool_aborted(handle, joblet.cookie)?;
        self.running_job_count -= 1;
        self.aborted_job_count += 1;
        self.host.release_chunk_lists(joblet.chunk_lists.clone());

        tracing::debug!(%job_id, "job aborted");

        self.add_task_locality_hints(joblet.task_index);
        self.add_task_pending_hint(joblet.task_index);
        Ok(())
    }

    /// An intermediate chunk of a completed job was lost; replay the job
    /// under its original cookie.
    pub fn on_job_output_lost(&mut self, job_id: JobId) -> Result<(), OperationError> {
        let completed = self
            .completed_jobs
            .shift_remove(&job_id.0)
            .ok_or_else(|| {
                OperationError::InvariantViolation(format!("job {job_id} is not completed"))
            })?;
        let handle = self.tasks[completed.task_index].pool;

        self.pool_lost(handle, completed.cookie)?;
        self.completed_job_count -= 1;

        tracing::debug!(%job_id, "completed job output lost, replaying");

        self.add_task_pending_hint(completed.task_index);
        Ok(())
    }

    fn take_joblet(&mut self, job_id: JobId) -> Result<Joblet, OperationError> {
        self.joblets.shift_remove(&job_id.0).ok_or_else(|| {
            OperationError::InvariantViolation(format!("unknown job {job_id}"))
        })
    }

    // Input availability.

    pub fn on_input_chunk_unavailable(&mut self, chunk_id: ChunkId) -> Result<(), OperationError> {
        match self.spec.unavailable_chunk_strategy {
            UnavailableChunkStrategy::Fail => {
                self.fail_operation(OperationError::InputUnavailable { chunk_id });
                Ok(())
            }
            UnavailableChunkStrategy::Wait => self.suspend_chunk_inputs(chunk_id),
            UnavailableChunkStrategy::Skip => {
                // Drop the affected slices by resuming with empty stripes.
                self.suspend_chunk_inputs(chunk_id)?;
                self.resume_chunk_inputs(chunk_id, true)
            }
        }
    }

    pub fn on_input_chunk_available(&mut self, chunk_id: ChunkId) -> Result<(), OperationError> {
        self.resume_chunk_inputs(chunk_id, false)
    }

    fn suspend_chunk_inputs(&mut self, chunk_id: ChunkId) -> Result<(), OperationError> {
        let indices = self
            .inputs_by_chunk
            .get(&chunk_id)
            .cloned()
            .unwrap_or_default();
        for index in indices {
            if self.registered_inputs[index].suspended {
                continue;
            }
            let (handle, cookie) = (
                self.registered_inputs[index].handle,
                self.registered_inputs[index].cookie,
            );
            match handle {
                InputHandle::Pool(pool) => self.pools[pool].suspend(cookie)?,
                InputHandle::Shuffle(pool) => self.shuffle_pools[pool].suspend(cookie)?,
            }
            self.registered_inputs[index].suspended = true;
            tracing::debug!(%chunk_id, cookie = %cookie, "input stripe suspended");
            self.update_tasks_for_input(handle);
        }
        Ok(())
    }

    fn resume_chunk_inputs(&mut self, chunk_id: ChunkId, drop: bool) -> Result<(), OperationError> {
        let indices = self
            .inputs_by_chunk
            .get(&chunk_id)
            .cloned()
            .unwrap_or_default();
        for index in indices {
            if !self.registered_inputs[index].suspended {
                continue;
            }
            let (handle, cookie) = (
                self.registered_inputs[index].handle,
                self.registered_inputs[index].cookie,
            );
            let stripe = if drop {
                Arc::new(ChunkStripe::default())
            } else {
                self.registered_inputs[index].stripe.clone()
            };
            match handle {
                InputHandle::Pool(pool) => self.pools[pool].resume(cookie, stripe)?,
                InputHandle::Shuffle(pool) => self.shuffle_pools[pool].resume(cookie, stripe)?,
            }
            self.registered_inputs[index].suspended = false;
            tracing::debug!(%chunk_id, cookie = %cookie, dropped = drop, "input stripe resumed");
            self.update_tasks_for_input(handle);
        }
        Ok(())
    }

    /// Refresh the cached counts and pending hints of every task drawing
    /// from the pool behind a suspended or resumed input.
    fn update_tasks_for_input(&mut self, handle: InputHandle) {
        for task_index in 0..self.tasks.len() {
            let affected = match (handle, self.tasks[task_index].pool) {
                (InputHandle::Pool(input), PoolHandle::Pool(pool)) => input == pool,
                (InputHandle::Shuffle(input), PoolHandle::ShufflePartition { pool, .. }) => {
                    input == pool
                }
                _ => false,
            };
            if affected {
                self.add_task_pending_hint(task_index);
            }
        }
    }

    // Chunk list reservations.

    pub async fn replenish_chunk_lists(&mut self) -> Result<(), OperationError> {
        let batch = self
            .cancellable
            .run(self.host.reserve_chunk_lists(self.config.chunk_list_batch_size))
            .await?;
        self.chunk_list_reserve.extend(batch);
        Ok(())
    }

    pub fn chunk_list_reserve_len(&self) -> usize {
        self.chunk_list_reserve.len()
    }

    // Commit pipeline.

    /// Assemble the per-table output chunk trees in their user-visible
    /// order and hand them to the host for attachment and commit.
    pub async fn commit(&mut self) -> Result<(), OperationError> {
        if !self.is_completed() {
            return Err(OperationError::InvariantViolation(
                "commit requested before all jobs completed".to_string(),
            ));
        }

        let table_count = self.spec.output_table_paths.len();
        let mut per_table: Vec<Vec<ChunkTreeId>> = Vec::with_capacity(table_count);

        match self.ordered_pool {
            Some(pool_index) => {
                let ChunkPool::Sorted(pool) = &self.pools[pool_index] else {
                    return Err(OperationError::InvariantViolation(
                        "ordered pool is not sorted".to_string(),
                    ));
                };
                for table_index in 0..table_count {
                    let mut pairs: Vec<(OutputOrderEntry, ChunkTreeId)> = Vec::new();
                    for completed in self.completed_jobs.values() {
                        if let Some(&tree) = completed.chunk_trees.get(table_index) {
                            pairs.push((OutputOrderEntry::Cookie(completed.cookie), tree));
                        }
                    }
                    if table_index == 0 {
                        // Teleported chunks land in the first output table.
                        for chunk in pool.teleport_chunks() {
                            pairs.push((
                                OutputOrderEntry::TeleportChunk(chunk.id),
                                ChunkTreeId::new(*chunk.id.as_bytes()),
                            ));
                        }
                    }
                    per_table.push(pool.output_order().arrange_output_chunk_trees(pairs));
                }
            }
            None => {
                // No user-visible order to honor; commit in cookie order
                // per task for determinism.
                for table_index in 0..table_count {
                    let mut ordered: Vec<(usize, i32, ChunkTreeId)> = self
                        .completed_jobs
                        .values()
                        .filter_map(|completed| {
                            completed.chunk_trees.get(table_index).map(|&tree| {
                                (completed.task_index, completed.cookie.0, tree)
                            })
                        })
                        .collect();
                    ordered.sort();
                    per_table.push(ordered.into_iter().map(|(_, _, tree)| tree).collect());
                }
            }
        }

        let cancellable = self.cancellable.clone();
        cancellable.run(self.host.commit_outputs(per_table)).await?;

        self.state = OperationState::Completed;
        tracing::info!("operation committed");
        Ok(())
    }

    // Snapshot support for operation revival.

    /// Entity-kind discriminator of a controller snapshot record.
    const SNAPSHOT_TAG: u32 = 100;

    /// Checkpoint the state a revived controller cannot re-derive from
    /// its spec: pool states, per-task row cursors and registered
    /// inputs. Outstanding jobs must have been aborted back into their
    /// pools first; a scheduler restart loses them anyway.
    pub fn save_snapshot(&self, out: &mut Vec<u8>) {
        use chunk_pools::persist::{put_bool, put_i64, put_u32, put_usize, record};

        assert!(
            self.joblets.is_empty(),
            "running joblets must be aborted before checkpointing",
        );

        record(out, Self::SNAPSHOT_TAG, |out| {
            put_u32(out, self.pools.len() as u32);
            for pool in &self.pools {
                match pool {
                    ChunkPool::Atomic(pool) => {
                        put_u32(out, 0);
                        pool.save(out);
                    }
                    ChunkPool::Unordered(pool) => {
                        put_u32(out, 1);
                        pool.save(out);
                    }
                    ChunkPool::Sorted(pool) => {
                        put_u32(out, 2);
                        pool.save(out);
                    }
                }
            }
            put_u32(out, self.shuffle_pools.len() as u32);
            for pool in &self.shuffle_pools {
                pool.save(out);
            }
            put_u32(out, self.tasks.len() as u32);
            for task in &self.tasks {
                put_i64(out, task.start_row_index);
            }
            put_u32(out, self.registered_inputs.len() as u32);
            for input in &self.registered_inputs {
                match input.handle {
                    InputHandle::Pool(index) => {
                        put_u32(out, 0);
                        put_usize(out, index);
                    }
                    InputHandle::Shuffle(index) => {
                        put_u32(out, 1);
                        put_usize(out, index);
                    }
                }
                put_i64(out, input.cookie.0 as i64);
                chunk_pools::persist::put_stripe(out, &input.stripe);
                put_bool(out, input.suspended);
            }
        });
    }

    /// Restore a checkpoint into a freshly prepared controller. The spec
    /// rebuilds the task and pool shapes; this replaces their state.
    pub fn load_snapshot(&mut self, input: &mut &[u8]) -> Result<(), OperationError> {
        use chunk_pools::persist::{
            expect_record, get_bool, get_i64, get_stripe, get_u32, get_usize, parse_payload,
            PersistError,
        };

        let node_directory = self.node_directory.clone();
        let payload = expect_record(input, Self::SNAPSHOT_TAG)?;
        let (pools, shuffle_pools, row_cursors, inputs) =
            parse_payload(payload, |input| {
                let pool_count = get_u32(input)?;
                let mut pools = Vec::with_capacity(pool_count as usize);
                for _ in 0..pool_count {
                    pools.push(match get_u32(input)? {
                        0 => ChunkPool::Atomic(AtomicChunkPool::load(
                            input,
                            node_directory.clone(),
                        )?),
                        1 => ChunkPool::Unordered(UnorderedChunkPool::load(
                            input,
                            node_directory.clone(),
                        )?),
                        2 => ChunkPool::Sorted(SortedChunkPool::load(
                            input,
                            node_directory.clone(),
                        )?),
                        other => return Err(PersistError::UnknownDiscriminator(other)),
                    });
                }
                let shuffle_count = get_u32(input)?;
                let mut shuffle_pools = Vec::with_capacity(shuffle_count as usize);
                for _ in 0..shuffle_count {
                    shuffle_pools.push(ShuffleChunkPool::load(input)?);
                }
                let task_count = get_u32(input)?;
                let mut row_cursors = Vec::with_capacity(task_count as usize);
                for _ in 0..task_count {
                    row_cursors.push(get_i64(input)?);
                }
                let input_count = get_u32(input)?;
                let mut inputs = Vec::with_capacity(input_count as usize);
                for _ in 0..input_count {
                    let handle = match get_u32(input)? {
                        0 => InputHandle::Pool(get_usize(input)?),
                        1 => InputHandle::Shuffle(get_usize(input)?),
                        other => return Err(PersistError::UnknownDiscriminator(other)),
                    };
                    let cookie = InputCookie(get_i64(input)? as i32);
                    let stripe = Arc::new(get_stripe(input)?);
                    let suspended = get_bool(input)?;
                    inputs.push((handle, cookie, stripe, suspended));
                }
                Ok((pools, shuffle_pools, row_cursors, inputs))
            })?;

        if pools.len() != self.pools.len()
            || shuffle_pools.len() != self.shuffle_pools.len()
            || row_cursors.len() != self.tasks.len()
        {
            return Err(OperationError::InvariantViolation(
                "snapshot does not match the prepared operation shape".to_string(),
            ));
        }

        self.pools = pools;
        self.shuffle_pools = shuffle_pools;
        for (task, cursor) in self.tasks.iter_mut().zip(row_cursors) {
            task.start_row_index = cursor;
        }

        self.registered_inputs.clear();
        self.inputs_by_chunk.clear();
        for (handle, cookie, stripe, suspended) in inputs {
            self.register_input(handle, cookie, stripe);
            self.registered_inputs.last_mut().unwrap().suspended = suspended;
        }

        for task_index in 0..self.tasks.len() {
            self.add_task_locality_hints(task_index);
            self.add_task_pending_hint(task_index);
        }
        tracing::info!("controller state restored from snapshot");
        Ok(())
    }

    pub fn abort(&mut self) {
        tracing::info!("operation aborted");
        self.cancellable.cancel();
        self.state = OperationState::Aborted;
        self.host
            .release_chunk_lists(std::mem::take(&mut self.chunk_list_reserve));
    }

    fn fail_operation(&mut self, error: OperationError) {
        tracing::warn!(%error, "operation failed");
        self.result = Some(error.to_string());
        self.cancellable.cancel();
        self.state = OperationState::Failed;
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.result.as_deref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::{MapSpec, MergeSpec, SortSpec, UserJobSpec};
    use crate::ExecNodeDescriptor;
    use chunk::{ErasureCodec, PartitionStatistics};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct TestHost {
        directory: Arc<NodeDirectory>,
        chunks: Vec<Arc<InputChunk>>,
        committed: Mutex<Option<Vec<Vec<ChunkTreeId>>>>,
        released: Mutex<Vec<ChunkTreeId>>,
        next_chunk_list: AtomicU64,
    }

    impl TestHost {
        fn new(chunks: Vec<Arc<InputChunk>>) -> Arc<Self> {
            Arc::new(Self {
                directory: Arc::new(NodeDirectory::default()),
                chunks,
                committed: Mutex::new(None),
                released: Mutex::new(Vec::new()),
                next_chunk_list: AtomicU64::new(1),
            })
        }
    }

    impl Host for TestHost {
        fn node_directory(&self) -> Arc<NodeDirectory> {
            self.directory.clone()
        }

        fn start_transactions(
            &self,
        ) -> futures::future::BoxFuture<'static, Result<(), OperationError>> {
            futures::future::ready(Ok(())).boxed()
        }

        fn lock_inputs(&self) -> futures::future::BoxFuture<'static, Result<(), OperationError>> {
            futures::future::ready(Ok(())).boxed()
        }

        fn fetch_input_chunks(
            &self,
        ) -> futures::future::BoxFuture<'static, Result<Vec<Arc<InputChunk>>, OperationError>>
        {
            futures::future::ready(Ok(self.chunks.clone())).boxed()
        }

        fn fetch_chunk_slices(
            &self,
            chunks: Vec<Arc<InputChunk>>,
            _key_columns: Vec<String>,
            _slice_data_weight: i64,
        ) -> futures::future::BoxFuture<'static, Result<Vec<ChunkSlice>, OperationError>>
        {
            let slices = chunks.into_iter().map(ChunkSlice::whole).collect();
            futures::future::ready(Ok(slices)).boxed()
        }

        fn reserve_chunk_lists(
            &self,
            count: usize,
        ) -> futures::future::BoxFuture<'static, Result<Vec<ChunkTreeId>, OperationError>>
        {
            let base = self.next_chunk_list.fetch_add(count as u64, Ordering::SeqCst);
            let lists = (0..count as u64)
                .map(|offset| ChunkTreeId::from_parts(1, base + offset))
                .collect();
            futures::future::ready(Ok(lists)).boxed()
        }

        fn release_chunk_lists(&self, chunk_lists: Vec<ChunkTreeId>) {
            self.released.lock().unwrap().extend(chunk_lists);
        }

        fn commit_outputs(
            &self,
            per_table: Vec<Vec<ChunkTreeId>>,
        ) -> futures::future::BoxFuture<'static, Result<(), OperationError>> {
            *self.committed.lock().unwrap() = Some(per_table);
            futures::future::ready(Ok(())).boxed()
        }
    }

    struct TestSchedulingContext {
        descriptor: ExecNodeDescriptor,
        running: Vec<JobId>,
        started: Vec<JobSpec>,
        next_job_id: u64,
    }

    impl TestSchedulingContext {
        fn new(address: &str) -> Self {
            Self {
                descriptor: ExecNodeDescriptor {
                    address: address.to_string(),
                    resource_limits: NodeResources {
                        user_slots: 100,
                        cpu: 100.0,
                        memory: 1 << 40,
                        network: 1 << 20,
                    },
                    resource_usage: NodeResources::zero(),
                    resource_usage_discount: NodeResources::zero(),
                },
                running: Vec::new(),
                started: Vec::new(),
                next_job_id: 1,
            }
        }
    }

    impl SchedulingContext for TestSchedulingContext {
        fn node_descriptor(&self) -> &ExecNodeDescriptor {
            &self.descriptor
        }

        fn running_jobs(&self) -> &[JobId] {
            &self.running
        }

        fn start_job(&mut self, spec: JobSpec) -> JobId {
            let job_id = JobId(self.next_job_id);
            self.next_job_id += 1;
            self.started.push(spec);
            self.running.push(job_id);
            job_id
        }

        fn preempt_job(&mut self, job_id: JobId) {
            self.running.retain(|running| *running != job_id);
        }
    }

    fn plain_chunk(seq: u64, data_weight: i64) -> Arc<InputChunk> {
        Arc::new(InputChunk {
            id: ChunkId::from_parts(8, seq),
            input_stream_index: 0,
            uncompressed_data_size: data_weight,
            compressed_data_size: data_weight,
            data_weight,
            row_count: data_weight,
            boundary_keys: None,
            replicas: vec![],
            erasure_codec: ErasureCodec::None,
            partitions: None,
        })
    }

    fn base_spec(operation: OperationKindSpec) -> OperationSpec {
        OperationSpec {
            input_table_paths: vec!["//tmp/in".to_string()],
            foreign_input_table_indices: vec![],
            output_table_paths: vec!["//tmp/out".to_string()],
            data_weight_per_job: 100,
            max_data_slices_per_job: 10_000,
            job_count: None,
            job_io: Default::default(),
            schema_inference_mode: crate::spec::SchemaInferenceMode::Auto,
            unavailable_chunk_strategy: UnavailableChunkStrategy::Wait,
            locality_timeout: Duration::from_secs(5),
            max_failed_job_count: 3,
            operation,
        }
    }

    fn mapper() -> UserJobSpec {
        UserJobSpec {
            command: "cat".to_string(),
            cpu_limit: 1.0,
            memory_limit: 64 << 20,
            memory_reserve_factor: 0.5,
            file_paths: vec![],
            environment: vec![],
        }
    }

    async fn running_controller(
        spec: OperationSpec,
        chunks: Vec<Arc<InputChunk>>,
    ) -> (OperationController, Arc<TestHost>) {
        let host = TestHost::new(chunks);
        let mut controller =
            OperationController::new(spec, ControllerConfig::default(), host.clone());
        controller.prepare().await.unwrap();
        controller.run();
        (controller, host)
    }

    #[tokio::test]
    async fn map_operation_runs_to_commit() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();

        let spec = base_spec(OperationKindSpec::Map(MapSpec { mapper: mapper() }));
        let chunks = (0..4).map(|seq| plain_chunk(seq, 100)).collect();
        let (mut controller, host) = running_controller(spec, chunks).await;

        assert_eq!(controller.pending_job_count(), 4);

        let mut context = TestSchedulingContext::new("node-x");
        let now = Instant::now();
        let mut jobs = Vec::new();
        while let Some(job_id) = controller.schedule_job(&mut context, now, true) {
            jobs.push(job_id);
        }
        assert_eq!(jobs.len(), 4);
        assert_eq!(controller.pending_job_count(), 0);
        assert!(context.started.iter().all(|job| job.kind == JobKind::Map));

        for (index, job_id) in jobs.iter().enumerate() {
            controller
                .on_job_completed(*job_id, vec![ChunkTreeId::from_parts(2, index as u64)])
                .unwrap();
        }
        assert!(controller.is_completed());

        controller.commit().await.unwrap();
        assert_eq!(controller.state(), OperationState::Completed);

        let committed = host.committed.lock().unwrap().clone().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].len(), 4);
    }

    // Scenario: equal-priority global tasks respect the delayed-execution
    // window, then both schedule once their timers expire.
    #[tokio::test]
    async fn delayed_execution_window() {
        let spec = OperationSpec {
            data_weight_per_job: 1 << 30,
            ..base_spec(OperationKindSpec::Sort(SortSpec {
                partition_count: 2,
                data_weight_per_shuffle_job: 1 << 30,
                sort_by: vec!["key".to_string()],
            }))
        };
        let chunks = vec![Arc::new(InputChunk {
            partitions: Some(vec![
                PartitionStatistics {
                    data_weight: 50,
                    row_count: 5,
                },
                PartitionStatistics {
                    data_weight: 50,
                    row_count: 5,
                },
            ]),
            ..(*plain_chunk(1, 100)).clone()
        })];
        let (mut controller, _host) = running_controller(spec, chunks).await;
        assert_eq!(controller.pending_job_count(), 2);

        let mut context = TestSchedulingContext::new("node-x");
        let start = Instant::now();

        // First sighting stamps the delay timers; nothing schedules.
        assert!(controller.schedule_job(&mut context, start, false).is_none());
        assert!(controller.schedule_job(&mut context, start, false).is_none());

        // Both timers expired; both tasks schedule in turn.
        let later = start + Duration::from_secs(6);
        assert!(controller.schedule_job(&mut context, later, false).is_some());
        assert!(controller.schedule_job(&mut context, later, false).is_some());
        assert!(controller.schedule_job(&mut context, later, false).is_none());

        let tags: Vec<Option<usize>> =
            context.started.iter().map(|job| job.partition_tag).collect();
        assert_eq!(tags, vec![Some(0), Some(1)]);
    }

    #[tokio::test]
    async fn starving_operation_bypasses_the_delay() {
        let spec = base_spec(OperationKindSpec::Map(MapSpec { mapper: mapper() }));
        let (mut controller, _host) =
            running_controller(spec, vec![plain_chunk(1, 100)]).await;

        let mut context = TestSchedulingContext::new("node-x");
        let now = Instant::now();
        assert!(controller.schedule_job(&mut context, now, false).is_none());
        assert!(controller.schedule_job(&mut context, now, true).is_some());
    }

    #[tokio::test]
    async fn failed_jobs_are_retried_until_the_limit() {
        let spec = base_spec(OperationKindSpec::Map(MapSpec { mapper: mapper() }));
        let (mut controller, host) =
            running_controller(spec, vec![plain_chunk(1, 100)]).await;

        let mut context = TestSchedulingContext::new("node-x");
        let now = Instant::now();

        for round in 0..3 {
            let job_id = controller.schedule_job(&mut context, now, true).unwrap();
            controller
                .on_job_failed(job_id, false, "user job exited with code 1")
                .unwrap();
            if round < 2 {
                assert_eq!(controller.state(), OperationState::Running);
            }
        }

        // Third failure hits max_failed_job_count.
        assert_eq!(controller.state(), OperationState::Failed);
        assert!(controller
            .failure_reason()
            .unwrap()
            .contains("failed job count exceeded"));
        assert!(!host.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sorted_merge_commits_teleports_in_order() {
        let spec = OperationSpec {
            data_weight_per_job: 1 << 30,
            ..base_spec(OperationKindSpec::Merge(MergeSpec {
                mode: MergeMode::Sorted,
                merge_by: vec!["key".to_string()],
                combine_chunks: false,
                force_transform: false,
            }))
        };

        // A teleportable chunk below a merged range.
        let teleport = Arc::new(InputChunk {
            boundary_keys: Some(chunk::BoundaryKeys {
                min: chunk::Key::from_ints(&[1]),
                max: chunk::Key::from_ints(&[5]),
            }),
            ..(*plain_chunk(1, 100)).clone()
        });
        let merged_a = Arc::new(InputChunk {
            boundary_keys: Some(chunk::BoundaryKeys {
                min: chunk::Key::from_ints(&[6]),
                max: chunk::Key::from_ints(&[9]),
            }),
            ..(*plain_chunk(2, 100)).clone()
        });
        let merged_b = Arc::new(InputChunk {
            boundary_keys: Some(chunk::BoundaryKeys {
                min: chunk::Key::from_ints(&[7]),
                max: chunk::Key::from_ints(&[10]),
            }),
            ..(*plain_chunk(3, 100)).clone()
        });

        let (mut controller, host) =
            running_controller(spec, vec![teleport, merged_a, merged_b]).await;
        assert_eq!(controller.pending_job_count(), 1);

        let mut context = TestSchedulingContext::new("node-x");
        let job_id = controller
            .schedule_job(&mut context, Instant::now(), true)
            .unwrap();
        assert_eq!(context.started[0].kind, JobKind::SortedMerge);

        let job_tree = ChunkTreeId::from_parts(2, 1);
        controller.on_job_completed(job_id, vec![job_tree]).unwrap();
        controller.commit().await.unwrap();

        let committed = host.committed.lock().unwrap().clone().unwrap();
        assert_eq!(
            committed[0],
            vec![
                ChunkTreeId::new(*ChunkId::from_parts(8, 1).as_bytes()),
                job_tree,
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_revives_pool_state() {
        let spec = base_spec(OperationKindSpec::Map(MapSpec { mapper: mapper() }));
        let chunks: Vec<_> = (0..2).map(|seq| plain_chunk(seq, 100)).collect();
        let (mut controller, _host) = running_controller(spec.clone(), chunks.clone()).await;

        let mut context = TestSchedulingContext::new("node-x");
        let job_id = controller
            .schedule_job(&mut context, Instant::now(), true)
            .unwrap();
        controller
            .on_job_completed(job_id, vec![ChunkTreeId::from_parts(2, 0)])
            .unwrap();
        assert_eq!(controller.pending_job_count(), 1);

        let mut snapshot = Vec::new();
        controller.save_snapshot(&mut snapshot);

        // A revived controller re-prepares from the spec, then restores
        // the checkpointed progress.
        let host = TestHost::new(chunks);
        let mut revived =
            OperationController::new(spec, ControllerConfig::default(), host.clone());
        revived.prepare().await.unwrap();
        revived.load_snapshot(&mut snapshot.as_slice()).unwrap();
        revived.run();

        assert_eq!(revived.pending_job_count(), 1);

        let job_id = revived
            .schedule_job(&mut context, Instant::now(), true)
            .unwrap();
        revived
            .on_job_completed(job_id, vec![ChunkTreeId::from_parts(2, 1)])
            .unwrap();
        assert!(revived.is_completed());
    }

    #[tokio::test]
    async fn unavailable_input_suspends_and_resumes() {
        let spec = OperationSpec {
            job_count: Some(1),
            ..base_spec(OperationKindSpec::Merge(MergeSpec {
                mode: MergeMode::Ordered,
                merge_by: vec![],
                combine_chunks: false,
                force_transform: false,
            }))
        };
        let chunk = plain_chunk(1, 100);
        let (mut controller, _host) = running_controller(spec, vec![chunk.clone()]).await;
        assert_eq!(controller.pending_job_count(), 1);

        controller.on_input_chunk_unavailable(chunk.id).unwrap();
        assert_eq!(controller.pending_job_count(), 0);

        let mut context = TestSchedulingContext::new("node-x");
        assert!(controller
            .schedule_job(&mut context, Instant::now(), true)
            .is_none());

        controller.on_input_chunk_available(chunk.id).unwrap();
        assert_eq!(controller.pending_job_count(), 1);
        assert!(controller
            .schedule_job(&mut context, Instant::now(), true)
            .is_some());
    }
}

