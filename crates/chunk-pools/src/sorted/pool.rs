use crate::sorted::{SortedJobStub, SortedOutputEntry};
use crate::{
    InputCookie, OutputCookie, OutputOrder, OutputOrderEntry, PoolError, PoolInput, PoolOutput,
    ProgressCounter,
};
use chunk::{
    add_stripe_to_list, ChunkSlice, ChunkStripe, ChunkStripeList, InputChunk, NodeDirectory,
    StripeStatistics,
};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    Running,
    Completed,
}

struct JobEntry {
    stripes: Vec<Arc<ChunkStripe>>,
    data_weight: i64,
    row_count: i64,
    is_maniac: bool,
    state: JobState,
    extracted_list: Option<Arc<ChunkStripeList>>,
    /// Set once the job output was lost: replicas moved, so locality is
    /// no longer meaningful for it.
    lost: bool,
}

/// SortedChunkPool serves the jobs planned by the sorted job builder.
///
/// Jobs are extracted in plan order regardless of extraction timing, so
/// the committed output order is a function of the inputs alone. The pool
/// owns the output order interleaving job outputs with teleported chunks.
pub struct SortedChunkPool {
    node_directory: Arc<NodeDirectory>,
    finished: bool,

    jobs: Vec<JobEntry>,
    pending: BTreeSet<usize>,

    output_order: OutputOrder,
    teleport_chunks: Vec<Arc<InputChunk>>,

    address_to_locality: IndexMap<String, i64>,

    job_counter: ProgressCounter,
    data_weight_counter: ProgressCounter,
    row_counter: ProgressCounter,
}

impl SortedChunkPool {
    pub fn new(node_directory: Arc<NodeDirectory>) -> Self {
        Self {
            node_directory,
            finished: false,
            jobs: Vec::new(),
            pending: BTreeSet::new(),
            output_order: OutputOrder::new(),
            teleport_chunks: Vec::new(),
            address_to_locality: IndexMap::new(),
            job_counter: ProgressCounter::default(),
            data_weight_counter: ProgressCounter::default(),
            row_counter: ProgressCounter::default(),
        }
    }

    /// Load the builder's planned entries and finish the pool.
    pub fn from_entries(
        node_directory: Arc<NodeDirectory>,
        entries: Vec<SortedOutputEntry>,
    ) -> Self {
        let mut pool = Self::new(node_directory);
        for entry in entries {
            match entry {
                SortedOutputEntry::Job(stub) => {
                    pool.push_job(stub);
                }
                SortedOutputEntry::TeleportChunk(chunk) => pool.push_teleport(chunk),
            }
        }
        pool.finish();
        pool
    }

    pub fn push_job(&mut self, stub: SortedJobStub) -> OutputCookie {
        assert!(!self.finished, "job pushed into a finished pool");

        let cookie = OutputCookie(self.jobs.len() as i32);
        let job = JobEntry {
            stripes: stub.stripes,
            data_weight: stub.data_weight,
            row_count: stub.row_count,
            is_maniac: stub.is_maniac,
            state: JobState::Pending,
            extracted_list: None,
            lost: false,
        };

        self.job_counter.increment(1);
        self.data_weight_counter.increment(job.data_weight);
        self.row_counter.increment(job.row_count);

        self.jobs.push(job);
        self.update_locality(cookie.0 as usize, 1);
        self.pending.insert(cookie.0 as usize);
        self.output_order.push(OutputOrderEntry::Cookie(cookie));

        cookie
    }

    pub fn push_teleport(&mut self, chunk: Arc<InputChunk>) {
        assert!(!self.finished, "teleport pushed into a finished pool");
        self.output_order
            .push(OutputOrderEntry::TeleportChunk(chunk.id));
        self.teleport_chunks.push(chunk);
    }

    /// A running job was interrupted and returned its unread input; plan a
    /// follow-up job resuming at the slice boundary, ordered right after
    /// the interrupted one.
    pub fn add_unread_slices(
        &mut self,
        cookie: OutputCookie,
        slices: Vec<ChunkSlice>,
    ) -> Result<OutputCookie, PoolError> {
        let interrupted = self.job(cookie)?;
        let is_maniac = interrupted.is_maniac;

        let mut per_stream: Vec<Vec<ChunkSlice>> = Vec::new();
        let mut data_weight = 0;
        let mut row_count = 0;
        let mut slice_count = 0;
        for slice in slices {
            let stream = slice.input_stream_index();
            if stream >= per_stream.len() {
                per_stream.resize_with(stream + 1, Vec::new);
            }
            data_weight += slice.data_weight();
            row_count += slice.row_count();
            slice_count += 1;
            per_stream[stream].push(slice);
        }

        let follow_up = OutputCookie(self.jobs.len() as i32);
        let job = JobEntry {
            stripes: per_stream
                .into_iter()
                .filter(|slices| !slices.is_empty())
                .map(|slices| Arc::new(ChunkStripe::new(slices)))
                .collect(),
            data_weight,
            row_count,
            is_maniac,
            state: JobState::Pending,
            extracted_list: None,
            lost: false,
        };

        self.job_counter.increment(1);
        self.data_weight_counter.increment(job.data_weight);
        self.row_counter.increment(job.row_count);

        self.jobs.push(job);
        self.update_locality(follow_up.0 as usize, 1);
        self.pending.insert(follow_up.0 as usize);

        self.output_order.seek_cookie(cookie);
        self.output_order
            .push(OutputOrderEntry::Cookie(follow_up));

        tracing::debug!(
            interrupted = %cookie,
            follow_up = %follow_up,
            slice_count,
            "follow-up job planned for unread input",
        );
        Ok(follow_up)
    }

    pub fn output_order(&self) -> &OutputOrder {
        &self.output_order
    }

    pub fn teleport_chunks(&self) -> &[Arc<InputChunk>] {
        &self.teleport_chunks
    }

    pub fn is_maniac(&self, cookie: OutputCookie) -> Result<bool, PoolError> {
        Ok(self.job(cookie)?.is_maniac)
    }

    pub fn job_counter(&self) -> &ProgressCounter {
        &self.job_counter
    }

    fn job(&self, cookie: OutputCookie) -> Result<&JobEntry, PoolError> {
        self.jobs
            .get(cookie.0 as usize)
            .ok_or(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            })
    }

    fn job_mut(&mut self, cookie: OutputCookie) -> Result<&mut JobEntry, PoolError> {
        self.jobs
            .get_mut(cookie.0 as usize)
            .ok_or(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            })
    }

    fn expect_state(
        job: &JobEntry,
        cookie: OutputCookie,
        expected: JobState,
    ) -> Result<(), PoolError> {
        if job.state != expected {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: match job.state {
                    JobState::Pending => "pending",
                    JobState::Running => "running",
                    JobState::Completed => "completed",
                },
                expected: match expected {
                    JobState::Pending => "pending",
                    JobState::Running => "running",
                    JobState::Completed => "completed",
                },
            });
        }
        Ok(())
    }

    fn update_locality(&mut self, job_index: usize, sign: i64) {
        let stripes: Vec<Arc<ChunkStripe>> = self.jobs[job_index].stripes.clone();
        for stripe in stripes {
            for slice in &stripe.slices {
                for replica in &slice.chunk().replicas {
                    let Some(descriptor) = self.node_directory.get(replica.node_id) else {
                        continue;
                    };
                    *self
                        .address_to_locality
                        .entry(descriptor.address.clone())
                        .or_default() += slice.locality(replica.replica_index) * sign;
                }
            }
        }
    }
}

impl SortedChunkPool {
    pub fn save(&self, out: &mut Vec<u8>) {
        use crate::persist::{
            put_bool, put_chunk, put_i64, put_option, put_stripe, put_stripe_list, put_u32,
            put_usize, record, tags,
        };
        record(out, tags::SORTED_POOL, |out| {
            put_bool(out, self.finished);
            put_u32(out, self.jobs.len() as u32);
            for job in &self.jobs {
                put_u32(out, job.stripes.len() as u32);
                for stripe in &job.stripes {
                    put_stripe(out, stripe);
                }
                put_i64(out, job.data_weight);
                put_i64(out, job.row_count);
                put_bool(out, job.is_maniac);
                put_u32(
                    out,
                    match job.state {
                        JobState::Pending => 0,
                        JobState::Running => 1,
                        JobState::Completed => 2,
                    },
                );
                put_option(out, job.extracted_list.as_deref(), |out, list| {
                    put_stripe_list(out, list)
                });
                put_bool(out, job.lost);
            }
            put_u32(out, self.pending.len() as u32);
            for &index in &self.pending {
                put_usize(out, index);
            }
            self.output_order.save(out);
            put_u32(out, self.teleport_chunks.len() as u32);
            for chunk in &self.teleport_chunks {
                put_chunk(out, chunk);
            }
            self.job_counter.save(out);
            self.data_weight_counter.save(out);
            self.row_counter.save(out);
        });
    }

    pub fn load(
        input: &mut &[u8],
        node_directory: Arc<NodeDirectory>,
    ) -> Result<Self, crate::persist::PersistError> {
        use crate::persist::{
            expect_record, get_bool, get_chunk, get_i64, get_option, get_stripe, get_stripe_list,
            get_u32, get_usize, parse_payload, tags, PersistError,
        };
        let payload = expect_record(input, tags::SORTED_POOL)?;
        parse_payload(payload, |input| {
            let finished = get_bool(input)?;
            let job_count = get_u32(input)?;
            let mut jobs = Vec::with_capacity(job_count as usize);
            for _ in 0..job_count {
                let stripe_count = get_u32(input)?;
                let mut stripes = Vec::with_capacity(stripe_count as usize);
                for _ in 0..stripe_count {
                    stripes.push(Arc::new(get_stripe(input)?));
                }
                jobs.push(JobEntry {
                    stripes,
                    data_weight: get_i64(input)?,
                    row_count: get_i64(input)?,
                    is_maniac: get_bool(input)?,
                    state: match get_u32(input)? {
                        0 => JobState::Pending,
                        1 => JobState::Running,
                        2 => JobState::Completed,
                        other => return Err(PersistError::UnknownDiscriminator(other)),
                    },
                    extracted_list: get_option(input, |input| {
                        Ok(Arc::new(get_stripe_list(input)?))
                    })?,
                    lost: get_bool(input)?,
                });
            }
            let pending_count = get_u32(input)?;
            let mut pending = BTreeSet::new();
            for _ in 0..pending_count {
                pending.insert(get_usize(input)?);
            }
            let output_order = OutputOrder::load(input)?;
            let teleport_count = get_u32(input)?;
            let mut teleport_chunks = Vec::with_capacity(teleport_count as usize);
            for _ in 0..teleport_count {
                teleport_chunks.push(Arc::new(get_chunk(input)?));
            }

            let mut pool = Self {
                node_directory,
                finished,
                jobs,
                pending,
                output_order,
                teleport_chunks,
                address_to_locality: IndexMap::new(),
                job_counter: ProgressCounter::load(input)?,
                data_weight_counter: ProgressCounter::load(input)?,
                row_counter: ProgressCounter::load(input)?,
            };
            // The locality index is derived from pending, unlost jobs.
            let to_register: Vec<usize> = pool
                .pending
                .iter()
                .copied()
                .filter(|&index| !pool.jobs[index].lost)
                .collect();
            for index in to_register {
                pool.update_locality(index, 1);
            }
            Ok(pool)
        })
    }
}

impl PoolInput for SortedChunkPool {
    /// Each stripe added directly becomes one job, in add order. The
    /// builder path uses `from_entries` instead.
    fn add(&mut self, stripe: Arc<ChunkStripe>) -> Result<InputCookie, PoolError> {
        if self.finished {
            return Err(PoolError::AddAfterFinish);
        }
        let statistics = stripe.statistics();
        let cookie = self.push_job(SortedJobStub {
            stripes: vec![stripe],
            data_weight: statistics.data_weight,
            row_count: statistics.row_count,
            slice_count: statistics.chunk_count as usize,
            primary_slice_count: statistics.chunk_count as usize,
            is_maniac: false,
        });
        Ok(InputCookie(cookie.0))
    }

    fn suspend(&mut self, _cookie: InputCookie) -> Result<(), PoolError> {
        Err(PoolError::SuspendUnsupported("sorted"))
    }

    fn resume(&mut self, _cookie: InputCookie, _stripe: Arc<ChunkStripe>) -> Result<(), PoolError> {
        Err(PoolError::SuspendUnsupported("sorted"))
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl PoolOutput for SortedChunkPool {
    fn total_data_weight(&self) -> i64 {
        self.data_weight_counter.total()
    }
    fn running_data_weight(&self) -> i64 {
        self.data_weight_counter.running()
    }
    fn completed_data_weight(&self) -> i64 {
        self.data_weight_counter.get_completed()
    }
    fn pending_data_weight(&self) -> i64 {
        self.data_weight_counter.pending()
    }
    fn total_row_count(&self) -> i64 {
        self.row_counter.total()
    }

    fn is_completed(&self) -> bool {
        self.finished && self.job_counter.get_completed() == self.jobs.len() as i64
    }

    fn total_job_count(&self) -> i64 {
        self.jobs.len() as i64
    }

    fn pending_job_count(&self) -> i64 {
        if self.finished {
            self.pending.len() as i64
        } else {
            0
        }
    }

    fn approximate_stripe_statistics(&self) -> Vec<StripeStatistics> {
        let Some(&next) = self.pending.iter().next() else {
            return Vec::new();
        };
        self.jobs[next]
            .stripes
            .iter()
            .map(|stripe| stripe.statistics())
            .collect()
    }

    fn locality(&self, address: &str) -> i64 {
        self.address_to_locality
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    fn extract(&mut self, address: Option<&str>) -> Result<Option<OutputCookie>, PoolError> {
        if !self.finished {
            return Err(PoolError::ExtractBeforeFinish);
        }
        let Some(&index) = self.pending.iter().next() else {
            return Ok(None);
        };
        self.pending.remove(&index);

        let cookie = OutputCookie(index as i32);
        if !self.jobs[index].lost {
            self.update_locality(index, -1);
        }

        let job = &self.jobs[index];
        let mut list = ChunkStripeList::default();
        for stripe in &job.stripes {
            let statistics = stripe.statistics();
            add_stripe_to_list(
                &mut list,
                stripe.clone(),
                statistics.data_weight,
                statistics.row_count,
                &self.node_directory,
                if job.lost { None } else { address },
            );
        }

        let job = &mut self.jobs[index];
        job.extracted_list = Some(Arc::new(list));
        job.state = JobState::Running;

        self.job_counter.start(1);
        self.data_weight_counter.start(job.data_weight);
        self.row_counter.start(job.row_count);

        Ok(Some(cookie))
    }

    fn stripe_list(&self, cookie: OutputCookie) -> Result<Arc<ChunkStripeList>, PoolError> {
        let job = self.job(cookie)?;
        job.extracted_list.clone().ok_or(PoolError::CookieState {
            cookie: cookie.0,
            actual: "pending",
            expected: "running",
        })
    }

    fn completed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let job = self.job_mut(cookie)?;
        Self::expect_state(job, cookie, JobState::Running)?;
        job.state = JobState::Completed;
        let (data_weight, row_count) = (job.data_weight, job.row_count);

        self.job_counter.completed(1);
        self.data_weight_counter.completed(data_weight);
        self.row_counter.completed(row_count);
        Ok(())
    }

    fn failed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.return_to_pending(cookie)?;
        let job = &self.jobs[cookie.0 as usize];
        let (data_weight, row_count) = (job.data_weight, job.row_count);
        self.job_counter.failed(1);
        self.data_weight_counter.failed(data_weight);
        self.row_counter.failed(row_count);
        Ok(())
    }

    fn aborted(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.return_to_pending(cookie)?;
        let job = &self.jobs[cookie.0 as usize];
        let (data_weight, row_count) = (job.data_weight, job.row_count);
        self.job_counter.aborted(1);
        self.data_weight_counter.aborted(data_weight);
        self.row_counter.aborted(row_count);
        Ok(())
    }

    fn lost(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let job = self.job_mut(cookie)?;
        Self::expect_state(job, cookie, JobState::Completed)?;
        job.state = JobState::Pending;
        job.lost = true;
        job.extracted_list = None;
        let (data_weight, row_count) = (job.data_weight, job.row_count);

        self.pending.insert(cookie.0 as usize);

        self.job_counter.lost(1);
        self.data_weight_counter.lost(data_weight);
        self.row_counter.lost(row_count);
        Ok(())
    }
}

impl SortedChunkPool {
    fn return_to_pending(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let job = self.job_mut(cookie)?;
        Self::expect_state(job, cookie, JobState::Running)?;
        job.state = JobState::Pending;
        let lost = job.lost;

        self.pending.insert(cookie.0 as usize);
        if !lost {
            self.update_locality(cookie.0 as usize, 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sorted::{SortedJobBuilder, SortedJobBuilderOptions};
    use chunk::{
        BoundaryKeys, ChunkId, ErasureCodec, InputStreamDescriptor, InputStreamDirectory, Key,
    };

    fn keyed_slice(seq: u64, min: i64, max: i64, data_weight: i64) -> ChunkSlice {
        ChunkSlice::whole(Arc::new(InputChunk {
            id: ChunkId::from_parts(6, seq),
            input_stream_index: 0,
            uncompressed_data_size: data_weight,
            compressed_data_size: data_weight,
            data_weight,
            row_count: data_weight,
            boundary_keys: Some(BoundaryKeys {
                min: Key::from_ints(&[min]),
                max: Key::from_ints(&[max]),
            }),
            replicas: vec![],
            erasure_codec: ErasureCodec::None,
            partitions: None,
        }))
    }

    fn build_pool(slices: Vec<ChunkSlice>, teleport: bool) -> SortedChunkPool {
        let directory =
            InputStreamDirectory::new(vec![InputStreamDescriptor::new(teleport, true, false)]);
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                enable_teleport: teleport,
                max_data_weight_per_job: 100,
                ..Default::default()
            },
            directory,
        );
        for slice in slices {
            builder.add_primary(slice).unwrap();
        }
        SortedChunkPool::from_entries(
            Arc::new(NodeDirectory::default()),
            builder.build().unwrap(),
        )
    }

    // Scenario: teleport entry then merge-job entry, in output order,
    // with completions arriving in any order.
    #[test]
    fn teleport_and_job_commit_in_plan_order() {
        let pool = build_pool(
            vec![keyed_slice(1, 1, 5, 100), keyed_slice(2, 6, 9, 100)],
            true,
        );

        assert_eq!(pool.teleport_chunks().len(), 2);
        assert_eq!(pool.total_job_count(), 0);
        assert_eq!(
            pool.output_order().to_entry_vector(),
            vec![
                OutputOrderEntry::TeleportChunk(ChunkId::from_parts(6, 1)),
                OutputOrderEntry::TeleportChunk(ChunkId::from_parts(6, 2)),
            ]
        );
    }

    #[test]
    fn extraction_order_follows_plan_order() {
        let mut pool = build_pool(
            vec![
                keyed_slice(1, 1, 10, 100),
                keyed_slice(2, 11, 20, 100),
                keyed_slice(3, 21, 30, 100),
            ],
            false,
        );
        assert_eq!(pool.total_job_count(), 3);

        let first = pool.extract(None).unwrap().unwrap();
        let second = pool.extract(None).unwrap().unwrap();
        assert!(first < second);

        // A failed early job is re-served before later pending jobs.
        pool.failed(first).unwrap();
        assert_eq!(pool.extract(None).unwrap(), Some(first));
    }

    #[test]
    fn failed_job_replays_with_identical_stripes() {
        let mut pool = build_pool(vec![keyed_slice(1, 1, 10, 100)], false);

        let cookie = pool.extract(None).unwrap().unwrap();
        let first = pool.stripe_list(cookie).unwrap();
        pool.failed(cookie).unwrap();

        let again = pool.extract(None).unwrap().unwrap();
        assert_eq!(again, cookie);
        assert_eq!(
            pool.stripe_list(again).unwrap().stripes,
            first.stripes
        );
    }

    #[test]
    fn interruption_orders_follow_up_after_original() {
        let mut pool = build_pool(
            vec![keyed_slice(1, 1, 10, 100), keyed_slice(2, 11, 20, 100)],
            false,
        );

        let first = pool.extract(None).unwrap().unwrap();
        let follow_up = pool
            .add_unread_slices(first, vec![keyed_slice(1, 5, 10, 50)])
            .unwrap();
        pool.completed(first).unwrap();

        let entries = pool.output_order().to_entry_vector();
        assert_eq!(
            entries,
            vec![
                OutputOrderEntry::Cookie(first),
                OutputOrderEntry::Cookie(follow_up),
                OutputOrderEntry::Cookie(OutputCookie(1)),
            ]
        );

        // Extraction continues in plan-index order; the committed order
        // above is what interleaves the follow-up after its original.
        assert_eq!(pool.extract(None).unwrap(), Some(OutputCookie(1)));
        assert_eq!(pool.extract(None).unwrap(), Some(follow_up));
    }

    #[test]
    fn lost_job_replays_without_locality() {
        let mut pool = build_pool(vec![keyed_slice(1, 1, 10, 100)], false);

        let cookie = pool.extract(Some("node-x")).unwrap().unwrap();
        pool.completed(cookie).unwrap();
        assert!(pool.is_completed());

        pool.lost(cookie).unwrap();
        assert!(!pool.is_completed());

        let again = pool.extract(Some("node-x")).unwrap().unwrap();
        assert_eq!(again, cookie);
        let list = pool.stripe_list(again).unwrap();
        assert_eq!(list.local_chunk_count, 0);

        pool.completed(again).unwrap();
        assert!(pool.is_completed());
    }
}
