use crate::{InputCookie, OutputCookie, PoolError, PoolInput, ProgressCounter};
use chunk::{ChunkStripe, ChunkStripeList, StripeStatistics, APPROXIMATE_SIZES_BOOST_FACTOR};
use std::collections::BTreeSet;
use std::sync::Arc;
use superslice::Ext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Initializing,
    Pending,
    Running,
    Completed,
}

/// Run is a consecutive block of elementary stripes packaged into one
/// shuffle job.
#[derive(Debug, Clone)]
struct Run {
    elementary_begin: usize,
    elementary_end: usize,
    data_weight: i64,
    row_count: i64,
    suspend_count: i32,
    state: RunState,
    is_approximate: bool,
}

impl Run {
    fn new(elementary_begin: usize) -> Self {
        Self {
            elementary_begin,
            elementary_end: elementary_begin,
            data_weight: 0,
            row_count: 0,
            suspend_count: 0,
            state: RunState::Initializing,
            is_approximate: false,
        }
    }
}

/// Per-partition output view state of a shuffle pool.
pub struct ShuffleOutput {
    partition_index: usize,

    runs: Vec<Run>,
    pending_runs: BTreeSet<usize>,

    job_counter: ProgressCounter,
    data_weight_counter: ProgressCounter,
    row_counter: ProgressCounter,
}

impl ShuffleOutput {
    fn new(partition_index: usize) -> Self {
        Self {
            partition_index,
            runs: vec![Run::new(0)],
            pending_runs: BTreeSet::new(),
            job_counter: ProgressCounter::default(),
            data_weight_counter: ProgressCounter::default(),
            row_counter: ProgressCounter::default(),
        }
    }

    fn add_stripe(
        &mut self,
        elementary_index: usize,
        data_weight: i64,
        row_count: i64,
        threshold: i64,
    ) {
        let run = self.runs.last().unwrap();
        if run.data_weight > 0 && run.data_weight + data_weight > threshold {
            self.seal_last_run();
            self.add_new_run();
        }

        let run = self.runs.last_mut().unwrap();
        assert_eq!(elementary_index, run.elementary_end);
        run.elementary_end = elementary_index + 1;
        run.data_weight += data_weight;
        run.row_count += row_count;

        self.data_weight_counter.increment(data_weight);
        self.row_counter.increment(row_count);
    }

    fn suspend_stripe(&mut self, elementary_index: usize) {
        if let Some(index) = self.find_run(elementary_index) {
            let run = &mut self.runs[index];
            run.is_approximate = true;
            run.suspend_count += 1;
            self.update_pending_run_set(index);
        }
    }

    fn resume_stripe(&mut self, elementary_index: usize) {
        if let Some(index) = self.find_run(elementary_index) {
            let run = &mut self.runs[index];
            run.suspend_count -= 1;
            assert!(run.suspend_count >= 0);
            self.update_pending_run_set(index);
        }
    }

    fn finish_input(&mut self) {
        let last = self.runs.last().unwrap();
        if last.data_weight > 0 {
            self.seal_last_run();
        } else {
            self.runs.pop();
        }
    }

    fn update_pending_run_set(&mut self, index: usize) {
        let run = &self.runs[index];
        if run.state == RunState::Pending && run.suspend_count == 0 {
            self.pending_runs.insert(index);
        } else {
            self.pending_runs.remove(&index);
        }
    }

    fn add_new_run(&mut self) {
        let begin = self.runs.last().map(|run| run.elementary_end).unwrap_or(0);
        self.runs.push(Run::new(begin));
    }

    fn find_run(&self, elementary_index: usize) -> Option<usize> {
        match self.runs.last() {
            Some(last) if elementary_index < last.elementary_end => {}
            _ => return None,
        }

        let position = self
            .runs
            .upper_bound_by_key(&elementary_index, |run| run.elementary_begin)
            - 1;
        let run = &self.runs[position];
        assert!(
            run.elementary_begin <= elementary_index && elementary_index < run.elementary_end
        );
        Some(position)
    }

    fn seal_last_run(&mut self) {
        let index = self.runs.len() - 1;
        let run = &mut self.runs[index];
        assert!(run.data_weight > 0);
        assert_eq!(run.state, RunState::Initializing);
        run.state = RunState::Pending;
        self.job_counter.increment(1);
        self.update_pending_run_set(index);
    }

    fn run_mut(&mut self, cookie: OutputCookie) -> Result<&mut Run, PoolError> {
        self.runs
            .get_mut(cookie.0 as usize)
            .ok_or(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            })
    }

    pub fn job_counter(&self) -> &ProgressCounter {
        &self.job_counter
    }

    pub fn pending_run_count(&self) -> usize {
        self.pending_runs.len()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn pending_data_weight(&self) -> i64 {
        self.data_weight_counter.pending()
    }

    /// Statistics of the next run to be handed out by `extract`.
    pub fn approximate_stripe_statistics(&self) -> Vec<StripeStatistics> {
        let Some(&index) = self.pending_runs.iter().next() else {
            return Vec::new();
        };
        let run = &self.runs[index];

        let mut stat = StripeStatistics {
            chunk_count: (run.elementary_end - run.elementary_begin) as i64,
            data_weight: run.data_weight,
            row_count: run.row_count,
        };
        if run.is_approximate {
            stat.data_weight *= APPROXIMATE_SIZES_BOOST_FACTOR;
            stat.row_count *= APPROXIMATE_SIZES_BOOST_FACTOR;
        }
        vec![stat]
    }
}

struct InputStripeRange {
    elementary_begin: usize,
    elementary_end: usize,
}

/// ShuffleChunkPool splits every added chunk slice into one elementary
/// stripe per output partition and packages them, per partition, into
/// runs approaching the data-weight threshold.
pub struct ShuffleChunkPool {
    finished: bool,
    data_weight_threshold: i64,

    input_stripes: Vec<InputStripeRange>,
    elementary_stripes: Vec<Arc<ChunkStripe>>,

    outputs: Vec<ShuffleOutput>,
}

impl ShuffleChunkPool {
    pub fn new(partition_count: usize, data_weight_threshold: i64) -> Self {
        Self {
            finished: false,
            data_weight_threshold,
            input_stripes: Vec::new(),
            elementary_stripes: Vec::new(),
            outputs: (0..partition_count).map(ShuffleOutput::new).collect(),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.outputs.len()
    }

    /// Mutable output facet of one partition.
    pub fn output(&mut self, partition_index: usize) -> ShuffleOutputView<'_> {
        assert!(partition_index < self.outputs.len());
        ShuffleOutputView {
            pool: self,
            partition_index,
        }
    }

    /// Read-only state of one partition's output.
    pub fn output_ref(&self, partition_index: usize) -> &ShuffleOutput {
        &self.outputs[partition_index]
    }

    pub fn is_completed(&self) -> bool {
        self.finished
            && self
                .outputs
                .iter()
                .all(|output| output.job_counter.get_completed() == output.runs.len() as i64)
    }

    /// Stripe list of one partition's run, buildable without a mutable
    /// output view.
    pub fn partition_stripe_list(
        &self,
        partition_index: usize,
        cookie: OutputCookie,
    ) -> Result<Arc<ChunkStripeList>, PoolError> {
        let output = &self.outputs[partition_index];
        let run = output
            .runs
            .get(cookie.0 as usize)
            .ok_or(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            })?;

        let mut list = ChunkStripeList {
            partition_tag: Some(output.partition_index),
            ..Default::default()
        };
        for elementary_index in run.elementary_begin..run.elementary_end {
            let stripe = self.elementary_stripes[elementary_index].clone();
            list.total_chunk_count += stripe.slices.len() as i64;
            list.stripes.push(stripe);
        }

        // Never make the totals approximate here: boosted sizes would
        // corrupt the sort's data-weight and row counters downstream.
        list.total_data_weight = run.data_weight;
        list.total_row_count = run.row_count;
        list.local_chunk_count = 0;
        list.non_local_chunk_count = list.total_chunk_count;
        list.is_approximate = run.is_approximate;

        Ok(Arc::new(list))
    }
}

impl ShuffleChunkPool {
    pub fn save(&self, out: &mut Vec<u8>) {
        use crate::persist::{put_bool, put_i64, put_stripe, put_u32, put_usize, record, tags};
        record(out, tags::SHUFFLE_POOL, |out| {
            put_bool(out, self.finished);
            put_i64(out, self.data_weight_threshold);
            put_u32(out, self.input_stripes.len() as u32);
            for range in &self.input_stripes {
                put_usize(out, range.elementary_begin);
                put_usize(out, range.elementary_end);
            }
            put_u32(out, self.elementary_stripes.len() as u32);
            for stripe in &self.elementary_stripes {
                put_stripe(out, stripe);
            }
            put_u32(out, self.outputs.len() as u32);
            for output in &self.outputs {
                put_u32(out, output.runs.len() as u32);
                for run in &output.runs {
                    put_usize(out, run.elementary_begin);
                    put_usize(out, run.elementary_end);
                    put_i64(out, run.data_weight);
                    put_i64(out, run.row_count);
                    put_i64(out, run.suspend_count as i64);
                    put_u32(
                        out,
                        match run.state {
                            RunState::Initializing => 0,
                            RunState::Pending => 1,
                            RunState::Running => 2,
                            RunState::Completed => 3,
                        },
                    );
                    put_bool(out, run.is_approximate);
                }
                output.job_counter.save(out);
                output.data_weight_counter.save(out);
                output.row_counter.save(out);
            }
        });
    }

    pub fn load(input: &mut &[u8]) -> Result<Self, crate::persist::PersistError> {
        use crate::persist::{
            expect_record, get_bool, get_i64, get_stripe, get_u32, get_usize, parse_payload, tags,
            PersistError,
        };
        let payload = expect_record(input, tags::SHUFFLE_POOL)?;
        parse_payload(payload, |input| {
            let finished = get_bool(input)?;
            let data_weight_threshold = get_i64(input)?;
            let input_count = get_u32(input)?;
            let mut input_stripes = Vec::with_capacity(input_count as usize);
            for _ in 0..input_count {
                input_stripes.push(InputStripeRange {
                    elementary_begin: get_usize(input)?,
                    elementary_end: get_usize(input)?,
                });
            }
            let elementary_count = get_u32(input)?;
            let mut elementary_stripes = Vec::with_capacity(elementary_count as usize);
            for _ in 0..elementary_count {
                elementary_stripes.push(Arc::new(get_stripe(input)?));
            }
            let output_count = get_u32(input)?;
            let mut outputs = Vec::with_capacity(output_count as usize);
            for partition_index in 0..output_count {
                let run_count = get_u32(input)?;
                let mut runs = Vec::with_capacity(run_count as usize);
                for _ in 0..run_count {
                    runs.push(Run {
                        elementary_begin: get_usize(input)?,
                        elementary_end: get_usize(input)?,
                        data_weight: get_i64(input)?,
                        row_count: get_i64(input)?,
                        suspend_count: get_i64(input)? as i32,
                        state: match get_u32(input)? {
                            0 => RunState::Initializing,
                            1 => RunState::Pending,
                            2 => RunState::Running,
                            3 => RunState::Completed,
                            other => return Err(PersistError::UnknownDiscriminator(other)),
                        },
                        is_approximate: get_bool(input)?,
                    });
                }
                let mut output = ShuffleOutput {
                    partition_index: partition_index as usize,
                    runs,
                    pending_runs: BTreeSet::new(),
                    job_counter: ProgressCounter::load(input)?,
                    data_weight_counter: ProgressCounter::load(input)?,
                    row_counter: ProgressCounter::load(input)?,
                };
                // The pending set is derived state.
                for index in 0..output.runs.len() {
                    output.update_pending_run_set(index);
                }
                outputs.push(output);
            }
            Ok(Self {
                finished,
                data_weight_threshold,
                input_stripes,
                elementary_stripes,
                outputs,
            })
        })
    }
}

impl PoolInput for ShuffleChunkPool {
    fn add(&mut self, stripe: Arc<ChunkStripe>) -> Result<InputCookie, PoolError> {
        if self.finished {
            return Err(PoolError::AddAfterFinish);
        }

        let cookie = InputCookie(self.input_stripes.len() as i32);
        let elementary_begin = self.elementary_stripes.len();

        for slice in &stripe.slices {
            let partitions = slice
                .chunk()
                .partitions
                .clone()
                .ok_or(PoolError::MissingPartitionStatistics {
                    chunk_id: slice.chunk_id(),
                })?;
            if partitions.len() != self.outputs.len() {
                return Err(PoolError::PartitionCountMismatch {
                    chunk_id: slice.chunk_id(),
                    actual: partitions.len(),
                    expected: self.outputs.len(),
                });
            }

            let elementary_index = self.elementary_stripes.len();
            self.elementary_stripes
                .push(Arc::new(ChunkStripe::from_slice(slice.strip_partitions())));

            for (output, attributes) in self.outputs.iter_mut().zip(partitions.iter()) {
                output.add_stripe(
                    elementary_index,
                    attributes.data_weight,
                    attributes.row_count,
                    self.data_weight_threshold,
                );
            }
        }

        self.input_stripes.push(InputStripeRange {
            elementary_begin,
            elementary_end: self.elementary_stripes.len(),
        });

        Ok(cookie)
    }

    fn suspend(&mut self, cookie: InputCookie) -> Result<(), PoolError> {
        let range = self
            .input_stripes
            .get(cookie.0 as usize)
            .ok_or(PoolError::UnknownCookie {
                kind: "input",
                cookie: cookie.0,
            })?;

        for elementary_index in range.elementary_begin..range.elementary_end {
            for output in &mut self.outputs {
                output.suspend_stripe(elementary_index);
            }
        }
        Ok(())
    }

    fn resume(&mut self, cookie: InputCookie, stripe: Arc<ChunkStripe>) -> Result<(), PoolError> {
        let range = self
            .input_stripes
            .get(cookie.0 as usize)
            .ok_or(PoolError::UnknownCookie {
                kind: "input",
                cookie: cookie.0,
            })?;
        let (begin, end) = (range.elementary_begin, range.elementary_end);
        let stripe_count = end - begin;
        if stripe_count == 0 {
            return Ok(());
        }

        // Sizes and even row counts may have changed under us, but the run
        // counters stay pegged to the initial statistics: re-accounting
        // sealed runs would destabilize planning. Memory estimates may
        // drift; log it and move on.
        tracing::debug!(
            cookie = cookie.0,
            old_count = stripe_count,
            new_count = stripe.slices.len(),
            "shuffle resume keeps counters from the original stripe",
        );

        let limit = stripe.slices.len().min(stripe_count - 1);

        // Fill the initial range of elementary stripes with new slices,
        // one per stripe.
        for (offset, slice) in stripe.slices.iter().take(limit).enumerate() {
            self.elementary_stripes[begin + offset] =
                Arc::new(ChunkStripe::from_slice(slice.strip_partitions()));
        }

        // Clean up the rest.
        for elementary_index in begin + limit..end {
            self.elementary_stripes[elementary_index] = Arc::new(ChunkStripe::default());
        }

        // Put the remaining slices, if any, into the last stripe in range.
        let mut last = ChunkStripe::default();
        for slice in stripe.slices.iter().skip(limit) {
            last.slices.push(slice.strip_partitions());
        }
        if !last.slices.is_empty() {
            self.elementary_stripes[begin + limit] = Arc::new(last);
        }

        for elementary_index in begin..end {
            for output in &mut self.outputs {
                output.resume_stripe(elementary_index);
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        for output in &mut self.outputs {
            output.finish_input();
        }
    }
}

/// Output facet over one shuffle partition.
pub struct ShuffleOutputView<'a> {
    pool: &'a mut ShuffleChunkPool,
    partition_index: usize,
}

impl ShuffleOutputView<'_> {
    fn output(&self) -> &ShuffleOutput {
        &self.pool.outputs[self.partition_index]
    }

    fn output_mut(&mut self) -> &mut ShuffleOutput {
        &mut self.pool.outputs[self.partition_index]
    }

    pub fn total_data_weight(&self) -> i64 {
        self.output().data_weight_counter.total()
    }
    pub fn running_data_weight(&self) -> i64 {
        self.output().data_weight_counter.running()
    }
    pub fn completed_data_weight(&self) -> i64 {
        self.output().data_weight_counter.get_completed()
    }
    pub fn pending_data_weight(&self) -> i64 {
        self.output().data_weight_counter.pending()
    }
    pub fn total_row_count(&self) -> i64 {
        self.output().row_counter.total()
    }

    pub fn is_completed(&self) -> bool {
        self.pool.finished
            && self.output().job_counter.get_completed() == self.output().runs.len() as i64
    }

    pub fn total_job_count(&self) -> i64 {
        self.output().runs.len() as i64
    }

    pub fn pending_job_count(&self) -> i64 {
        self.output().pending_runs.len() as i64
    }

    pub fn approximate_stripe_statistics(&self) -> Vec<StripeStatistics> {
        self.output().approximate_stripe_statistics()
    }

    pub fn extract(&mut self) -> Option<OutputCookie> {
        let output = self.output_mut();
        let &index = output.pending_runs.iter().next()?;
        output.pending_runs.remove(&index);

        let run = &mut output.runs[index];
        assert_eq!(run.state, RunState::Pending);
        run.state = RunState::Running;
        let (data_weight, row_count) = (run.data_weight, run.row_count);

        output.job_counter.start(1);
        output.data_weight_counter.start(data_weight);
        output.row_counter.start(row_count);

        Some(OutputCookie(index as i32))
    }

    pub fn stripe_list(&self, cookie: OutputCookie) -> Result<Arc<ChunkStripeList>, PoolError> {
        self.pool.partition_stripe_list(self.partition_index, cookie)
    }

    pub fn completed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let output = self.output_mut();
        let run = output.run_mut(cookie)?;
        if run.state != RunState::Running {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: "not running",
                expected: "running",
            });
        }
        run.state = RunState::Completed;
        let (data_weight, row_count) = (run.data_weight, run.row_count);

        output.job_counter.completed(1);
        output.data_weight_counter.completed(data_weight);
        output.row_counter.completed(row_count);
        Ok(())
    }

    pub fn failed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.return_to_pending(cookie, RunState::Running)?;
        let output = self.output_mut();
        let run = &output.runs[cookie.0 as usize];
        let (data_weight, row_count) = (run.data_weight, run.row_count);
        output.job_counter.failed(1);
        output.data_weight_counter.failed(data_weight);
        output.row_counter.failed(row_count);
        Ok(())
    }

    pub fn aborted(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.return_to_pending(cookie, RunState::Running)?;
        let output = self.output_mut();
        let run = &output.runs[cookie.0 as usize];
        let (data_weight, row_count) = (run.data_weight, run.row_count);
        output.job_counter.aborted(1);
        output.data_weight_counter.aborted(data_weight);
        output.row_counter.aborted(row_count);
        Ok(())
    }

    pub fn lost(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.return_to_pending(cookie, RunState::Completed)?;
        let output = self.output_mut();
        let run = &output.runs[cookie.0 as usize];
        let (data_weight, row_count) = (run.data_weight, run.row_count);
        output.job_counter.lost(1);
        output.data_weight_counter.lost(data_weight);
        output.row_counter.lost(row_count);
        Ok(())
    }

    fn return_to_pending(
        &mut self,
        cookie: OutputCookie,
        expected: RunState,
    ) -> Result<(), PoolError> {
        let output = self.output_mut();
        let run = output.run_mut(cookie)?;
        if run.state != expected {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: "unexpected state",
                expected: match expected {
                    RunState::Running => "running",
                    RunState::Completed => "completed",
                    _ => unreachable!(),
                },
            });
        }
        run.state = RunState::Pending;
        output.update_pending_run_set(cookie.0 as usize);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chunk::{ChunkId, ChunkSlice, ErasureCodec, InputChunk, PartitionStatistics};

    fn partitioned_stripe(seq: u64, sizes: &[(i64, i64)]) -> Arc<ChunkStripe> {
        Arc::new(ChunkStripe::from_slice(ChunkSlice::whole(Arc::new(
            InputChunk {
                id: ChunkId::from_parts(9, seq),
                input_stream_index: 0,
                uncompressed_data_size: sizes.iter().map(|s| s.0).sum(),
                compressed_data_size: 0,
                data_weight: sizes.iter().map(|s| s.0).sum(),
                row_count: sizes.iter().map(|s| s.1).sum(),
                boundary_keys: None,
                replicas: vec![],
                erasure_codec: ErasureCodec::None,
                partitions: Some(
                    sizes
                        .iter()
                        .map(|&(data_weight, row_count)| PartitionStatistics {
                            data_weight,
                            row_count,
                        })
                        .collect(),
                ),
            },
        ))))
    }

    fn run_weights(pool: &ShuffleChunkPool, partition: usize) -> Vec<i64> {
        pool.output_ref(partition)
            .runs
            .iter()
            .map(|run| run.data_weight)
            .collect()
    }

    // A run is sealed when the next stripe would push it past the
    // threshold, so a run never exceeds the threshold unless a single
    // stripe alone does.
    #[test]
    fn run_boundaries_track_the_threshold() {
        let mut pool = ShuffleChunkPool::new(2, 1000);

        pool.add(partitioned_stripe(1, &[(600, 6), (900, 9)])).unwrap();
        pool.add(partitioned_stripe(2, &[(500, 5), (300, 3)])).unwrap();
        pool.add(partitioned_stripe(3, &[(400, 4), (400, 4)])).unwrap();
        pool.finish();

        assert_eq!(run_weights(&pool, 0), vec![600, 900]);
        assert_eq!(run_weights(&pool, 1), vec![900, 700]);

        // Runs are monotone in elementary index.
        for partition in 0..2 {
            let runs = &pool.output_ref(partition).runs;
            assert_eq!(runs[0].elementary_begin, 0);
            assert_eq!(runs[0].elementary_end, 1);
            assert_eq!(runs[1].elementary_begin, 1);
            assert_eq!(runs[1].elementary_end, 3);
        }

        let mut output = pool.output(0);
        assert_eq!(output.total_job_count(), 2);
        assert_eq!(output.pending_job_count(), 2);

        let cookie = output.extract().unwrap();
        let list = output.stripe_list(cookie).unwrap();
        assert_eq!(list.partition_tag, Some(0));
        assert_eq!(list.total_data_weight, 600);
        assert_eq!(list.stripes.len(), 1);
    }

    #[test]
    fn oversized_stripe_gets_its_own_run() {
        let mut pool = ShuffleChunkPool::new(1, 100);
        pool.add(partitioned_stripe(1, &[(50, 1)])).unwrap();
        pool.add(partitioned_stripe(2, &[(500, 1)])).unwrap();
        pool.add(partitioned_stripe(3, &[(30, 1)])).unwrap();
        pool.finish();

        assert_eq!(run_weights(&pool, 0), vec![50, 500, 30]);
    }

    #[test]
    fn suspend_excludes_the_containing_run() {
        let mut pool = ShuffleChunkPool::new(1, 1000);
        let c1 = pool.add(partitioned_stripe(1, &[(600, 6)])).unwrap();
        pool.add(partitioned_stripe(2, &[(500, 5)])).unwrap();
        pool.finish();

        assert_eq!(pool.output(0).pending_job_count(), 2);

        pool.suspend(c1).unwrap();
        assert_eq!(pool.output(0).pending_job_count(), 1);

        pool.resume(c1, partitioned_stripe(1, &[(600, 6)])).unwrap();
        assert_eq!(pool.output(0).pending_job_count(), 2);

        // The touched run is marked approximate and its estimate boosted.
        let stats = pool.output(0).approximate_stripe_statistics();
        assert_eq!(stats[0].data_weight, 1200);

        let mut output = pool.output(0);
        let cookie = output.extract().unwrap();
        assert!(output.stripe_list(cookie).unwrap().is_approximate);
    }

    #[test]
    fn resume_rewrites_the_elementary_range() {
        let mut pool = ShuffleChunkPool::new(1, 10_000);
        let stripe = Arc::new(ChunkStripe::new(
            (0..3)
                .flat_map(|seq| {
                    partitioned_stripe(seq, &[(100, 1)]).slices.clone()
                })
                .collect(),
        ));
        let cookie = pool.add(stripe).unwrap();
        pool.suspend(cookie).unwrap();

        // Replace three elementary slices with four: the surplus lands in
        // the last stripe of the range.
        let replacement = Arc::new(ChunkStripe::new(
            (10..14)
                .flat_map(|seq| {
                    partitioned_stripe(seq, &[(100, 1)]).slices.clone()
                })
                .collect(),
        ));
        pool.resume(cookie, replacement).unwrap();
        pool.finish();

        assert_eq!(pool.elementary_stripes.len(), 3);
        assert_eq!(pool.elementary_stripes[0].slices.len(), 1);
        assert_eq!(pool.elementary_stripes[1].slices.len(), 1);
        assert_eq!(pool.elementary_stripes[2].slices.len(), 2);

        // Counters stay pegged to the original statistics.
        assert_eq!(pool.output(0).total_data_weight(), 300);
    }

    #[test]
    fn lost_run_returns_to_pending() {
        let mut pool = ShuffleChunkPool::new(1, 100);
        pool.add(partitioned_stripe(1, &[(600, 6)])).unwrap();
        pool.finish();

        let mut output = pool.output(0);
        let cookie = output.extract().unwrap();
        output.completed(cookie).unwrap();
        assert!(output.is_completed());

        output.lost(cookie).unwrap();
        assert!(!output.is_completed());
        assert_eq!(output.pending_job_count(), 1);
        assert_eq!(output.extract(), Some(cookie));
    }
}
