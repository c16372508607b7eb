use crate::{
    InputCookie, OutputCookie, PoolError, PoolInput, PoolOutput, ProgressCounter,
    SuspendableStripe,
};
use chunk::{add_stripe_to_list, ChunkStripeList, ChunkStripe, NodeDirectory, StripeStatistics};
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;

#[derive(Default)]
struct LocalityEntry {
    /// The total locality associated with this address.
    locality: i64,

    /// Stripes having positive locality at this address, with replica
    /// multiplicity: several replicas of one chunk may reside on one node,
    /// and their appearance must not corrupt the index.
    stripes: IndexMap<usize, usize>,
}

struct ExtractedEntry {
    list: Arc<ChunkStripeList>,
    stripe_indices: Vec<usize>,
}

/// UnorderedChunkPool cuts a stream of stripes into N locality-aware jobs
/// of approximately equal data weight. Order is irrelevant.
pub struct UnorderedChunkPool {
    node_directory: Arc<NodeDirectory>,
    finished: bool,

    stripes: Vec<SuspendableStripe>,

    pending_global: IndexSet<usize>,
    pending_local: IndexMap<String, LocalityEntry>,

    cookie_generator: i32,
    extracted: IndexMap<i32, ExtractedEntry>,

    lost_cookies: IndexSet<i32>,
    replay_cookies: IndexSet<i32>,

    job_counter: ProgressCounter,
    data_weight_counter: ProgressCounter,
    row_counter: ProgressCounter,
}

impl UnorderedChunkPool {
    pub fn new(node_directory: Arc<NodeDirectory>, job_count: i64) -> Self {
        Self {
            node_directory,
            finished: false,
            stripes: Vec::new(),
            pending_global: IndexSet::new(),
            pending_local: IndexMap::new(),
            cookie_generator: 0,
            extracted: IndexMap::new(),
            lost_cookies: IndexSet::new(),
            replay_cookies: IndexSet::new(),
            job_counter: ProgressCounter::new(job_count),
            data_weight_counter: ProgressCounter::default(),
            row_counter: ProgressCounter::default(),
        }
    }

    pub fn job_counter(&self) -> &ProgressCounter {
        &self.job_counter
    }

    fn register(&mut self, index: usize) {
        let stripe = self.stripes[index].stripe().clone();
        for slice in &stripe.slices {
            for replica in &slice.chunk().replicas {
                let Some(descriptor) = self.node_directory.get(replica.node_id) else {
                    continue;
                };
                let entry = self
                    .pending_local
                    .entry(descriptor.address.clone())
                    .or_default();
                *entry.stripes.entry(index).or_default() += 1;
                entry.locality += slice.locality(replica.replica_index);
            }
        }

        let inserted = self.pending_global.insert(index);
        assert!(inserted, "stripe {index} is already registered");
    }

    fn unregister(&mut self, index: usize) {
        let stripe = self.stripes[index].stripe().clone();
        for slice in &stripe.slices {
            for replica in &slice.chunk().replicas {
                let Some(descriptor) = self.node_directory.get(replica.node_id) else {
                    continue;
                };
                let entry = self
                    .pending_local
                    .get_mut(&descriptor.address)
                    .expect("locality entry must exist for a registered stripe");
                let multiplicity = entry
                    .stripes
                    .get_mut(&index)
                    .expect("stripe must be present in its locality entry");
                *multiplicity -= 1;
                if *multiplicity == 0 {
                    entry.stripes.shift_remove(&index);
                }
                entry.locality -= slice.locality(replica.replica_index);
            }
        }

        let removed = self.pending_global.shift_remove(&index);
        assert!(removed, "stripe {index} is not registered");
    }

    /// Accumulate stripes into the list until it reaches the ideal weight,
    /// then unregister everything taken.
    fn add_and_unregister(
        &mut self,
        list: &mut ChunkStripeList,
        taken: &mut Vec<usize>,
        candidates: Vec<usize>,
        address: Option<&str>,
        ideal_data_weight: i64,
    ) {
        let before = taken.len();
        for index in candidates {
            if list.total_data_weight >= ideal_data_weight {
                break;
            }
            let suspendable = &self.stripes[index];
            let stats = suspendable.statistics();
            add_stripe_to_list(
                list,
                suspendable.stripe().clone(),
                stats.data_weight,
                stats.row_count,
                &self.node_directory,
                address,
            );
            taken.push(index);
        }

        for position in before..taken.len() {
            self.unregister(taken[position]);
        }
    }

    fn reinstall(&mut self, cookie: OutputCookie) {
        if self.replay_cookies.shift_remove(&cookie.0) {
            let inserted = self.lost_cookies.insert(cookie.0);
            assert!(inserted);
            return;
        }

        let entry = self
            .extracted
            .shift_remove(&cookie.0)
            .expect("failed cookie must have an extracted list");
        for index in entry.stripe_indices {
            self.register(index);
        }
    }

    fn entry(&self, cookie: OutputCookie) -> Result<&ExtractedEntry, PoolError> {
        self.extracted
            .get(&cookie.0)
            .ok_or(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            })
    }
}

impl UnorderedChunkPool {
    pub fn save(&self, out: &mut Vec<u8>) {
        use crate::persist::{
            put_bool, put_i64, put_stripe_list, put_u32, put_usize, record, tags,
        };
        record(out, tags::UNORDERED_POOL, |out| {
            put_bool(out, self.finished);
            put_u32(out, self.stripes.len() as u32);
            for stripe in &self.stripes {
                stripe.save(out);
            }
            put_u32(out, self.pending_global.len() as u32);
            for &index in &self.pending_global {
                put_usize(out, index);
            }
            put_i64(out, self.cookie_generator as i64);
            put_u32(out, self.extracted.len() as u32);
            for (&cookie, entry) in &self.extracted {
                put_i64(out, cookie as i64);
                put_stripe_list(out, &entry.list);
                put_u32(out, entry.stripe_indices.len() as u32);
                for &index in &entry.stripe_indices {
                    put_usize(out, index);
                }
            }
            put_u32(out, self.lost_cookies.len() as u32);
            for &cookie in &self.lost_cookies {
                put_i64(out, cookie as i64);
            }
            put_u32(out, self.replay_cookies.len() as u32);
            for &cookie in &self.replay_cookies {
                put_i64(out, cookie as i64);
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
            expect_record, get_bool, get_i64, get_stripe_list, get_u32, get_usize, parse_payload,
            tags,
        };
        let payload = expect_record(input, tags::UNORDERED_POOL)?;
        parse_payload(payload, |input| {
            let finished = get_bool(input)?;
            let stripe_count = get_u32(input)?;
            let mut stripes = Vec::with_capacity(stripe_count as usize);
            for _ in 0..stripe_count {
                stripes.push(SuspendableStripe::load(input)?);
            }
            let pending_count = get_u32(input)?;
            let mut pending_indices = Vec::with_capacity(pending_count as usize);
            for _ in 0..pending_count {
                pending_indices.push(get_usize(input)?);
            }
            let cookie_generator = get_i64(input)? as i32;
            let extracted_count = get_u32(input)?;
            let mut extracted = IndexMap::with_capacity(extracted_count as usize);
            for _ in 0..extracted_count {
                let cookie = get_i64(input)? as i32;
                let list = Arc::new(get_stripe_list(input)?);
                let index_count = get_u32(input)?;
                let mut stripe_indices = Vec::with_capacity(index_count as usize);
                for _ in 0..index_count {
                    stripe_indices.push(get_usize(input)?);
                }
                extracted.insert(
                    cookie,
                    ExtractedEntry {
                        list,
                        stripe_indices,
                    },
                );
            }
            let lost_count = get_u32(input)?;
            let mut lost_cookies = IndexSet::with_capacity(lost_count as usize);
            for _ in 0..lost_count {
                lost_cookies.insert(get_i64(input)? as i32);
            }
            let replay_count = get_u32(input)?;
            let mut replay_cookies = IndexSet::with_capacity(replay_count as usize);
            for _ in 0..replay_count {
                replay_cookies.insert(get_i64(input)? as i32);
            }

            let mut pool = Self {
                node_directory,
                finished,
                stripes,
                pending_global: IndexSet::new(),
                pending_local: IndexMap::new(),
                cookie_generator,
                extracted,
                lost_cookies,
                replay_cookies,
                job_counter: ProgressCounter::load(input)?,
                data_weight_counter: ProgressCounter::load(input)?,
                row_counter: ProgressCounter::load(input)?,
            };
            // The locality index is derived state; re-register the pending
            // stripes to rebuild it.
            for index in pending_indices {
                pool.register(index);
            }
            Ok(pool)
        })
    }
}

impl PoolInput for UnorderedChunkPool {
    fn add(&mut self, stripe: Arc<ChunkStripe>) -> Result<InputCookie, PoolError> {
        if self.finished {
            return Err(PoolError::AddAfterFinish);
        }

        let cookie = InputCookie(self.stripes.len() as i32);
        let suspendable = SuspendableStripe::new(stripe);

        self.data_weight_counter
            .increment(suspendable.statistics().data_weight);
        self.row_counter.increment(suspendable.statistics().row_count);
        self.stripes.push(suspendable);

        self.register(cookie.0 as usize);

        Ok(cookie)
    }

    // No stable input-cookie semantics survive partitioning: inputs are
    // dissolved into job-sized bundles at extraction time.
    fn suspend(&mut self, _cookie: InputCookie) -> Result<(), PoolError> {
        Err(PoolError::SuspendUnsupported("unordered"))
    }

    fn resume(&mut self, _cookie: InputCookie, _stripe: Arc<ChunkStripe>) -> Result<(), PoolError> {
        Err(PoolError::SuspendUnsupported("unordered"))
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl PoolOutput for UnorderedChunkPool {
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
        self.finished
            && self.lost_cookies.is_empty()
            && self.pending_global.is_empty()
            && self.job_counter.running() == 0
    }

    fn total_job_count(&self) -> i64 {
        if self.is_completed() {
            self.job_counter.get_completed()
        } else {
            self.job_counter.total()
        }
    }

    fn pending_job_count(&self) -> i64 {
        // Pending data can run out while the job counter still indicates
        // pending jobs: workload partitioning is uneven and the pool may
        // start fewer jobs than suggested.
        if self.lost_cookies.is_empty() && self.pending_global.is_empty() {
            0
        } else {
            self.job_counter.pending()
        }
    }

    fn approximate_stripe_statistics(&self) -> Vec<StripeStatistics> {
        if let Some((_cookie, entry)) = self.extracted.first() {
            return entry.list.statistics();
        }

        let pending_jobs = self.pending_job_count().max(1);
        let total_jobs = self.total_job_count().max(1);
        // Typically the unordered pool has one chunk per stripe.
        vec![StripeStatistics {
            chunk_count: (self.pending_global.len() as i64 / pending_jobs).max(1),
            data_weight: (self.pending_data_weight() / pending_jobs).max(1),
            row_count: (self.total_row_count() / total_jobs).max(1),
        }]
    }

    fn locality(&self, address: &str) -> i64 {
        self.pending_local
            .get(address)
            .map(|entry| entry.locality)
            .unwrap_or(0)
    }

    fn extract(&mut self, address: Option<&str>) -> Result<Option<OutputCookie>, PoolError> {
        if !self.finished {
            return Err(PoolError::ExtractBeforeFinish);
        }
        if self.pending_job_count() == 0 {
            return Ok(None);
        }

        let (cookie, list) = if self.lost_cookies.is_empty() {
            let cookie = self.cookie_generator;
            self.cookie_generator += 1;

            let ideal_data_weight =
                (self.data_weight_counter.pending() / self.job_counter.pending()).max(1);

            let mut list = ChunkStripeList::default();
            let mut taken = Vec::new();

            // Take local stripes first.
            if let Some(address) = address {
                if let Some(entry) = self.pending_local.get(address) {
                    let candidates: Vec<usize> = entry.stripes.keys().copied().collect();
                    self.add_and_unregister(
                        &mut list,
                        &mut taken,
                        candidates,
                        Some(address),
                        ideal_data_weight,
                    );
                }
            }

            // Then non-local ones.
            let candidates: Vec<usize> = self.pending_global.iter().copied().collect();
            self.add_and_unregister(&mut list, &mut taken, candidates, address, ideal_data_weight);

            let list = Arc::new(list);
            self.extracted.insert(
                cookie,
                ExtractedEntry {
                    list: list.clone(),
                    stripe_indices: taken,
                },
            );
            (cookie, list)
        } else {
            let cookie = *self.lost_cookies.first().unwrap();
            self.lost_cookies.shift_remove(&cookie);

            let inserted = self.replay_cookies.insert(cookie);
            assert!(inserted);

            (cookie, self.entry(OutputCookie(cookie))?.list.clone())
        };

        self.job_counter.start(1);
        self.data_weight_counter.start(list.total_data_weight);
        self.row_counter.start(list.total_row_count);

        Ok(Some(OutputCookie(cookie)))
    }

    fn stripe_list(&self, cookie: OutputCookie) -> Result<Arc<ChunkStripeList>, PoolError> {
        Ok(self.entry(cookie)?.list.clone())
    }

    fn completed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let list = self.entry(cookie)?.list.clone();

        self.job_counter.completed(1);
        self.data_weight_counter.completed(list.total_data_weight);
        self.row_counter.completed(list.total_row_count);

        // Not necessarily present: only replayed cookies are tracked here.
        self.replay_cookies.shift_remove(&cookie.0);
        Ok(())
    }

    fn failed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let list = self.entry(cookie)?.list.clone();

        self.job_counter.failed(1);
        self.data_weight_counter.failed(list.total_data_weight);
        self.row_counter.failed(list.total_row_count);

        self.reinstall(cookie);
        Ok(())
    }

    fn aborted(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let list = self.entry(cookie)?.list.clone();

        self.job_counter.aborted(1);
        self.data_weight_counter.aborted(list.total_data_weight);
        self.row_counter.aborted(list.total_row_count);

        self.reinstall(cookie);
        Ok(())
    }

    fn lost(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        let entry = self
            .extracted
            .get_mut(&cookie.0)
            .ok_or(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            })?;

        // No need to respect locality for restarted jobs: the replicas
        // backing the original placement are gone.
        let list = Arc::make_mut(&mut entry.list);
        list.non_local_chunk_count += list.local_chunk_count;
        list.local_chunk_count = 0;
        let (data_weight, row_count) = (list.total_data_weight, list.total_row_count);

        self.job_counter.lost(1);
        self.data_weight_counter.lost(data_weight);
        self.row_counter.lost(row_count);

        let inserted = self.lost_cookies.insert(cookie.0);
        if !inserted {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: "lost",
                expected: "completed",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chunk::{ChunkId, ChunkReplica, ChunkSlice, ErasureCodec, InputChunk};

    fn directory() -> Arc<NodeDirectory> {
        let mut directory = NodeDirectory::default();
        directory.insert(1, "node-y");
        Arc::new(directory)
    }

    fn stripe(seq: u64, data_weight: i64) -> Arc<ChunkStripe> {
        Arc::new(ChunkStripe::from_slice(ChunkSlice::whole(Arc::new(
            InputChunk {
                id: ChunkId::from_parts(3, seq),
                input_stream_index: 0,
                uncompressed_data_size: data_weight,
                compressed_data_size: data_weight,
                data_weight,
                row_count: 10,
                boundary_keys: None,
                replicas: vec![ChunkReplica {
                    node_id: 1,
                    replica_index: 0,
                }],
                erasure_codec: ErasureCodec::None,
                partitions: None,
            },
        ))))
    }

    fn pool_with_eight_stripes() -> UnorderedChunkPool {
        let mut pool = UnorderedChunkPool::new(directory(), 4);
        for seq in 0..8 {
            pool.add(stripe(seq, 100)).unwrap();
        }
        pool.finish();
        pool
    }

    #[test]
    fn extraction_balances_data_weight() {
        let mut pool = pool_with_eight_stripes();
        assert_eq!(pool.pending_job_count(), 4);
        assert_eq!(pool.locality("node-y"), 800);

        for _ in 0..4 {
            let cookie = pool.extract(Some("node-y")).unwrap().unwrap();
            let list = pool.stripe_list(cookie).unwrap();
            assert_eq!(list.total_data_weight, 200);
            assert_eq!(list.stripes.len(), 2);
            assert_eq!(list.local_chunk_count, 2);
        }
        assert_eq!(pool.pending_job_count(), 0);
        assert_eq!(pool.locality("node-y"), 0);
    }

    // Scenario: lost job replays under the same cookie with identical
    // contents but reset locality.
    #[test]
    fn lost_cookie_replays_identically() {
        let mut pool = pool_with_eight_stripes();

        let c1 = pool.extract(Some("node-y")).unwrap().unwrap();
        let c2 = pool.extract(Some("node-y")).unwrap().unwrap();
        let _c3 = pool.extract(Some("node-y")).unwrap().unwrap();
        let _c4 = pool.extract(Some("node-y")).unwrap().unwrap();

        let first = pool.stripe_list(c1).unwrap();
        let first_stripes = first.stripes.clone();

        pool.completed(c1).unwrap();
        pool.completed(c2).unwrap();
        pool.lost(c1).unwrap();

        assert_eq!(pool.pending_job_count(), 1);

        let replayed = pool.extract(Some("node-y")).unwrap().unwrap();
        assert_eq!(replayed, c1);

        let list = pool.stripe_list(replayed).unwrap();
        assert_eq!(list.stripes, first_stripes);
        assert_eq!(list.local_chunk_count, 0);
        assert_eq!(list.non_local_chunk_count, 2);
    }

    #[test]
    fn failed_job_returns_stripes_to_the_pending_set() {
        let mut pool = pool_with_eight_stripes();

        let cookie = pool.extract(None).unwrap().unwrap();
        assert_eq!(pool.pending_global_len(), 6);

        pool.failed(cookie).unwrap();
        assert_eq!(pool.pending_global_len(), 8);
        assert_eq!(pool.job_counter().get_failed(), 1);
        assert_eq!(pool.pending_data_weight(), 800);
    }

    #[test]
    fn suspend_is_rejected() {
        let mut pool = UnorderedChunkPool::new(directory(), 1);
        let cookie = pool.add(stripe(0, 100)).unwrap();
        assert!(matches!(
            pool.suspend(cookie),
            Err(PoolError::SuspendUnsupported("unordered"))
        ));
    }

    #[test]
    fn completion_drains_the_pool() {
        let mut pool = pool_with_eight_stripes();
        let mut cookies = Vec::new();
        while let Some(cookie) = pool.extract(None).unwrap() {
            cookies.push(cookie);
        }
        assert!(!pool.is_completed());
        for cookie in cookies {
            pool.completed(cookie).unwrap();
        }
        assert!(pool.is_completed());
        assert_eq!(pool.total_job_count(), 4);
    }
}

#[cfg(test)]
impl UnorderedChunkPool {
    fn pending_global_len(&self) -> usize {
        self.pending_global.len()
    }
}
