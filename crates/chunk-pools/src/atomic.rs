use crate::{
    InputCookie, OutputCookie, PoolError, PoolInput, PoolOutput, ProgressCounter,
    SuspendableStripe,
};
use chunk::{add_stripe_to_list, ChunkStripe, ChunkStripeList, NodeDirectory, StripeStatistics};
use indexmap::IndexMap;
use std::sync::Arc;

/// AtomicChunkPool collects every input stripe into exactly one
/// extractable stripe list: one job consuming all inputs.
pub struct AtomicChunkPool {
    node_directory: Arc<NodeDirectory>,
    finished: bool,

    stripes: Vec<SuspendableStripe>,
    suspended_stripe_count: usize,

    address_to_locality: IndexMap<String, i64>,
    extracted_list: Option<Arc<ChunkStripeList>>,

    job_counter: ProgressCounter,
    data_weight_counter: ProgressCounter,
    row_counter: ProgressCounter,
}

impl AtomicChunkPool {
    pub fn new(node_directory: Arc<NodeDirectory>) -> Self {
        Self {
            node_directory,
            finished: false,
            stripes: Vec::new(),
            suspended_stripe_count: 0,
            address_to_locality: IndexMap::new(),
            extracted_list: None,
            job_counter: ProgressCounter::new(1),
            data_weight_counter: ProgressCounter::default(),
            row_counter: ProgressCounter::default(),
        }
    }

    pub fn job_counter(&self) -> &ProgressCounter {
        &self.job_counter
    }

    fn update_locality(&mut self, stripe: &ChunkStripe, sign: i64) {
        for slice in &stripe.slices {
            for replica in &slice.chunk().replicas {
                let Some(descriptor) = self.node_directory.get(replica.node_id) else {
                    continue;
                };
                let delta = slice.locality(replica.replica_index) * sign;
                *self
                    .address_to_locality
                    .entry(descriptor.address.clone())
                    .or_default() += delta;
            }
        }
    }
}

impl AtomicChunkPool {
    pub fn save(&self, out: &mut Vec<u8>) {
        use crate::persist::{
            put_bool, put_i64, put_option, put_str, put_stripe_list, put_u32, put_usize, record,
            tags,
        };
        record(out, tags::ATOMIC_POOL, |out| {
            put_bool(out, self.finished);
            put_usize(out, self.suspended_stripe_count);
            put_u32(out, self.stripes.len() as u32);
            for stripe in &self.stripes {
                stripe.save(out);
            }
            put_u32(out, self.address_to_locality.len() as u32);
            for (address, locality) in &self.address_to_locality {
                put_str(out, address);
                put_i64(out, *locality);
            }
            put_option(out, self.extracted_list.as_deref(), |out, list| {
                put_stripe_list(out, list)
            });
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
            expect_record, get_bool, get_i64, get_option, get_str, get_stripe_list, get_u32,
            get_usize, parse_payload, tags,
        };
        let payload = expect_record(input, tags::ATOMIC_POOL)?;
        parse_payload(payload, |input| {
            let finished = get_bool(input)?;
            let suspended_stripe_count = get_usize(input)?;
            let stripe_count = get_u32(input)?;
            let mut stripes = Vec::with_capacity(stripe_count as usize);
            for _ in 0..stripe_count {
                stripes.push(SuspendableStripe::load(input)?);
            }
            let locality_count = get_u32(input)?;
            let mut address_to_locality = IndexMap::with_capacity(locality_count as usize);
            for _ in 0..locality_count {
                let address = get_str(input)?;
                address_to_locality.insert(address, get_i64(input)?);
            }
            let extracted_list =
                get_option(input, |input| Ok(Arc::new(get_stripe_list(input)?)))?;
            Ok(Self {
                node_directory,
                finished,
                stripes,
                suspended_stripe_count,
                address_to_locality,
                extracted_list,
                job_counter: ProgressCounter::load(input)?,
                data_weight_counter: ProgressCounter::load(input)?,
                row_counter: ProgressCounter::load(input)?,
            })
        })
    }
}

impl PoolInput for AtomicChunkPool {
    fn add(&mut self, stripe: Arc<ChunkStripe>) -> Result<InputCookie, PoolError> {
        if self.finished {
            return Err(PoolError::AddAfterFinish);
        }
        assert!(self.extracted_list.is_none());

        let cookie = InputCookie(self.stripes.len() as i32);
        let suspendable = SuspendableStripe::new(stripe.clone());

        self.data_weight_counter
            .increment(suspendable.statistics().data_weight);
        self.row_counter.increment(suspendable.statistics().row_count);
        self.stripes.push(suspendable);

        self.update_locality(&stripe, 1);

        Ok(cookie)
    }

    fn suspend(&mut self, cookie: InputCookie) -> Result<(), PoolError> {
        let index = cookie.0 as usize;
        if index >= self.stripes.len() {
            return Err(PoolError::UnknownCookie {
                kind: "input",
                cookie: cookie.0,
            });
        }
        if self.stripes[index].is_suspended() {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: "suspended",
                expected: "resumed",
            });
        }

        self.suspended_stripe_count += 1;
        self.stripes[index].suspend();
        let stripe = self.stripes[index].stripe().clone();
        self.update_locality(&stripe, -1);
        Ok(())
    }

    fn resume(&mut self, cookie: InputCookie, stripe: Arc<ChunkStripe>) -> Result<(), PoolError> {
        let index = cookie.0 as usize;
        if index >= self.stripes.len() {
            return Err(PoolError::UnknownCookie {
                kind: "input",
                cookie: cookie.0,
            });
        }
        if !self.stripes[index].is_suspended() {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: "resumed",
                expected: "suspended",
            });
        }

        self.stripes[index].resume(stripe.clone());
        self.suspended_stripe_count -= 1;
        self.update_locality(&stripe, 1);
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl PoolOutput for AtomicChunkPool {
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
        self.finished && self.job_counter.get_completed() == 1
    }

    fn total_job_count(&self) -> i64 {
        1
    }

    fn pending_job_count(&self) -> i64 {
        if self.finished && self.suspended_stripe_count == 0 && self.job_counter.pending() == 1 {
            1
        } else {
            0
        }
    }

    fn approximate_stripe_statistics(&self) -> Vec<StripeStatistics> {
        self.stripes
            .iter()
            .map(|suspendable| suspendable.stripe().statistics())
            .collect()
    }

    fn locality(&self, address: &str) -> i64 {
        if self.extracted_list.is_some() {
            return 0;
        }
        self.address_to_locality
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    fn extract(&mut self, address: Option<&str>) -> Result<Option<OutputCookie>, PoolError> {
        if !self.finished {
            return Err(PoolError::ExtractBeforeFinish);
        }
        if self.suspended_stripe_count > 0 {
            return Err(PoolError::ExtractWithSuspendedStripes(
                self.suspended_stripe_count,
            ));
        }
        if self.pending_job_count() == 0 {
            return Ok(None);
        }

        let mut list = ChunkStripeList::default();
        for suspendable in &self.stripes {
            let stripe = suspendable.stripe().clone();
            let stats = stripe.statistics();
            add_stripe_to_list(
                &mut list,
                stripe,
                stats.data_weight,
                stats.row_count,
                &self.node_directory,
                address,
            );
        }
        self.extracted_list = Some(Arc::new(list));

        self.job_counter.start(1);
        self.data_weight_counter
            .start(self.data_weight_counter.total());
        self.row_counter.start(self.row_counter.total());

        Ok(Some(OutputCookie(0)))
    }

    fn stripe_list(&self, cookie: OutputCookie) -> Result<Arc<ChunkStripeList>, PoolError> {
        if cookie.0 != 0 {
            return Err(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            });
        }
        self.extracted_list
            .clone()
            .ok_or(PoolError::CookieState {
                cookie: cookie.0,
                actual: "idle",
                expected: "running",
            })
    }

    fn completed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.take_running(cookie)?;
        self.job_counter.completed(1);
        self.data_weight_counter
            .completed(self.data_weight_counter.total());
        self.row_counter.completed(self.row_counter.total());
        Ok(())
    }

    fn failed(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.take_running(cookie)?;
        self.job_counter.failed(1);
        self.data_weight_counter
            .failed(self.data_weight_counter.total());
        self.row_counter.failed(self.row_counter.total());
        Ok(())
    }

    fn aborted(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        self.take_running(cookie)?;
        self.job_counter.aborted(1);
        self.data_weight_counter
            .aborted(self.data_weight_counter.total());
        self.row_counter.aborted(self.row_counter.total());
        Ok(())
    }

    fn lost(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        if cookie.0 != 0 {
            return Err(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            });
        }
        if self.extracted_list.is_some() || !self.finished {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: "running",
                expected: "completed",
            });
        }

        self.job_counter.lost(1);
        self.data_weight_counter.lost(self.data_weight_counter.total());
        self.row_counter.lost(self.row_counter.total());
        Ok(())
    }
}

impl AtomicChunkPool {
    fn take_running(&mut self, cookie: OutputCookie) -> Result<(), PoolError> {
        if cookie.0 != 0 {
            return Err(PoolError::UnknownCookie {
                kind: "output",
                cookie: cookie.0,
            });
        }
        if !self.finished || self.extracted_list.is_none() {
            return Err(PoolError::CookieState {
                cookie: cookie.0,
                actual: "idle",
                expected: "running",
            });
        }
        self.extracted_list = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chunk::{ChunkId, ChunkReplica, ChunkSlice, ErasureCodec, InputChunk};

    fn directory() -> Arc<NodeDirectory> {
        let mut directory = NodeDirectory::default();
        directory.insert(1, "node-x");
        directory.insert(2, "node-y");
        Arc::new(directory)
    }

    fn stripe(node_id: u32, data_weight: i64) -> Arc<ChunkStripe> {
        Arc::new(ChunkStripe::from_slice(ChunkSlice::whole(Arc::new(
            InputChunk {
                id: ChunkId::from_parts(7, node_id as u64),
                input_stream_index: 0,
                uncompressed_data_size: data_weight,
                compressed_data_size: data_weight,
                data_weight,
                row_count: 100,
                boundary_keys: None,
                replicas: vec![ChunkReplica {
                    node_id,
                    replica_index: 0,
                }],
                erasure_codec: ErasureCodec::None,
                partitions: None,
            },
        ))))
    }

    // Scenario: two stripes, one job, completed on nodeX.
    #[test]
    fn single_job_lifecycle() {
        let mut pool = AtomicChunkPool::new(directory());

        pool.add(stripe(1, 100)).unwrap();
        pool.add(stripe(2, 200)).unwrap();

        assert_eq!(pool.pending_job_count(), 0); // not finished yet
        pool.finish();
        assert_eq!(pool.total_job_count(), 1);
        assert_eq!(pool.pending_job_count(), 1);
        assert_eq!(pool.locality("node-x"), 100);
        assert_eq!(pool.locality("node-y"), 200);

        let cookie = pool.extract(Some("node-x")).unwrap().unwrap();
        let list = pool.stripe_list(cookie).unwrap();
        assert_eq!(list.stripes.len(), 2);
        assert_eq!(list.total_data_weight, 300);
        assert_eq!(list.local_chunk_count, 1);
        assert_eq!(list.non_local_chunk_count, 1);
        assert_eq!(pool.locality("node-x"), 0); // extracted

        pool.completed(cookie).unwrap();
        assert!(pool.is_completed());
        assert_eq!(pool.job_counter().get_completed(), 1);
        assert_eq!(pool.completed_data_weight(), 300);
    }

    #[test]
    fn add_after_finish_fails() {
        let mut pool = AtomicChunkPool::new(directory());
        pool.finish();
        assert!(matches!(
            pool.add(stripe(1, 10)),
            Err(PoolError::AddAfterFinish)
        ));
    }

    #[test]
    fn failed_job_is_re_extractable_with_same_contents() {
        let mut pool = AtomicChunkPool::new(directory());
        pool.add(stripe(1, 100)).unwrap();
        pool.finish();

        let cookie = pool.extract(Some("node-x")).unwrap().unwrap();
        let first = pool.stripe_list(cookie).unwrap();
        pool.failed(cookie).unwrap();

        assert_eq!(pool.pending_job_count(), 1);
        let again = pool.extract(Some("node-x")).unwrap().unwrap();
        assert_eq!(again, cookie);
        assert_eq!(*pool.stripe_list(again).unwrap(), *first);
    }

    #[test]
    fn lost_after_completion_replays() {
        let mut pool = AtomicChunkPool::new(directory());
        pool.add(stripe(1, 100)).unwrap();
        pool.finish();

        let cookie = pool.extract(None).unwrap().unwrap();
        pool.completed(cookie).unwrap();
        assert!(pool.is_completed());

        pool.lost(cookie).unwrap();
        assert!(!pool.is_completed());
        assert_eq!(pool.pending_job_count(), 1);
        assert_eq!(pool.extract(None).unwrap(), Some(cookie));
    }

    #[test]
    fn suspend_blocks_extraction() {
        let mut pool = AtomicChunkPool::new(directory());
        let cookie = pool.add(stripe(1, 100)).unwrap();
        pool.finish();

        pool.suspend(cookie).unwrap();
        assert_eq!(pool.pending_job_count(), 0);
        assert_eq!(pool.locality("node-x"), 0);
        assert!(matches!(
            pool.extract(None),
            Err(PoolError::ExtractWithSuspendedStripes(1))
        ));

        pool.resume(cookie, stripe(1, 100)).unwrap();
        assert_eq!(pool.pending_job_count(), 1);
        assert_eq!(pool.locality("node-x"), 100);
    }
}
