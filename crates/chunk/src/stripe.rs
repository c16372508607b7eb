use crate::{ChunkSlice, NodeDirectory};
use std::sync::Arc;

/// Multiplier applied to approximate statistics so that estimates stay
/// upper bounds.
pub const APPROXIMATE_SIZES_BOOST_FACTOR: i64 = 2;

/// Aggregate sizes of one stripe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct StripeStatistics {
    pub chunk_count: i64,
    pub data_weight: i64,
    pub row_count: i64,
}

impl std::ops::Add for StripeStatistics {
    type Output = StripeStatistics;
    fn add(self, rhs: StripeStatistics) -> StripeStatistics {
        StripeStatistics {
            chunk_count: self.chunk_count + rhs.chunk_count,
            data_weight: self.data_weight + rhs.data_weight,
            row_count: self.row_count + rhs.row_count,
        }
    }
}

impl std::ops::AddAssign for StripeStatistics {
    fn add_assign(&mut self, rhs: StripeStatistics) {
        self.chunk_count += rhs.chunk_count;
        self.data_weight += rhs.data_weight;
        self.row_count += rhs.row_count;
    }
}

/// Adds up input statistics and returns a single-item vector with the sum.
pub fn aggregate_statistics(statistics: &[StripeStatistics]) -> Vec<StripeStatistics> {
    let mut sum = StripeStatistics::default();
    for stat in statistics {
        sum += *stat;
    }
    vec![sum]
}

/// ChunkStripe is an ordered sequence of slices belonging to one input
/// stream, handed to a job as a unit.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkStripe {
    pub slices: Vec<ChunkSlice>,
}

impl ChunkStripe {
    pub fn new(slices: Vec<ChunkSlice>) -> Self {
        Self { slices }
    }

    pub fn from_slice(slice: ChunkSlice) -> Self {
        Self {
            slices: vec![slice],
        }
    }

    pub fn statistics(&self) -> StripeStatistics {
        let mut result = StripeStatistics::default();
        for slice in &self.slices {
            result.chunk_count += 1;
            result.data_weight += slice.data_weight();
            result.row_count += slice.row_count();
        }
        result
    }
}

/// ChunkStripeList is the per-job aggregate of stripes plus counters.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkStripeList {
    pub stripes: Vec<Arc<ChunkStripe>>,

    pub partition_tag: Option<usize>,

    /// If set then the totals are approximate (and hopefully upper bounds).
    pub is_approximate: bool,

    pub total_data_weight: i64,
    pub total_row_count: i64,

    pub total_chunk_count: i64,
    pub local_chunk_count: i64,
    pub non_local_chunk_count: i64,
}

impl ChunkStripeList {
    pub fn statistics(&self) -> Vec<StripeStatistics> {
        self.stripes.iter().map(|s| s.statistics()).collect()
    }

    pub fn aggregate_statistics(&self) -> StripeStatistics {
        let (data_weight, row_count) = if self.is_approximate {
            (
                self.total_data_weight * APPROXIMATE_SIZES_BOOST_FACTOR,
                self.total_row_count * APPROXIMATE_SIZES_BOOST_FACTOR,
            )
        } else {
            (self.total_data_weight, self.total_row_count)
        };
        StripeStatistics {
            chunk_count: self.total_chunk_count,
            data_weight,
            row_count,
        }
    }
}

/// Append a stripe to a job's list, folding its sizes into the totals and
/// classifying each chunk as local or non-local for `address`.
pub fn add_stripe_to_list(
    list: &mut ChunkStripeList,
    stripe: Arc<ChunkStripe>,
    stripe_data_weight: i64,
    stripe_row_count: i64,
    node_directory: &NodeDirectory,
    address: Option<&str>,
) {
    list.total_data_weight += stripe_data_weight;
    list.total_row_count += stripe_row_count;
    list.total_chunk_count += stripe.slices.len() as i64;

    match address {
        Some(address) => {
            for slice in &stripe.slices {
                let is_local = slice.chunk().replicas.iter().any(|replica| {
                    node_directory
                        .get(replica.node_id)
                        .map(|descriptor| descriptor.address == address)
                        .unwrap_or(false)
                        && slice.locality(replica.replica_index) > 0
                });
                if is_local {
                    list.local_chunk_count += 1;
                } else {
                    list.non_local_chunk_count += 1;
                }
            }
        }
        None => {
            list.non_local_chunk_count += stripe.slices.len() as i64;
        }
    }

    list.stripes.push(stripe);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ChunkId, ChunkReplica, ErasureCodec, InputChunk};
    use pretty_assertions::assert_eq;

    fn chunk_at(node_id: u32, data_weight: i64) -> Arc<InputChunk> {
        Arc::new(InputChunk {
            id: ChunkId::from_parts(0, node_id as u64),
            input_stream_index: 0,
            uncompressed_data_size: data_weight,
            compressed_data_size: data_weight,
            data_weight,
            row_count: 10,
            boundary_keys: None,
            replicas: vec![ChunkReplica {
                node_id,
                replica_index: 0,
            }],
            erasure_codec: ErasureCodec::None,
            partitions: None,
        })
    }

    #[test]
    fn statistics_aggregate() {
        let stripe = ChunkStripe::new(vec![
            ChunkSlice::whole(chunk_at(1, 100)),
            ChunkSlice::whole(chunk_at(2, 200)),
        ]);
        let stats = stripe.statistics();
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.data_weight, 300);
        assert_eq!(stats.row_count, 20);

        let folded = aggregate_statistics(&[stats, stats]);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].data_weight, 600);
    }

    #[test]
    fn locality_classification() {
        let mut directory = NodeDirectory::default();
        directory.insert(1, "node-a");
        directory.insert(2, "node-b");

        let stripe = Arc::new(ChunkStripe::new(vec![
            ChunkSlice::whole(chunk_at(1, 100)),
            ChunkSlice::whole(chunk_at(2, 200)),
        ]));
        let stats = stripe.statistics();

        let mut list = ChunkStripeList::default();
        add_stripe_to_list(
            &mut list,
            stripe,
            stats.data_weight,
            stats.row_count,
            &directory,
            Some("node-a"),
        );

        assert_eq!(list.local_chunk_count, 1);
        assert_eq!(list.non_local_chunk_count, 1);
        assert_eq!(list.total_data_weight, 300);
    }

    #[test]
    fn approximate_statistics_are_boosted() {
        let mut list = ChunkStripeList {
            total_data_weight: 100,
            total_row_count: 10,
            total_chunk_count: 1,
            ..Default::default()
        };
        assert_eq!(list.aggregate_statistics().data_weight, 100);

        list.is_approximate = true;
        assert_eq!(list.aggregate_statistics().data_weight, 200);
        assert_eq!(list.aggregate_statistics().row_count, 20);
    }
}
