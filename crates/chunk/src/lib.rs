mod id;
pub use id::{ChunkId, ChunkTreeId, NodeId};

pub mod key;
pub use key::{Key, KeyError, Value};

mod slice;
pub use slice::{
    BoundaryKeys, ChunkReplica, ChunkSlice, ErasureCodec, InputChunk, PartitionStatistics,
    ReadLimit,
};

mod stripe;
pub use stripe::{
    add_stripe_to_list, aggregate_statistics, ChunkStripe, ChunkStripeList, StripeStatistics,
    APPROXIMATE_SIZES_BOOST_FACTOR,
};

mod stream;
pub use stream::{InputStreamDescriptor, InputStreamDirectory};

use std::collections::HashMap;

/// NodeDescriptor is the resolved identity of a cluster node
/// holding chunk replicas.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeDescriptor {
    pub address: String,
}

/// NodeDirectory resolves replica node ids into node descriptors.
/// It is owned by the host and shared with every pool of an operation.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeDirectory {
    descriptors: HashMap<NodeId, NodeDescriptor>,
}

impl NodeDirectory {
    pub fn insert(&mut self, id: NodeId, address: impl Into<String>) {
        self.descriptors.insert(
            id,
            NodeDescriptor {
                address: address.into(),
            },
        );
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.descriptors.get(&id)
    }
}
