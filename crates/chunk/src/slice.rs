use crate::{ChunkId, Key, NodeId};
use std::sync::Arc;

/// ErasureCodec describes how a chunk's parts are encoded.
/// Only data parts carry rows and participate in locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErasureCodec {
    None,
    ReedSolomon { data_parts: u32, parity_parts: u32 },
}

impl ErasureCodec {
    pub fn data_part_count(&self) -> u32 {
        match self {
            ErasureCodec::None => 1,
            ErasureCodec::ReedSolomon { data_parts, .. } => *data_parts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BoundaryKeys {
    pub min: Key,
    pub max: Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChunkReplica {
    pub node_id: NodeId,
    pub replica_index: u32,
}

/// Per-partition sizes read from a partitioned chunk's statistics
/// extension, consumed by the shuffle pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionStatistics {
    pub data_weight: i64,
    pub row_count: i64,
}

/// InputChunk is an immutable reference to one stored chunk.
/// It is shared by every slice cut from it and never mutated.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InputChunk {
    pub id: ChunkId,
    pub input_stream_index: usize,
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    pub data_weight: i64,
    pub row_count: i64,
    pub boundary_keys: Option<BoundaryKeys>,
    pub replicas: Vec<ChunkReplica>,
    pub erasure_codec: ErasureCodec,
    /// Partition statistics extension; present only on chunks produced by
    /// a partitioning phase, stripped once the shuffle pool consumes it.
    pub partitions: Option<Vec<PartitionStatistics>>,
}

impl InputChunk {
    /// Whether this chunk may be committed to the output verbatim when
    /// chunk combining is requested: combining small chunks is the point,
    /// so only chunks already at the desired size skip the job.
    pub fn is_large_complete_chunk(&self, desired_chunk_size: i64) -> bool {
        self.uncompressed_data_size >= desired_chunk_size
    }

    /// A copy with the partition statistics extension dropped.
    pub fn without_partitions(&self) -> InputChunk {
        InputChunk {
            partitions: None,
            ..self.clone()
        }
    }
}

/// ReadLimit bounds one end of a slice: by row index, by key, or both.
/// Lower limits are inclusive and upper limits exclusive; key exclusivity
/// at finer grain is expressed through sentinel successors.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReadLimit {
    pub row_index: Option<i64>,
    pub key: Option<Key>,
}

impl ReadLimit {
    pub fn is_trivial(&self) -> bool {
        self.row_index.is_none() && self.key.is_none()
    }
}

/// ChunkSlice is a half-open view into a chunk, carrying data-weight and
/// row-count overrides for the covered portion.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkSlice {
    chunk: Arc<InputChunk>,
    pub lower_limit: ReadLimit,
    pub upper_limit: ReadLimit,
    data_weight_override: i64,
    row_count_override: i64,
    /// Set when this slice covers a single erasure data part.
    pub part_index: Option<u32>,
}

impl ChunkSlice {
    /// A slice covering the entire chunk.
    pub fn whole(chunk: Arc<InputChunk>) -> Self {
        let data_weight_override = chunk.data_weight;
        let row_count_override = chunk.row_count;
        Self {
            chunk,
            lower_limit: ReadLimit::default(),
            upper_limit: ReadLimit::default(),
            data_weight_override,
            row_count_override,
            part_index: None,
        }
    }

    /// Reassemble a slice from its stored parts, e.g. when loading a
    /// snapshot.
    pub fn from_parts(
        chunk: Arc<InputChunk>,
        lower_limit: ReadLimit,
        upper_limit: ReadLimit,
        data_weight_override: i64,
        row_count_override: i64,
        part_index: Option<u32>,
    ) -> Self {
        Self {
            chunk,
            lower_limit,
            upper_limit,
            data_weight_override,
            row_count_override,
            part_index,
        }
    }

    pub fn chunk(&self) -> &Arc<InputChunk> {
        &self.chunk
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id
    }

    pub fn input_stream_index(&self) -> usize {
        self.chunk.input_stream_index
    }

    pub fn data_weight(&self) -> i64 {
        self.data_weight_override
    }

    pub fn row_count(&self) -> i64 {
        self.row_count_override
    }

    /// Whether the slice covers its chunk completely.
    pub fn is_complete_chunk(&self) -> bool {
        self.lower_limit.is_trivial() && self.upper_limit.is_trivial() && self.part_index.is_none()
    }

    /// Effective minimum key: the tighter of the slice bound and the chunk
    /// boundary.
    pub fn min_key(&self) -> Option<&Key> {
        self.lower_limit
            .key
            .as_ref()
            .or_else(|| self.chunk.boundary_keys.as_ref().map(|b| &b.min))
    }

    /// Effective maximum key, exclusive when it came from an upper limit.
    pub fn max_key(&self) -> Option<&Key> {
        self.upper_limit
            .key
            .as_ref()
            .or_else(|| self.chunk.boundary_keys.as_ref().map(|b| &b.max))
    }

    /// Locality score this slice contributes through the given replica.
    /// Parity parts of erasure chunks hold no readable rows.
    pub fn locality(&self, replica_index: u32) -> i64 {
        match self.part_index {
            Some(part) if part != replica_index => 0,
            _ => {
                if replica_index < self.chunk.erasure_codec.data_part_count() {
                    self.data_weight_override
                } else {
                    0
                }
            }
        }
    }

    /// Split by row index into slices of roughly `target_data_weight`
    /// each. Row and weight overrides are apportioned by row share.
    pub fn slice_by_rows(&self, target_data_weight: i64) -> Vec<ChunkSlice> {
        let target = target_data_weight.max(1);
        let count = (self.data_weight_override + target - 1) / target;
        if count <= 1 {
            return vec![self.clone()];
        }

        let begin = self.lower_limit.row_index.unwrap_or(0);
        let end = self
            .upper_limit
            .row_index
            .unwrap_or(begin + self.row_count_override);
        let rows = end - begin;
        let count = count.min(rows.max(1));

        let mut slices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let row_begin = begin + rows * index / count;
            let row_end = begin + rows * (index + 1) / count;
            if row_begin == row_end {
                continue;
            }
            let share_num = row_end - row_begin;
            slices.push(ChunkSlice {
                chunk: self.chunk.clone(),
                lower_limit: ReadLimit {
                    row_index: Some(row_begin),
                    key: self.lower_limit.key.clone(),
                },
                upper_limit: ReadLimit {
                    row_index: Some(row_end),
                    key: self.upper_limit.key.clone(),
                },
                data_weight_override: (self.data_weight_override * share_num / rows).max(1),
                row_count_override: share_num,
                part_index: self.part_index,
            });
        }
        slices
    }

    /// One slice per erasure data part. Non-erasure chunks yield the slice
    /// unchanged.
    pub fn slice_by_erasure_parts(&self) -> Vec<ChunkSlice> {
        let parts = self.chunk.erasure_codec.data_part_count();
        if parts <= 1 {
            return vec![self.clone()];
        }

        (0..parts)
            .map(|part| ChunkSlice {
                chunk: self.chunk.clone(),
                lower_limit: self.lower_limit.clone(),
                upper_limit: self.upper_limit.clone(),
                data_weight_override: (self.data_weight_override / parts as i64).max(1),
                row_count_override: (self.row_count_override / parts as i64).max(1),
                part_index: Some(part),
            })
            .collect()
    }

    /// The same slice over a copy of the chunk with its partition
    /// statistics extension dropped.
    pub fn strip_partitions(&self) -> ChunkSlice {
        if self.chunk.partitions.is_none() {
            return self.clone();
        }
        ChunkSlice {
            chunk: Arc::new(self.chunk.without_partitions()),
            ..self.clone()
        }
    }

    /// Tighten key bounds to `[lower, upper)`. Bounds already tighter than
    /// the arguments are kept. Size overrides are inherited unchanged: the
    /// row distribution inside a key range is unknown at planning time.
    pub fn clip_keys(&self, lower: Option<&Key>, upper: Option<&Key>) -> ChunkSlice {
        let mut clipped = self.clone();

        if let Some(lower) = lower {
            let tighter = match &self.lower_limit.key {
                Some(current) => lower > current,
                None => true,
            };
            if tighter {
                clipped.lower_limit.key = Some(lower.clone());
            }
        }

        if let Some(upper) = upper {
            let tighter = match &self.upper_limit.key {
                Some(current) => upper < current,
                None => true,
            };
            if tighter {
                clipped.upper_limit.key = Some(upper.clone());
            }
        }

        clipped
    }
}
