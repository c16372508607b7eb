//! Snapshot codec for operation revival.
//!
//! The on-disk layout is a sequence of tagged records:
//!
//! ```text
//! record := tag(u32) length(u32) payload
//! ```
//!
//! with little-endian scalars and entity fields laid out in declared
//! order. Keys and slice limits carry their full row representation so a
//! revived controller resolves nothing against external state.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chunk::{
    BoundaryKeys, ChunkId, ChunkReplica, ChunkSlice, ChunkStripe, ChunkStripeList, ChunkTreeId,
    ErasureCodec, InputChunk, Key, PartitionStatistics, ReadLimit, Value,
};
use std::io::Read;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("unexpected end of snapshot")]
    UnexpectedEof,
    #[error("unknown discriminator {0} in snapshot record")]
    UnknownDiscriminator(u32),
    #[error("record tag {actual} where tag {expected} was expected")]
    TagMismatch { actual: u32, expected: u32 },
    #[error("trailing bytes in snapshot record")]
    TrailingBytes,
    #[error("invalid utf-8 string in snapshot")]
    InvalidString,
}

/// Entity-kind discriminators of the snapshot format.
pub mod tags {
    pub const COUNTER: u32 = 1;
    pub const KEY: u32 = 2;
    pub const CHUNK: u32 = 3;
    pub const SLICE: u32 = 4;
    pub const STRIPE: u32 = 5;
    pub const STRIPE_LIST: u32 = 6;
    pub const SUSPENDABLE_STRIPE: u32 = 7;
    pub const OUTPUT_ORDER: u32 = 8;
    pub const ATOMIC_POOL: u32 = 9;
    pub const UNORDERED_POOL: u32 = 10;
    pub const SHUFFLE_POOL: u32 = 11;
    pub const SORTED_POOL: u32 = 12;
}

pub fn record(out: &mut Vec<u8>, tag: u32, body: impl FnOnce(&mut Vec<u8>)) {
    let mut payload = Vec::new();
    body(&mut payload);

    out.write_u32::<LittleEndian>(tag).unwrap();
    out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    out.extend_from_slice(&payload);
}

/// Consume one record, check its tag, and return its payload.
pub fn expect_record<'a>(input: &mut &'a [u8], tag: u32) -> Result<&'a [u8], PersistError> {
    let actual = get_u32(input)?;
    if actual != tag {
        return Err(PersistError::TagMismatch {
            actual,
            expected: tag,
        });
    }
    let length = get_u32(input)? as usize;
    if input.len() < length {
        return Err(PersistError::UnexpectedEof);
    }
    let (payload, rest) = input.split_at(length);
    *input = rest;
    Ok(payload)
}

/// Parse an entire record payload, rejecting trailing bytes.
pub fn parse_payload<T>(
    mut payload: &[u8],
    body: impl FnOnce(&mut &[u8]) -> Result<T, PersistError>,
) -> Result<T, PersistError> {
    let parsed = body(&mut payload)?;
    if !payload.is_empty() {
        return Err(PersistError::TrailingBytes);
    }
    Ok(parsed)
}

// Scalar helpers.

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.write_u32::<LittleEndian>(value).unwrap();
}

pub fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.write_i64::<LittleEndian>(value).unwrap();
}

pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.write_u64::<LittleEndian>(value).unwrap();
}

pub fn put_f64(out: &mut Vec<u8>, value: f64) {
    out.write_f64::<LittleEndian>(value).unwrap();
}

pub fn put_usize(out: &mut Vec<u8>, value: usize) {
    put_u64(out, value as u64);
}

pub fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.push(value as u8);
}

pub fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

pub fn put_option<T>(out: &mut Vec<u8>, value: Option<&T>, body: impl FnOnce(&mut Vec<u8>, &T)) {
    match value {
        Some(value) => {
            put_bool(out, true);
            body(out, value);
        }
        None => put_bool(out, false),
    }
}

pub fn get_u32(input: &mut &[u8]) -> Result<u32, PersistError> {
    input
        .read_u32::<LittleEndian>()
        .map_err(|_| PersistError::UnexpectedEof)
}

pub fn get_i64(input: &mut &[u8]) -> Result<i64, PersistError> {
    input
        .read_i64::<LittleEndian>()
        .map_err(|_| PersistError::UnexpectedEof)
}

pub fn get_u64(input: &mut &[u8]) -> Result<u64, PersistError> {
    input
        .read_u64::<LittleEndian>()
        .map_err(|_| PersistError::UnexpectedEof)
}

pub fn get_f64(input: &mut &[u8]) -> Result<f64, PersistError> {
    input
        .read_f64::<LittleEndian>()
        .map_err(|_| PersistError::UnexpectedEof)
}

pub fn get_usize(input: &mut &[u8]) -> Result<usize, PersistError> {
    Ok(get_u64(input)? as usize)
}

pub fn get_bool(input: &mut &[u8]) -> Result<bool, PersistError> {
    let mut byte = [0u8; 1];
    input
        .read_exact(&mut byte)
        .map_err(|_| PersistError::UnexpectedEof)?;
    Ok(byte[0] != 0)
}

pub fn get_str(input: &mut &[u8]) -> Result<String, PersistError> {
    let length = get_u32(input)? as usize;
    if input.len() < length {
        return Err(PersistError::UnexpectedEof);
    }
    let (bytes, rest) = input.split_at(length);
    *input = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| PersistError::InvalidString)
}

pub fn get_option<T>(
    input: &mut &[u8],
    body: impl FnOnce(&mut &[u8]) -> Result<T, PersistError>,
) -> Result<Option<T>, PersistError> {
    if get_bool(input)? {
        Ok(Some(body(input)?))
    } else {
        Ok(None)
    }
}

// Entity codecs for the chunk data model.

pub fn put_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Min => put_u32(out, 0),
        Value::Null => put_u32(out, 1),
        Value::Int64(v) => {
            put_u32(out, 2);
            put_i64(out, *v);
        }
        Value::Uint64(v) => {
            put_u32(out, 3);
            put_u64(out, *v);
        }
        Value::Double(v) => {
            put_u32(out, 4);
            put_f64(out, *v);
        }
        Value::Boolean(v) => {
            put_u32(out, 5);
            put_bool(out, *v);
        }
        Value::String(v) => {
            put_u32(out, 6);
            put_str(out, v);
        }
        Value::Max => put_u32(out, 7),
    }
}

pub fn get_value(input: &mut &[u8]) -> Result<Value, PersistError> {
    Ok(match get_u32(input)? {
        0 => Value::Min,
        1 => Value::Null,
        2 => Value::Int64(get_i64(input)?),
        3 => Value::Uint64(get_u64(input)?),
        4 => Value::Double(get_f64(input)?),
        5 => Value::Boolean(get_bool(input)?),
        6 => Value::String(get_str(input)?),
        7 => Value::Max,
        other => return Err(PersistError::UnknownDiscriminator(other)),
    })
}

pub fn put_key(out: &mut Vec<u8>, key: &Key) {
    record(out, tags::KEY, |out| {
        put_u32(out, key.len() as u32);
        for value in key.values() {
            put_value(out, value);
        }
    });
}

pub fn get_key(input: &mut &[u8]) -> Result<Key, PersistError> {
    let payload = expect_record(input, tags::KEY)?;
    parse_payload(payload, |input| {
        let count = get_u32(input)?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(get_value(input)?);
        }
        Ok(Key::from_values(values))
    })
}

fn put_id(out: &mut Vec<u8>, id: &[u8; 16]) {
    out.extend_from_slice(id);
}

fn get_id(input: &mut &[u8]) -> Result<[u8; 16], PersistError> {
    let mut bytes = [0u8; 16];
    input
        .read_exact(&mut bytes)
        .map_err(|_| PersistError::UnexpectedEof)?;
    Ok(bytes)
}

pub fn put_chunk(out: &mut Vec<u8>, chunk: &InputChunk) {
    record(out, tags::CHUNK, |out| {
        put_id(out, chunk.id.as_bytes());
        put_usize(out, chunk.input_stream_index);
        put_i64(out, chunk.uncompressed_data_size);
        put_i64(out, chunk.compressed_data_size);
        put_i64(out, chunk.data_weight);
        put_i64(out, chunk.row_count);
        put_option(out, chunk.boundary_keys.as_ref(), |out, boundary| {
            put_key(out, &boundary.min);
            put_key(out, &boundary.max);
        });
        put_u32(out, chunk.replicas.len() as u32);
        for replica in &chunk.replicas {
            put_u32(out, replica.node_id);
            put_u32(out, replica.replica_index);
        }
        match chunk.erasure_codec {
            ErasureCodec::None => put_u32(out, 0),
            ErasureCodec::ReedSolomon {
                data_parts,
                parity_parts,
            } => {
                put_u32(out, 1);
                put_u32(out, data_parts);
                put_u32(out, parity_parts);
            }
        }
        put_option(out, chunk.partitions.as_ref(), |out, partitions| {
            put_u32(out, partitions.len() as u32);
            for partition in partitions {
                put_i64(out, partition.data_weight);
                put_i64(out, partition.row_count);
            }
        });
    });
}

pub fn get_chunk(input: &mut &[u8]) -> Result<InputChunk, PersistError> {
    let payload = expect_record(input, tags::CHUNK)?;
    parse_payload(payload, |input| {
        let id = ChunkId::new(get_id(input)?);
        let input_stream_index = get_usize(input)?;
        let uncompressed_data_size = get_i64(input)?;
        let compressed_data_size = get_i64(input)?;
        let data_weight = get_i64(input)?;
        let row_count = get_i64(input)?;
        let boundary_keys = get_option(input, |input| {
            Ok(BoundaryKeys {
                min: get_key(input)?,
                max: get_key(input)?,
            })
        })?;
        let replica_count = get_u32(input)?;
        let mut replicas = Vec::with_capacity(replica_count as usize);
        for _ in 0..replica_count {
            replicas.push(ChunkReplica {
                node_id: get_u32(input)?,
                replica_index: get_u32(input)?,
            });
        }
        let erasure_codec = match get_u32(input)? {
            0 => ErasureCodec::None,
            1 => ErasureCodec::ReedSolomon {
                data_parts: get_u32(input)?,
                parity_parts: get_u32(input)?,
            },
            other => return Err(PersistError::UnknownDiscriminator(other)),
        };
        let partitions = get_option(input, |input| {
            let count = get_u32(input)?;
            let mut partitions = Vec::with_capacity(count as usize);
            for _ in 0..count {
                partitions.push(PartitionStatistics {
                    data_weight: get_i64(input)?,
                    row_count: get_i64(input)?,
                });
            }
            Ok(partitions)
        })?;

        Ok(InputChunk {
            id,
            input_stream_index,
            uncompressed_data_size,
            compressed_data_size,
            data_weight,
            row_count,
            boundary_keys,
            replicas,
            erasure_codec,
            partitions,
        })
    })
}

fn put_read_limit(out: &mut Vec<u8>, limit: &ReadLimit) {
    put_option(out, limit.row_index.as_ref(), |out, row| put_i64(out, *row));
    put_option(out, limit.key.as_ref(), |out, key| put_key(out, key));
}

fn get_read_limit(input: &mut &[u8]) -> Result<ReadLimit, PersistError> {
    Ok(ReadLimit {
        row_index: get_option(input, get_i64)?,
        key: get_option(input, get_key)?,
    })
}

pub fn put_slice(out: &mut Vec<u8>, slice: &ChunkSlice) {
    record(out, tags::SLICE, |out| {
        put_chunk(out, slice.chunk());
        put_read_limit(out, &slice.lower_limit);
        put_read_limit(out, &slice.upper_limit);
        put_i64(out, slice.data_weight());
        put_i64(out, slice.row_count());
        put_option(out, slice.part_index.as_ref(), |out, part| {
            put_u32(out, *part)
        });
    });
}

pub fn get_slice(input: &mut &[u8]) -> Result<ChunkSlice, PersistError> {
    let payload = expect_record(input, tags::SLICE)?;
    parse_payload(payload, |input| {
        let chunk = Arc::new(get_chunk(input)?);
        let lower_limit = get_read_limit(input)?;
        let upper_limit = get_read_limit(input)?;
        let data_weight = get_i64(input)?;
        let row_count = get_i64(input)?;
        let part_index = get_option(input, get_u32)?;
        Ok(ChunkSlice::from_parts(
            chunk,
            lower_limit,
            upper_limit,
            data_weight,
            row_count,
            part_index,
        ))
    })
}

pub fn put_stripe(out: &mut Vec<u8>, stripe: &ChunkStripe) {
    record(out, tags::STRIPE, |out| {
        put_u32(out, stripe.slices.len() as u32);
        for slice in &stripe.slices {
            put_slice(out, slice);
        }
    });
}

pub fn get_stripe(input: &mut &[u8]) -> Result<ChunkStripe, PersistError> {
    let payload = expect_record(input, tags::STRIPE)?;
    parse_payload(payload, |input| {
        let count = get_u32(input)?;
        let mut slices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            slices.push(get_slice(input)?);
        }
        Ok(ChunkStripe::new(slices))
    })
}

pub fn put_stripe_list(out: &mut Vec<u8>, list: &ChunkStripeList) {
    record(out, tags::STRIPE_LIST, |out| {
        put_u32(out, list.stripes.len() as u32);
        for stripe in &list.stripes {
            put_stripe(out, stripe);
        }
        put_option(out, list.partition_tag.as_ref(), |out, tag| {
            put_usize(out, *tag)
        });
        put_bool(out, list.is_approximate);
        put_i64(out, list.total_data_weight);
        put_i64(out, list.total_row_count);
        put_i64(out, list.total_chunk_count);
        put_i64(out, list.local_chunk_count);
        put_i64(out, list.non_local_chunk_count);
    });
}

pub fn get_stripe_list(input: &mut &[u8]) -> Result<ChunkStripeList, PersistError> {
    let payload = expect_record(input, tags::STRIPE_LIST)?;
    parse_payload(payload, |input| {
        let count = get_u32(input)?;
        let mut stripes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            stripes.push(Arc::new(get_stripe(input)?));
        }
        Ok(ChunkStripeList {
            stripes,
            partition_tag: get_option(input, get_usize)?,
            is_approximate: get_bool(input)?,
            total_data_weight: get_i64(input)?,
            total_row_count: get_i64(input)?,
            total_chunk_count: get_i64(input)?,
            local_chunk_count: get_i64(input)?,
            non_local_chunk_count: get_i64(input)?,
        })
    })
}

pub fn put_chunk_tree_id(out: &mut Vec<u8>, id: &ChunkTreeId) {
    put_id(out, id.as_bytes());
}

pub fn get_chunk_tree_id(input: &mut &[u8]) -> Result<ChunkTreeId, PersistError> {
    Ok(ChunkTreeId::new(get_id(input)?))
}

pub fn put_chunk_id(out: &mut Vec<u8>, id: &ChunkId) {
    put_id(out, id.as_bytes());
}

pub fn get_chunk_id(input: &mut &[u8]) -> Result<ChunkId, PersistError> {
    Ok(ChunkId::new(get_id(input)?))
}
