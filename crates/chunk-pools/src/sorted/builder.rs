use crate::sorted::SortedOutputEntry;
use chunk::key::KeyError;
use chunk::{ChunkId, ChunkSlice, ChunkStripe, InputStreamDirectory, Key};
use indexmap::IndexSet;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SortedBuilderError {
    #[error("error validating boundary key in input stream {input_stream_index}")]
    InvalidKey {
        input_stream_index: usize,
        #[source]
        source: KeyError,
    },
    #[error("slice of chunk {chunk_id} carries no key bounds")]
    MissingKeyBounds { chunk_id: ChunkId },
}

#[derive(Debug, Clone)]
pub struct SortedJobBuilderOptions {
    /// Length of the reduce-key prefix defining equal-key groups.
    pub prefix_length: usize,
    /// Length of the foreign-key prefix; zero disables foreign broadcast.
    pub foreign_prefix_length: usize,
    pub max_data_weight_per_job: i64,
    pub max_data_slices_per_job: usize,
    /// Whether a teleport destination exists for complete input chunks.
    pub enable_teleport: bool,
    /// Force every chunk through a job even when it could teleport.
    pub force_transform: bool,
    /// When set, only chunks already at the desired size may teleport.
    pub combine_chunks: bool,
    pub desired_chunk_size: i64,
}

impl Default for SortedJobBuilderOptions {
    fn default() -> Self {
        Self {
            prefix_length: 1,
            foreign_prefix_length: 0,
            max_data_weight_per_job: i64::MAX / 4,
            max_data_slices_per_job: 10_000,
            enable_teleport: false,
            force_transform: false,
            combine_chunks: false,
            desired_chunk_size: 0,
        }
    }
}

/// One planned sorted job: per-stream stripes plus aggregate sizes.
/// Maniac jobs cover a single reduce-key group and may merge their input
/// in any order.
#[derive(Debug, Clone)]
pub struct SortedJobStub {
    pub stripes: Vec<Arc<ChunkStripe>>,
    pub data_weight: i64,
    pub row_count: i64,
    pub slice_count: usize,
    pub primary_slice_count: usize,
    pub is_maniac: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EndpointKind {
    Left,
    Right,
}

struct Endpoint {
    kind: EndpointKind,
    slice_index: usize,
    min_key: Key,
    max_key: Key,
    teleport: bool,
}

impl Endpoint {
    fn key(&self) -> &Key {
        match self.kind {
            EndpointKind::Left => &self.min_key,
            EndpointKind::Right => &self.max_key,
        }
    }
}

/// SortedJobBuilder sweeps the endpoint-sorted primary slices once,
/// producing an ordered sequence of key-coherent jobs and teleported
/// chunks, then broadcasts foreign slices over the primary key ranges.
pub struct SortedJobBuilder {
    options: SortedJobBuilderOptions,
    stream_directory: InputStreamDirectory,

    primary_slices: Vec<ChunkSlice>,
    foreign_slices: Vec<Vec<ChunkSlice>>,

    endpoints: Vec<Endpoint>,

    // Current-task staging area.
    current_slices: Vec<ChunkSlice>,
    current_data_weight: i64,
    current_row_count: i64,
    current_primary_slice_count: usize,
    current_min_foreign: Option<Key>,
    current_max_foreign: Option<Key>,

    entries: Vec<SortedOutputEntry>,
}

impl SortedJobBuilder {
    pub fn new(options: SortedJobBuilderOptions, stream_directory: InputStreamDirectory) -> Self {
        assert!(options.prefix_length > 0);
        assert!(options.foreign_prefix_length <= options.prefix_length);
        Self {
            options,
            stream_directory,
            primary_slices: Vec::new(),
            foreign_slices: Vec::new(),
            endpoints: Vec::new(),
            current_slices: Vec::new(),
            current_data_weight: 0,
            current_row_count: 0,
            current_primary_slice_count: 0,
            current_min_foreign: None,
            current_max_foreign: None,
            entries: Vec::new(),
        }
    }

    pub fn add_primary(&mut self, slice: ChunkSlice) -> Result<(), SortedBuilderError> {
        self.validate(&slice)?;
        self.primary_slices.push(slice);
        Ok(())
    }

    pub fn add_foreign(&mut self, slice: ChunkSlice) -> Result<(), SortedBuilderError> {
        self.validate(&slice)?;
        let stream = slice.input_stream_index();
        if stream >= self.foreign_slices.len() {
            self.foreign_slices.resize_with(stream + 1, Vec::new);
        }
        self.foreign_slices[stream].push(slice);
        Ok(())
    }

    pub fn total_data_slice_count(&self) -> usize {
        self.primary_slices.len() + self.foreign_slices.iter().map(Vec::len).sum::<usize>()
    }

    pub fn build(mut self) -> Result<Vec<SortedOutputEntry>, SortedBuilderError> {
        let foreign_prefix = self.options.foreign_prefix_length;
        for stream_slices in &mut self.foreign_slices {
            stream_slices.sort_by(|lhs, rhs| {
                let (l_min, l_max) = slice_keys(lhs);
                let (r_min, r_max) = slice_keys(rhs);
                l_min
                    .cmp_prefix(r_min, foreign_prefix)
                    .then_with(|| l_max.cmp_prefix(r_max, foreign_prefix))
            });
        }

        self.collect_endpoints();
        tracing::info!(endpoint_count = self.endpoints.len(), "sorting endpoints");
        self.sort_endpoints();
        self.find_teleport_chunks();
        self.build_tasks();

        tracing::info!(
            entry_count = self.entries.len(),
            "sorted jobs built",
        );
        Ok(self.entries)
    }

    fn validate(&self, slice: &ChunkSlice) -> Result<(), SortedBuilderError> {
        let (Some(min), Some(max)) = (slice.min_key(), slice.max_key()) else {
            return Err(SortedBuilderError::MissingKeyBounds {
                chunk_id: slice.chunk_id(),
            });
        };
        for key in [min, max] {
            key.validate_client_key()
                .map_err(|source| SortedBuilderError::InvalidKey {
                    input_stream_index: slice.input_stream_index(),
                    source,
                })?;
        }
        Ok(())
    }

    fn collect_endpoints(&mut self) {
        for (slice_index, slice) in self.primary_slices.iter().enumerate() {
            let (min_key, max_key) = slice_keys(slice);
            if min_key > max_key {
                // Range clipping can produce empty slices; drop them here.
                continue;
            }

            self.endpoints.push(Endpoint {
                kind: EndpointKind::Left,
                slice_index,
                min_key: min_key.clone(),
                max_key: max_key.clone(),
                teleport: false,
            });
            self.endpoints.push(Endpoint {
                kind: EndpointKind::Right,
                slice_index,
                min_key: min_key.clone(),
                max_key: max_key.clone(),
                teleport: false,
            });
        }
    }

    // Ties resolve through boundary keys and slice identity so that equal
    // keys never split a key group and splits of one chunk stay adjacent.
    fn sort_endpoints(&mut self) {
        let prefix = self.options.prefix_length;
        self.endpoints.sort_by(|lhs, rhs| {
            lhs.key()
                .cmp_prefix(rhs.key(), prefix)
                .then_with(|| lhs.min_key.cmp_prefix(&rhs.min_key, prefix))
                .then_with(|| lhs.max_key.cmp_prefix(&rhs.max_key, prefix))
                .then_with(|| lhs.slice_index.cmp(&rhs.slice_index))
                .then_with(|| lhs.kind.cmp(&rhs.kind))
        });
    }

    /// Scan endpoints for chunks entered and left at their natural
    /// boundaries: those may be committed to the output verbatim.
    fn find_teleport_chunks(&mut self) {
        if !self.options.enable_teleport || self.options.force_transform {
            return;
        }

        let prefix = self.options.prefix_length;
        let mut endpoints = std::mem::take(&mut self.endpoints);

        let mut opened_slices_count: i64 = 0;
        let mut current: Option<(ChunkId, usize)> = None;

        for index in 0..endpoints.len() {
            let endpoint = &endpoints[index];
            let slice = &self.primary_slices[endpoint.slice_index];
            let descriptor = self.stream_directory.descriptor(slice.input_stream_index());

            // Only unversioned tables can be teleported.
            if descriptor.is_versioned {
                current = None;
                continue;
            }

            opened_slices_count += match endpoint.kind {
                EndpointKind::Left => 1,
                EndpointKind::Right => -1,
            };

            let chunk = slice.chunk();
            let Some(boundary) = &chunk.boundary_keys else {
                current = None;
                continue;
            };

            if let Some((current_id, start_index)) = current {
                if chunk.id == current_id {
                    if endpoint.kind == EndpointKind::Right
                        && boundary.max.cmp_prefix(&endpoint.max_key, prefix) == Ordering::Equal
                    {
                        // The last slice of a full chunk.
                        current = None;

                        let is_maniac_teleport = endpoints[start_index]
                            .key()
                            .cmp_prefix(endpoint.key(), prefix)
                            == Ordering::Equal;
                        let is_large_enough = !self.options.combine_chunks
                            || chunk.is_large_complete_chunk(self.options.desired_chunk_size);

                        if is_large_enough && (opened_slices_count == 0 || is_maniac_teleport) {
                            for marked in &mut endpoints[start_index..=index] {
                                marked.teleport = true;
                            }
                        }
                    }
                    continue;
                } else {
                    current = None;
                }
            }

            // No current teleport candidate.
            if descriptor.is_teleportable
                && endpoint.kind == EndpointKind::Left
                && boundary.min.cmp_prefix(&endpoint.min_key, prefix) == Ordering::Equal
                && slice.lower_limit.row_index.is_none()
                && slice.upper_limit.row_index.is_none()
            {
                // The first slice of a full chunk.
                current = Some((chunk.id, index));
            }
        }

        self.endpoints = endpoints;
    }

    fn build_tasks(&mut self) {
        let prefix = self.options.prefix_length;
        let endpoints = std::mem::take(&mut self.endpoints);

        let mut global_opened: IndexSet<usize> = IndexSet::new();
        let mut last_breakpoint: Option<Key> = None;

        let mut start = 0;
        while start < endpoints.len() {
            let key = endpoints[start].key().clone();

            let mut teleport_chunks = Vec::new();
            let mut local_opened: IndexSet<usize> = IndexSet::new();
            // Slices with equal left and right boundaries.
            let mut maniacs: Vec<usize> = Vec::new();

            // Walk the endpoints of one key group.
            let mut current_index = start;
            while current_index < endpoints.len() {
                let endpoint = &endpoints[current_index];
                if key.cmp_prefix(endpoint.key(), prefix) != Ordering::Equal {
                    break;
                }

                if endpoint.teleport {
                    let chunk = self.primary_slices[endpoint.slice_index].chunk().clone();
                    while current_index < endpoints.len()
                        && endpoints[current_index].teleport
                        && self.primary_slices[endpoints[current_index].slice_index].chunk_id()
                            == chunk.id
                    {
                        current_index += 1;
                    }
                    teleport_chunks.push(chunk);
                    continue;
                }

                match endpoint.kind {
                    EndpointKind::Left => {
                        let inserted = local_opened.insert(endpoint.slice_index);
                        assert!(inserted);
                    }
                    EndpointKind::Right => {
                        if global_opened.shift_remove(&endpoint.slice_index) {
                            let slice = self.primary_slices[endpoint.slice_index]
                                .clip_keys(last_breakpoint.as_ref(), None);
                            self.add_pending_slice(slice);
                        } else if local_opened.shift_remove(&endpoint.slice_index) {
                            maniacs.push(endpoint.slice_index);
                        } else {
                            unreachable!("right endpoint closes a slice that is not open");
                        }
                    }
                }
                current_index += 1;
            }

            for slice_index in local_opened {
                global_opened.insert(slice_index);
            }

            let over_budget = |builder: &Self, opened: &IndexSet<usize>| {
                builder.has_large_active_task()
                    || builder.current_slices.len() + opened.len()
                        >= builder.options.max_data_slices_per_job
            };

            // An equal-key group must never split across jobs. When the
            // group alone fits one job it joins the current task like any
            // other slice; otherwise the whole group becomes one maniac
            // task, whose unordered-merge semantics tolerate its size.
            let maniac_weight: i64 = maniacs
                .iter()
                .map(|&slice_index| self.primary_slices[slice_index].data_weight())
                .sum();
            let group_fits_one_job = maniac_weight < self.options.max_data_weight_per_job
                && maniacs.len() < self.options.max_data_slices_per_job;

            if group_fits_one_job {
                for slice_index in maniacs.drain(..) {
                    self.add_pending_slice(self.primary_slices[slice_index].clone());
                }
            } else if !maniacs.is_empty() {
                self.flush_open_slices(&key, &global_opened, &mut last_breakpoint);

                for slice_index in maniacs.drain(..) {
                    self.add_pending_slice(self.primary_slices[slice_index].clone());
                }
                self.end_maniac_task();
            }

            if !teleport_chunks.is_empty() {
                self.flush_open_slices(&key, &global_opened, &mut last_breakpoint);

                let mut previous_max: Option<Key> = None;
                for chunk in teleport_chunks {
                    let boundary = chunk
                        .boundary_keys
                        .as_ref()
                        .expect("teleport chunks carry boundary keys");
                    if let Some(previous) = &previous_max {
                        assert_ne!(
                            previous.cmp_prefix(&boundary.min, prefix),
                            Ordering::Greater,
                            "teleport chunks must leave in sorted order",
                        );
                    }
                    previous_max = Some(boundary.max.clone());

                    tracing::trace!(chunk_id = %chunk.id, "teleport chunk added");
                    self.entries.push(SortedOutputEntry::TeleportChunk(chunk));
                }
            }

            if over_budget(self, &global_opened) {
                self.flush_open_slices(&key, &global_opened, &mut last_breakpoint);
            }

            start = current_index;
        }

        assert!(global_opened.is_empty());
        self.end_task_if_active();
    }

    /// Flush the staged task at a key-group boundary: every still-open
    /// slice contributes its part up to the key prefix successor, and the
    /// next task resumes from that breakpoint.
    fn flush_open_slices(
        &mut self,
        key: &Key,
        global_opened: &IndexSet<usize>,
        last_breakpoint: &mut Option<Key>,
    ) {
        let next_breakpoint = key.prefix_successor(self.options.prefix_length);
        if last_breakpoint.as_ref() == Some(&next_breakpoint) {
            // Already flushed at this key.
            return;
        }

        tracing::trace!(
            open_count = global_opened.len(),
            breakpoint = %next_breakpoint,
            "finishing current task",
        );

        for &slice_index in global_opened {
            let slice = self.primary_slices[slice_index]
                .clip_keys(last_breakpoint.as_ref(), Some(&next_breakpoint));
            self.add_pending_slice(slice);
        }
        *last_breakpoint = Some(next_breakpoint);

        self.end_task_if_active();
    }

    fn add_pending_slice(&mut self, slice: ChunkSlice) {
        if self.options.foreign_prefix_length > 0 {
            let foreign_prefix = self.options.foreign_prefix_length;
            let (min_key, max_key) = slice_keys(&slice);

            let lower = min_key.prefix(foreign_prefix);
            if self
                .current_min_foreign
                .as_ref()
                .map_or(true, |current| *current > lower)
            {
                self.current_min_foreign = Some(lower);
            }

            let upper = max_key.prefix_successor(foreign_prefix);
            if self
                .current_max_foreign
                .as_ref()
                .map_or(true, |current| *current < upper)
            {
                self.current_max_foreign = Some(upper);
            }
        }

        self.current_data_weight += slice.data_weight();
        self.current_row_count += slice.row_count();
        if self
            .stream_directory
            .descriptor(slice.input_stream_index())
            .is_primary
        {
            self.current_primary_slice_count += 1;
        }
        self.current_slices.push(slice);
    }

    fn has_active_task(&self) -> bool {
        self.current_data_weight > 0
    }

    fn has_large_active_task(&self) -> bool {
        self.current_data_weight >= self.options.max_data_weight_per_job
            || self.current_slices.len() >= self.options.max_data_slices_per_job
    }

    fn end_task_if_active(&mut self) {
        if !self.has_active_task() {
            return;
        }

        if self.options.foreign_prefix_length > 0 {
            let min_foreign = self
                .current_min_foreign
                .take()
                .expect("active task tracks its foreign key range");
            let max_foreign = self
                .current_max_foreign
                .take()
                .expect("active task tracks its foreign key range");

            self.add_foreign_slices_to_task(&min_foreign, &max_foreign);

            if self.current_data_weight > 2 * self.options.max_data_weight_per_job {
                self.split_task_by_foreign_key();
            }
        }

        self.current_min_foreign = None;
        self.current_max_foreign = None;

        self.end_task(None, false);
    }

    fn end_maniac_task(&mut self) {
        if !self.has_active_task() {
            return;
        }
        self.current_min_foreign = None;
        self.current_max_foreign = None;
        self.end_task(None, true);
    }

    /// Broadcast every foreign slice intersecting the task's primary key
    /// range, clipped to that range at the foreign prefix.
    fn add_foreign_slices_to_task(&mut self, min_foreign: &Key, max_foreign: &Key) {
        let foreign_prefix = self.options.foreign_prefix_length;

        let mut clipped = Vec::new();
        for stream_slices in &self.foreign_slices {
            for slice in stream_slices {
                let (slice_min, slice_max) = slice_keys(slice);
                if min_foreign.cmp_prefix(slice_max, foreign_prefix) == Ordering::Greater {
                    continue;
                }
                if max_foreign.cmp_prefix(slice_min, foreign_prefix) == Ordering::Less {
                    // The stream is sorted; nothing further intersects.
                    break;
                }

                let mut lower = slice_min.prefix(foreign_prefix);
                if lower < *min_foreign {
                    lower = min_foreign.clone();
                }
                let mut upper = slice_max.prefix_successor(foreign_prefix);
                if upper > *max_foreign {
                    upper = max_foreign.clone();
                }

                clipped.push(slice.clip_keys(Some(&lower), Some(&upper)));
            }
        }

        for slice in clipped {
            self.add_pending_slice(slice);
        }
    }

    /// The task overshot twice the target weight after foreign broadcast;
    /// carve it at foreign-key breakpoints computed from slice upper
    /// bounds.
    fn split_task_by_foreign_key(&mut self) {
        let foreign_prefix = self.options.foreign_prefix_length;

        let mut slice_weights: Vec<(Key, i64)> = self
            .current_slices
            .iter()
            .map(|slice| (slice_keys(slice).1.clone(), slice.data_weight()))
            .collect();
        slice_weights.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));

        let mut accumulated = 0;
        let mut breakpoint: Option<Key> = None;
        for (upper, weight) in slice_weights {
            if let Some(current) = &breakpoint {
                if current.cmp_prefix(&upper, foreign_prefix) == Ordering::Equal {
                    continue;
                }
            }

            accumulated += weight;

            if accumulated > 2 * self.options.max_data_weight_per_job && self.has_active_task() {
                let next = upper.prefix_successor(foreign_prefix);
                accumulated = 0;
                self.end_task(Some(&next), false);
                breakpoint = Some(next);
            }
        }
    }

    /// Emit the staged slices as one job. With a breakpoint, only the
    /// parts below it leave; parts at or above it stay staged for the
    /// next job.
    fn end_task(&mut self, breakpoint: Option<&Key>, is_maniac: bool) {
        assert!(self.has_active_task());

        let staged = std::mem::take(&mut self.current_slices);
        self.current_data_weight = 0;
        self.current_row_count = 0;
        self.current_primary_slice_count = 0;

        let mut task_slices = Vec::new();
        match breakpoint {
            None => task_slices = staged,
            Some(breakpoint) => {
                for slice in staged {
                    let (slice_min, slice_max) = slice_keys(&slice);
                    if *slice_max <= *breakpoint {
                        task_slices.push(slice);
                    } else if *slice_min >= *breakpoint {
                        self.add_pending_slice(slice);
                    } else {
                        task_slices.push(slice.clip_keys(None, Some(breakpoint)));
                        self.add_pending_slice(slice.clip_keys(Some(breakpoint), None));
                    }
                }
            }
        }

        let Some(stub) = self.make_stub(task_slices, is_maniac) else {
            // All slices came from foreign tables; such a job is useless.
            return;
        };

        tracing::debug!(
            data_weight = stub.data_weight,
            slice_count = stub.slice_count,
            is_maniac,
            "task finished",
        );
        self.entries.push(SortedOutputEntry::Job(stub));
    }

    fn make_stub(&self, slices: Vec<ChunkSlice>, is_maniac: bool) -> Option<SortedJobStub> {
        let mut per_stream: Vec<Vec<ChunkSlice>> = Vec::new();
        let mut data_weight = 0;
        let mut row_count = 0;
        let mut slice_count = 0;
        let mut primary_slice_count = 0;

        for slice in slices {
            let stream = slice.input_stream_index();
            if stream >= per_stream.len() {
                per_stream.resize_with(stream + 1, Vec::new);
            }
            data_weight += slice.data_weight();
            row_count += slice.row_count();
            slice_count += 1;
            if self.stream_directory.descriptor(stream).is_primary {
                primary_slice_count += 1;
            }
            per_stream[stream].push(slice);
        }

        if primary_slice_count == 0 {
            return None;
        }

        let stripes = per_stream
            .into_iter()
            .filter(|slices| !slices.is_empty())
            .map(|slices| Arc::new(ChunkStripe::new(slices)))
            .collect();

        Some(SortedJobStub {
            stripes,
            data_weight,
            row_count,
            slice_count,
            primary_slice_count,
            is_maniac,
        })
    }
}

fn slice_keys(slice: &ChunkSlice) -> (&Key, &Key) {
    let min = slice
        .min_key()
        .expect("sorted slices carry key bounds");
    let max = slice
        .max_key()
        .expect("sorted slices carry key bounds");
    (min, max)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sorted::SortedOutputEntry;
    use chunk::{
        BoundaryKeys, ChunkId, ErasureCodec, InputChunk, InputStreamDescriptor, ReadLimit,
    };

    fn keyed_chunk(
        seq: u64,
        stream: usize,
        min: &[i64],
        max: &[i64],
        data_weight: i64,
    ) -> Arc<InputChunk> {
        Arc::new(InputChunk {
            id: ChunkId::from_parts(5, seq),
            input_stream_index: stream,
            uncompressed_data_size: data_weight,
            compressed_data_size: data_weight,
            data_weight,
            row_count: data_weight,
            boundary_keys: Some(BoundaryKeys {
                min: Key::from_ints(min),
                max: Key::from_ints(max),
            }),
            replicas: vec![],
            erasure_codec: ErasureCodec::None,
            partitions: None,
        })
    }

    fn slice(seq: u64, min: &[i64], max: &[i64], data_weight: i64) -> ChunkSlice {
        ChunkSlice::whole(keyed_chunk(seq, 0, min, max, data_weight))
    }

    fn teleport_directory() -> InputStreamDirectory {
        InputStreamDirectory::new(vec![InputStreamDescriptor::new(true, true, false)])
    }

    fn jobs(entries: &[SortedOutputEntry]) -> Vec<&SortedJobStub> {
        entries
            .iter()
            .filter_map(|entry| match entry {
                SortedOutputEntry::Job(stub) => Some(stub),
                SortedOutputEntry::TeleportChunk(_) => None,
            })
            .collect()
    }

    // Scenario: a complete chunk whose key range touches nothing else
    // teleports; its neighbor becomes an ordinary merge job, after it in
    // the output order.
    #[test]
    fn disjoint_complete_chunk_teleports() {
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                enable_teleport: true,
                ..Default::default()
            },
            teleport_directory(),
        );

        builder.add_primary(slice(1, &[1], &[5], 100)).unwrap();
        // A clipped slice of another chunk; not teleportable.
        let mut clipped = slice(2, &[6], &[9], 100);
        clipped.lower_limit = ReadLimit {
            row_index: Some(10),
            key: Some(Key::from_ints(&[6])),
        };
        builder.add_primary(clipped).unwrap();

        let entries = builder.build().unwrap();
        assert_eq!(entries.len(), 2);

        match &entries[0] {
            SortedOutputEntry::TeleportChunk(chunk) => {
                assert_eq!(chunk.id, ChunkId::from_parts(5, 1));
            }
            other => panic!("expected teleport chunk, got {other:?}"),
        }
        match &entries[1] {
            SortedOutputEntry::Job(stub) => {
                assert!(!stub.is_maniac);
                assert_eq!(stub.slice_count, 1);
            }
            other => panic!("expected job, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_chunks_do_not_teleport() {
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                enable_teleport: true,
                ..Default::default()
            },
            teleport_directory(),
        );

        builder.add_primary(slice(1, &[1], &[5], 100)).unwrap();
        builder.add_primary(slice(2, &[3], &[9], 100)).unwrap();

        let entries = builder.build().unwrap();
        let jobs = jobs(&entries);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].slice_count, 2);
        assert!(entries
            .iter()
            .all(|entry| matches!(entry, SortedOutputEntry::Job(_))));
    }

    #[test]
    fn force_transform_disables_teleport() {
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                enable_teleport: true,
                force_transform: true,
                ..Default::default()
            },
            teleport_directory(),
        );
        builder.add_primary(slice(1, &[1], &[5], 100)).unwrap();

        let entries = builder.build().unwrap();
        assert!(matches!(entries[0], SortedOutputEntry::Job(_)));
    }

    // Scenario: a huge equal-key island becomes one maniac task, never
    // split, and surrounding keys flow into ordinary jobs.
    #[test]
    fn equal_key_group_is_never_split() {
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                max_data_weight_per_job: 100,
                ..Default::default()
            },
            InputStreamDirectory::default(),
        );

        // 1000 maniac slices for key 42, weight 10 each.
        for seq in 0..1000 {
            builder.add_primary(slice(seq, &[42], &[42], 10)).unwrap();
        }
        // A run of ordinary keys after the island.
        for seq in 0..1000 {
            let key = 43 + seq as i64;
            builder
                .add_primary(slice(1000 + seq, &[key], &[key], 10))
                .unwrap();
        }

        let entries = builder.build().unwrap();
        let jobs = jobs(&entries);

        let maniac_jobs: Vec<_> = jobs.iter().filter(|stub| stub.is_maniac).collect();
        let ordinary_jobs: Vec<_> = jobs.iter().filter(|stub| !stub.is_maniac).collect();

        // The whole key-42 group lands in exactly one maniac task.
        assert_eq!(maniac_jobs.len(), 1);
        assert_eq!(maniac_jobs[0].slice_count, 1000);
        assert_eq!(maniac_jobs[0].data_weight, 10_000);

        // The remaining keys pack into ordinary tasks at ten slices each.
        assert!(ordinary_jobs.len() >= 10);
        let ordinary_slices: usize = ordinary_jobs.iter().map(|stub| stub.slice_count).sum();
        assert_eq!(ordinary_slices, 1000);

        // No reduce-key group spans two jobs: jobs are ordered and their
        // key ranges do not interleave.
        let mut previous_max: Option<Key> = None;
        for stub in &ordinary_jobs {
            let min = stub
                .stripes
                .iter()
                .flat_map(|stripe| stripe.slices.iter())
                .filter_map(|slice| slice.min_key())
                .min()
                .unwrap()
                .clone();
            if let Some(previous) = &previous_max {
                assert!(*previous <= min);
            }
            previous_max = stub
                .stripes
                .iter()
                .flat_map(|stripe| stripe.slices.iter())
                .filter_map(|slice| slice.max_key())
                .max()
                .cloned();
        }
    }

    // A maniac chunk may teleport even while another slice is open at
    // its key.
    #[test]
    fn maniac_chunk_teleports_through_an_open_slice() {
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                enable_teleport: true,
                ..Default::default()
            },
            teleport_directory(),
        );

        builder.add_primary(slice(1, &[1], &[9], 100)).unwrap();
        builder.add_primary(slice(2, &[5], &[5], 100)).unwrap();

        let entries = builder.build().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], SortedOutputEntry::Job(_)));
        match &entries[1] {
            SortedOutputEntry::TeleportChunk(chunk) => {
                assert_eq!(chunk.id, ChunkId::from_parts(5, 2));
            }
            other => panic!("expected teleport chunk, got {other:?}"),
        }
        assert!(matches!(entries[2], SortedOutputEntry::Job(_)));
    }

    #[test]
    fn straddling_slices_are_clipped_at_flush() {
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                max_data_weight_per_job: 150,
                ..Default::default()
            },
            InputStreamDirectory::default(),
        );

        // One wide slice spanning all keys, plus narrow heavy slices that
        // force flushes between key groups.
        builder.add_primary(slice(1, &[1], &[100], 10)).unwrap();
        builder.add_primary(slice(2, &[10], &[20], 200)).unwrap();
        builder.add_primary(slice(3, &[30], &[40], 200)).unwrap();

        let entries = builder.build().unwrap();
        let jobs = jobs(&entries);
        assert!(jobs.len() >= 2);

        // The wide slice is distributed across jobs in clipped pieces
        // whose ranges do not overlap.
        let wide_pieces: Vec<_> = jobs
            .iter()
            .flat_map(|stub| &stub.stripes)
            .flat_map(|stripe| &stripe.slices)
            .filter(|piece| piece.chunk_id() == ChunkId::from_parts(5, 1))
            .collect();
        assert!(wide_pieces.len() >= 2);
        for window in wide_pieces.windows(2) {
            let first_upper = window[0].max_key().unwrap();
            let second_lower = window[1].min_key().unwrap();
            assert!(first_upper <= second_lower);
        }
    }

    #[test]
    fn foreign_slices_broadcast_to_intersecting_jobs() {
        let directory = InputStreamDirectory::new(vec![
            InputStreamDescriptor::new(false, true, false),
            InputStreamDescriptor::new(false, false, false),
        ]);
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                prefix_length: 1,
                foreign_prefix_length: 1,
                max_data_weight_per_job: 100,
                ..Default::default()
            },
            directory,
        );

        builder.add_primary(slice(1, &[1], &[10], 100)).unwrap();
        builder.add_primary(slice(2, &[11], &[20], 100)).unwrap();

        // One foreign slice per primary range, plus one outside both.
        builder
            .add_foreign(ChunkSlice::whole(keyed_chunk(10, 1, &[5], &[6], 10)))
            .unwrap();
        builder
            .add_foreign(ChunkSlice::whole(keyed_chunk(11, 1, &[15], &[16], 10)))
            .unwrap();
        builder
            .add_foreign(ChunkSlice::whole(keyed_chunk(12, 1, &[50], &[60], 10)))
            .unwrap();

        let entries = builder.build().unwrap();
        let jobs = jobs(&entries);
        assert_eq!(jobs.len(), 2);

        for (job_index, expected_foreign_chunk) in [(0, 10u64), (1, 11u64)] {
            let stub = jobs[job_index];
            let foreign: Vec<_> = stub
                .stripes
                .iter()
                .flat_map(|stripe| &stripe.slices)
                .filter(|slice| slice.input_stream_index() == 1)
                .collect();
            assert_eq!(foreign.len(), 1, "job {job_index}");
            assert_eq!(
                foreign[0].chunk_id(),
                ChunkId::from_parts(5, expected_foreign_chunk)
            );
        }
    }

    #[test]
    fn foreign_only_jobs_are_dropped() {
        let directory = InputStreamDirectory::new(vec![
            InputStreamDescriptor::new(false, true, false),
            InputStreamDescriptor::new(false, false, false),
        ]);
        let mut builder = SortedJobBuilder::new(
            SortedJobBuilderOptions {
                foreign_prefix_length: 1,
                ..Default::default()
            },
            directory,
        );
        builder
            .add_foreign(ChunkSlice::whole(keyed_chunk(10, 1, &[5], &[6], 10)))
            .unwrap();

        let entries = builder.build().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn sentinel_keys_are_rejected() {
        let mut builder =
            SortedJobBuilder::new(SortedJobBuilderOptions::default(), Default::default());

        let chunk = Arc::new(InputChunk {
            boundary_keys: Some(BoundaryKeys {
                min: Key::from_values(vec![chunk::Value::Min]),
                max: Key::from_ints(&[5]),
            }),
            ..(*keyed_chunk(1, 0, &[1], &[5], 10)).clone()
        });

        let err = builder.add_primary(ChunkSlice::whole(chunk)).unwrap_err();
        assert!(matches!(err, SortedBuilderError::InvalidKey { .. }));
    }
}
