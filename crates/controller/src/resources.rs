use crate::spec::JobIoConfig;

/// Fixed per-job memory overhead of the job proxy itself.
pub const FOOTPRINT_MEMORY_SIZE: i64 = 16 * 1024 * 1024;

/// Resource envelope of a node or a job: the scheduler's admission test
/// is a component-wise comparison of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeResources {
    pub user_slots: i64,
    pub cpu: f64,
    pub memory: i64,
    pub network: i64,
}

impl NodeResources {
    pub fn zero() -> Self {
        Self::default()
    }

    /// `lhs` covers `rhs` in every component.
    pub fn dominates(&self, rhs: &NodeResources) -> bool {
        self.user_slots >= rhs.user_slots
            && self.cpu >= rhs.cpu
            && self.memory >= rhs.memory
            && self.network >= rhs.network
    }

    pub fn scale(&self, factor: i64) -> NodeResources {
        NodeResources {
            user_slots: self.user_slots * factor,
            cpu: self.cpu * factor as f64,
            memory: self.memory * factor,
            network: self.network * factor,
        }
    }
}

impl std::ops::Add for NodeResources {
    type Output = NodeResources;
    fn add(self, rhs: NodeResources) -> NodeResources {
        NodeResources {
            user_slots: self.user_slots + rhs.user_slots,
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            network: self.network + rhs.network,
        }
    }
}

impl std::ops::AddAssign for NodeResources {
    fn add_assign(&mut self, rhs: NodeResources) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for NodeResources {
    type Output = NodeResources;
    fn sub(self, rhs: NodeResources) -> NodeResources {
        NodeResources {
            user_slots: self.user_slots - rhs.user_slots,
            cpu: self.cpu - rhs.cpu,
            memory: self.memory - rhs.memory,
            network: self.network - rhs.network,
        }
    }
}

impl std::ops::SubAssign for NodeResources {
    fn sub_assign(&mut self, rhs: NodeResources) {
        *self = *self - rhs;
    }
}

impl std::fmt::Display for NodeResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{Slots: {}, Cpu: {:.2}, Memory: {}, Network: {}}}",
            self.user_slots, self.cpu, self.memory, self.network
        )
    }
}

/// Estimate the job-proxy IO memory needed to read `input_stream_count`
/// streams and write `output_stream_count` streams under the given IO
/// windows.
pub fn io_memory_size(
    io: &JobIoConfig,
    input_stream_count: i64,
    output_stream_count: i64,
) -> i64 {
    let reader = io.table_reader.window_size * (1 + io.table_reader.prefetch_window);
    let writer = io.table_writer.window_size
        + io.table_writer.encode_window_size
        + io.table_writer.max_buffer_size;
    reader * input_stream_count + writer * output_stream_count
}
