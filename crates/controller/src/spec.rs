use std::time::Duration;

/// What to do when every replica of an input chunk is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableChunkStrategy {
    /// Suspend the affected pool input and wait for recovery.
    Wait,
    /// Fail the operation.
    Fail,
    /// Drop the affected slices.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaInferenceMode {
    Auto,
    FromInput,
    FromOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    Unordered,
    Ordered,
    Sorted,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableReaderConfig {
    pub window_size: i64,
    pub prefetch_window: i64,
}

impl Default for TableReaderConfig {
    fn default() -> Self {
        Self {
            window_size: 20 << 20,
            prefetch_window: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableWriterConfig {
    pub window_size: i64,
    pub encode_window_size: i64,
    pub max_buffer_size: i64,
    pub desired_chunk_size: i64,
}

impl Default for TableWriterConfig {
    fn default() -> Self {
        Self {
            window_size: 100 << 20,
            encode_window_size: 16 << 20,
            max_buffer_size: 256 << 20,
            desired_chunk_size: 2 << 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobIoConfig {
    pub table_reader: TableReaderConfig,
    pub table_writer: TableWriterConfig,
}

/// Spec of the user binary a job runs, when the operation carries one.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserJobSpec {
    pub command: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,
    #[serde(default = "default_memory_reserve_factor")]
    pub memory_reserve_factor: f64,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub environment: Vec<(String, String)>,
}

fn default_cpu_limit() -> f64 {
    1.0
}
fn default_memory_limit() -> i64 {
    512 << 20
}
fn default_memory_reserve_factor() -> f64 {
    0.5
}

impl UserJobSpec {
    pub fn memory_reserve(&self) -> i64 {
        (self.memory_limit as f64 * self.memory_reserve_factor) as i64
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeSpec {
    pub mode: MergeMode,
    #[serde(default)]
    pub merge_by: Vec<String>,
    #[serde(default)]
    pub combine_chunks: bool,
    #[serde(default)]
    pub force_transform: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReduceSpec {
    pub reducer: UserJobSpec,
    pub reduce_by: Vec<String>,
    #[serde(default)]
    pub sort_by: Vec<String>,
    #[serde(default)]
    pub join_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapSpec {
    pub mapper: UserJobSpec,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SortSpec {
    pub partition_count: usize,
    #[serde(default = "default_shuffle_job_weight")]
    pub data_weight_per_shuffle_job: i64,
    pub sort_by: Vec<String>,
}

fn default_shuffle_job_weight() -> i64 {
    2 << 30
}

/// The operation-specific half of the spec.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKindSpec {
    Map(MapSpec),
    Merge(MergeSpec),
    Erase,
    Reduce(ReduceSpec),
    JoinReduce(ReduceSpec),
    Sort(SortSpec),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationSpec {
    pub input_table_paths: Vec<String>,
    /// Input tables broadcast to every intersecting primary job instead
    /// of driving job boundaries (sorted reduce operations only).
    #[serde(default)]
    pub foreign_input_table_indices: Vec<usize>,
    pub output_table_paths: Vec<String>,

    #[serde(default = "default_data_weight_per_job")]
    pub data_weight_per_job: i64,
    #[serde(default = "default_max_data_slices_per_job")]
    pub max_data_slices_per_job: usize,
    /// Explicit job count; overrides the weight-derived estimate.
    #[serde(default)]
    pub job_count: Option<i64>,

    #[serde(default)]
    pub job_io: JobIoConfig,

    #[serde(default = "default_schema_inference_mode")]
    pub schema_inference_mode: SchemaInferenceMode,
    #[serde(default = "default_unavailable_chunk_strategy")]
    pub unavailable_chunk_strategy: UnavailableChunkStrategy,

    #[serde(default = "default_locality_timeout", with = "humantime_serde")]
    pub locality_timeout: Duration,

    #[serde(default = "default_max_failed_job_count")]
    pub max_failed_job_count: i64,

    pub operation: OperationKindSpec,
}

fn default_data_weight_per_job() -> i64 {
    256 << 20
}
fn default_max_data_slices_per_job() -> usize {
    10_000
}
fn default_schema_inference_mode() -> SchemaInferenceMode {
    SchemaInferenceMode::Auto
}
fn default_unavailable_chunk_strategy() -> UnavailableChunkStrategy {
    UnavailableChunkStrategy::Wait
}
fn default_locality_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_failed_job_count() -> i64 {
    10
}

impl OperationSpec {
    /// The job count used to size unordered pools: explicit when given,
    /// otherwise derived from the total data weight.
    pub fn suggested_job_count(&self, total_data_weight: i64) -> i64 {
        match self.job_count {
            Some(count) => count.max(1),
            None => {
                ((total_data_weight + self.data_weight_per_job - 1) / self.data_weight_per_job)
                    .max(1)
            }
        }
    }

    pub fn user_job(&self) -> Option<&UserJobSpec> {
        match &self.operation {
            OperationKindSpec::Map(map) => Some(&map.mapper),
            OperationKindSpec::Reduce(reduce) | OperationKindSpec::JoinReduce(reduce) => {
                Some(&reduce.reducer)
            }
            _ => None,
        }
    }
}

/// Controller-level tunables, separate from per-operation specs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Chunk-list reservations fetched from the host per batch.
    pub chunk_list_batch_size: usize,
    /// Cooperative-yield period of long preparation sweeps.
    #[serde(with = "humantime_serde")]
    pub prepare_yield_period: Duration,
    /// Target data weight of a fetched chunk slice.
    pub chunk_slice_data_weight: i64,
    pub max_total_slice_count: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            chunk_list_batch_size: 128,
            prepare_yield_period: Duration::from_millis(100),
            chunk_slice_data_weight: 32 << 20,
            max_total_slice_count: 1_000_000,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn spec_parses_from_json() {
        let spec: OperationSpec = serde_json::from_str(
            r#"{
                "input_table_paths": ["//tmp/in"],
                "output_table_paths": ["//tmp/out"],
                "data_weight_per_job": 1048576,
                "locality_timeout": "15s",
                "operation": {
                    "merge": {
                        "mode": "sorted",
                        "merge_by": ["key"],
                        "combine_chunks": true
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(spec.data_weight_per_job, 1 << 20);
        assert_eq!(spec.locality_timeout, Duration::from_secs(15));
        assert_eq!(spec.max_failed_job_count, 10);
        match &spec.operation {
            OperationKindSpec::Merge(merge) => {
                assert_eq!(merge.mode, MergeMode::Sorted);
                assert!(merge.combine_chunks);
                assert!(!merge.force_transform);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn suggested_job_count_rounds_up() {
        let spec: OperationSpec = serde_json::from_str(
            r#"{
                "input_table_paths": [],
                "output_table_paths": [],
                "data_weight_per_job": 100,
                "operation": "erase"
            }"#,
        )
        .unwrap();

        assert_eq!(spec.suggested_job_count(250), 3);
        assert_eq!(spec.suggested_job_count(0), 1);

        let explicit = OperationSpec {
            job_count: Some(7),
            ..spec
        };
        assert_eq!(explicit.suggested_job_count(250), 7);
    }
}
