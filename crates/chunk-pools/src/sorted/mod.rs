mod builder;
pub use builder::{SortedBuilderError, SortedJobBuilder, SortedJobBuilderOptions, SortedJobStub};

mod pool;
pub use pool::SortedChunkPool;

use chunk::InputChunk;
use std::sync::Arc;

/// One position of a sorted operation's output: a job to run, or a chunk
/// committed to the destination without running a job over it.
#[derive(Debug, Clone)]
pub enum SortedOutputEntry {
    Job(SortedJobStub),
    TeleportChunk(Arc<InputChunk>),
}
