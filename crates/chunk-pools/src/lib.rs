mod counter;
pub use counter::ProgressCounter;

mod pool;
pub use pool::{
    ChunkPool, InputCookie, OutputCookie, PoolError, PoolInput, PoolOutput, NULL_COOKIE,
};

mod suspendable;
pub use suspendable::SuspendableStripe;

mod atomic;
pub use atomic::AtomicChunkPool;

mod unordered;
pub use unordered::UnorderedChunkPool;

mod shuffle;
pub use shuffle::{ShuffleChunkPool, ShuffleOutput, ShuffleOutputView};

pub mod sorted;
pub use sorted::{
    SortedBuilderError, SortedChunkPool, SortedJobBuilder, SortedJobBuilderOptions, SortedJobStub,
    SortedOutputEntry,
};

mod output_order;
pub use output_order::{OutputOrder, OutputOrderEntry};

pub mod persist;
