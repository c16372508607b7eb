mod error;
pub use error::OperationError;

pub mod resources;
pub use resources::{io_memory_size, NodeResources, FOOTPRINT_MEMORY_SIZE};

pub mod spec;
pub use spec::{ControllerConfig, OperationKindSpec, OperationSpec, UnavailableChunkStrategy};

mod context;
pub use context::{ExecNodeDescriptor, Host, JobId, JobKind, JobSpec, SchedulingContext};

mod executor;
pub use executor::{CancellableContext, ControlExecutor, ExecutorGone, PeriodicYielder};

mod task;
pub use task::{Joblet, PoolHandle, Task, TaskGroup};

mod schedule;
pub use schedule::{PendingTaskRegistry, MAX_TASK_PRIORITY};

mod controller;
pub use controller::{OperationController, OperationState};
