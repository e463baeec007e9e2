pub mod context;
pub mod event_processor;
pub mod partition;
pub mod task;

pub use context::PartitionContext;
pub use event_processor::{EventProcessor, ProcessorState, ProcessorStatus};
pub use partition::{CloseReason, PartitionProcessor, PartitionProcessorFactory};
pub use task::TaskState;
