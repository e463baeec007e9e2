pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ownership;
pub mod processor;
pub mod storage;
pub mod stream;
pub mod types;

pub use config::ProcessorConfig;
pub use error::{ProcessorError, Result};
pub use processor::{
    CloseReason, EventProcessor, PartitionContext, PartitionProcessor, PartitionProcessorFactory,
};
