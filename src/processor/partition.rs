use super::context::PartitionContext;
use crate::error::ProcessorError;
use crate::types::EventData;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a partition consumption task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// The processor is stopping
    Shutdown,
    /// The partition was claimed by another processor
    OwnershipLost,
    /// The stream transport failed while receiving
    EventStreamError,
    /// User processing logic failed
    ProcessEventsError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Shutdown => "shutdown",
            CloseReason::OwnershipLost => "ownership_lost",
            CloseReason::EventStreamError => "event_stream_error",
            CloseReason::ProcessEventsError => "process_events_error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User processing logic for one partition.
///
/// A fresh instance is created by the [`PartitionProcessorFactory`] for every consumption task,
/// so state kept in `self` lives exactly as long as the task. `initialize` runs once before the
/// first receive and `close` runs once on every exit path. Errors returned from `process_error`
/// and `close` are logged and otherwise ignored.
#[async_trait]
pub trait PartitionProcessor: Send + 'static {
    async fn initialize(&mut self, _context: &PartitionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_events(
        &mut self,
        events: Vec<EventData>,
        context: &PartitionContext,
    ) -> anyhow::Result<()>;

    async fn process_error(
        &mut self,
        _error: &ProcessorError,
        _context: &PartitionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self, _reason: CloseReason, _context: &PartitionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates one [`PartitionProcessor`] per consumption task.
pub trait PartitionProcessorFactory: Send + Sync + 'static {
    type Processor: PartitionProcessor;

    fn create(&self, partition_id: &str) -> Self::Processor;
}

impl<F, P> PartitionProcessorFactory for F
where
    F: Fn(&str) -> P + Send + Sync + 'static,
    P: PartitionProcessor,
{
    type Processor = P;

    fn create(&self, partition_id: &str) -> P {
        self(partition_id)
    }
}
