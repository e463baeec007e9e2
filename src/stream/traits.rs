use crate::types::{EventData, EventPosition, PartitionId};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Transport failures, classified the way the processor reacts to them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Another consumer took over this partition mid-session
    #[error("Ownership of partition {partition_id} was taken by another consumer: {message}")]
    OwnershipStolen {
        partition_id: PartitionId,
        message: String,
    },

    #[error("Transient stream error: {0}")]
    Transient(String),

    #[error("Fatal stream error: {0}")]
    Fatal(String),
}

impl StreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::OwnershipStolen { .. } => "ownership_stolen",
            StreamError::Transient(_) => "transient",
            StreamError::Fatal(_) => "fatal",
        }
    }

    pub fn is_ownership_stolen(&self) -> bool {
        matches!(self, StreamError::OwnershipStolen { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Exclusive-consumer level. A consumer opened with a higher level supersedes this one.
    pub owner_level: Option<i64>,
}

/// Client for one event stream.
#[async_trait]
pub trait EventStreamClient: Send + Sync {
    fn stream_name(&self) -> &str;

    async fn list_partition_ids(&self) -> Result<Vec<PartitionId>, StreamError>;

    async fn open_consumer(
        &self,
        consumer_group: &str,
        partition_id: &str,
        starting_position: EventPosition,
        options: ConsumerOptions,
    ) -> Result<Box<dyn PartitionConsumer>, StreamError>;
}

/// A receive session on one partition. Owned exclusively by one consumption task.
#[async_trait]
pub trait PartitionConsumer: Send {
    /// Returns at most `max_batch_size` events, or an empty batch once `timeout` elapses.
    async fn receive(
        &mut self,
        max_batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<EventData>, StreamError>;

    async fn close(&mut self) -> Result<(), StreamError>;
}
