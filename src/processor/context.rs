use crate::error::ProcessorError;
use crate::metrics::ProcessorMetrics;
use crate::storage::CheckpointStore;
use crate::types::*;
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// Handle given to user processing logic for one partition consumption task.
pub struct PartitionContext {
    identity: PartitionIdentity,
    owner_id: OwnerId,
    checkpoint_store: Arc<dyn CheckpointStore>,
    metrics: Arc<ProcessorMetrics>,
}

impl PartitionContext {
    pub(crate) fn new(
        identity: PartitionIdentity,
        owner_id: OwnerId,
        checkpoint_store: Arc<dyn CheckpointStore>,
        metrics: Arc<ProcessorMetrics>,
    ) -> Self {
        Self {
            identity,
            owner_id,
            checkpoint_store,
            metrics,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.identity.partition_id
    }

    pub fn stream_name(&self) -> &str {
        &self.identity.stream_name
    }

    pub fn consumer_group_name(&self) -> &str {
        &self.identity.consumer_group_name
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn identity(&self) -> &PartitionIdentity {
        &self.identity
    }

    /// Record progress for this partition. Failures are returned as-is; nothing is retried here.
    pub async fn update_checkpoint(
        &self,
        offset: Offset,
        sequence_number: SequenceNumber,
    ) -> Result<()> {
        let checkpoint = Checkpoint::new(self.identity.clone(), offset, sequence_number);
        self.checkpoint_store
            .write_checkpoint(checkpoint, &self.owner_id)
            .await
            .map_err(|e| ProcessorError::CheckpointWrite {
                partition_id: self.identity.partition_id.clone(),
                reason: e.to_string(),
            })?;

        self.metrics.checkpoints_written.inc();
        debug!(
            "Checkpoint for {} at offset {} (sequence {}) written by {}",
            self.identity, offset, sequence_number, self.owner_id
        );
        Ok(())
    }

    /// Checkpoint at the position of `event`.
    pub async fn checkpoint_event(&self, event: &EventData) -> Result<()> {
        self.update_checkpoint(event.offset, event.sequence_number).await
    }
}
