use crate::types::*;
use crate::Result;
use async_trait::async_trait;

/// Durable ownership table with optimistic concurrency.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    async fn list_ownership(
        &self,
        stream_name: &str,
        consumer_group_name: &str,
    ) -> Result<Vec<OwnershipRecord>>;

    /// Conditionally write `record`.
    ///
    /// `record.etag` is the version the caller last observed (`None`: no record may exist yet).
    /// On success the store assigns a fresh etag and `last_modified_time` and returns the stored
    /// record. A stale version fails with `ProcessorError::ConcurrencyConflict` and leaves the
    /// stored record untouched.
    async fn claim_ownership(&self, record: OwnershipRecord) -> Result<OwnershipRecord>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn write_checkpoint(&self, checkpoint: Checkpoint, owner_id: &str) -> Result<()>;

    async fn read_checkpoint(&self, identity: &PartitionIdentity) -> Result<Option<Checkpoint>>;

    async fn list_checkpoints(
        &self,
        stream_name: &str,
        consumer_group_name: &str,
    ) -> Result<Vec<Checkpoint>>;
}
