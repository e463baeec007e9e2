use super::traits::*;
use crate::clock::{Clock, SystemClock};
use crate::error::ProcessorError;
use crate::types::*;
use crate::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Ownership and checkpoint storage held in process memory.
///
/// Conditional writes are atomic per partition (the map entry is locked for the compare and the
/// write), so several processors sharing one instance race exactly as they would against a
/// durable backend. Checkpoint writes are rejected when the writer no longer owns the partition.
pub struct InMemoryPartitionStore {
    ownership: DashMap<PartitionIdentity, OwnershipRecord>,
    checkpoints: DashMap<PartitionIdentity, Checkpoint>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl InMemoryPartitionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            ownership: DashMap::new(),
            checkpoints: DashMap::new(),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// While unavailable every call fails with `ProcessorError::Store`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessorError::Store(
                "partition store is unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryPartitionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OwnershipStore for InMemoryPartitionStore {
    async fn list_ownership(
        &self,
        stream_name: &str,
        consumer_group_name: &str,
    ) -> Result<Vec<OwnershipRecord>> {
        self.check_available()?;
        let mut records: Vec<OwnershipRecord> = self
            .ownership
            .iter()
            .filter(|entry| {
                entry.key().stream_name == stream_name
                    && entry.key().consumer_group_name == consumer_group_name
            })
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(records)
    }

    async fn claim_ownership(&self, record: OwnershipRecord) -> Result<OwnershipRecord> {
        self.check_available()?;

        let stored = OwnershipRecord {
            last_modified_time: Some(self.clock.now()),
            etag: Some(Uuid::new_v4().to_string()),
            ..record.clone()
        };

        match self.ownership.entry(record.identity()) {
            Entry::Occupied(mut entry) => {
                if entry.get().etag != record.etag {
                    return Err(ProcessorError::ConcurrencyConflict {
                        partition_id: record.partition_id,
                    });
                }
                entry.insert(stored.clone());
            }
            Entry::Vacant(entry) => {
                if record.etag.is_some() {
                    return Err(ProcessorError::ConcurrencyConflict {
                        partition_id: record.partition_id,
                    });
                }
                entry.insert(stored.clone());
            }
        }

        Ok(stored)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryPartitionStore {
    async fn write_checkpoint(&self, checkpoint: Checkpoint, owner_id: &str) -> Result<()> {
        self.check_available()?;
        let identity = checkpoint.identity();

        if let Some(ownership) = self.ownership.get(&identity) {
            if ownership.owner() != Some(owner_id) {
                return Err(ProcessorError::Store(format!(
                    "partition {} is owned by {:?}, not {}",
                    identity,
                    ownership.owner(),
                    owner_id
                )));
            }
        }

        self.checkpoints.insert(identity, checkpoint);
        Ok(())
    }

    async fn read_checkpoint(&self, identity: &PartitionIdentity) -> Result<Option<Checkpoint>> {
        self.check_available()?;
        Ok(self.checkpoints.get(identity).map(|entry| entry.value().clone()))
    }

    async fn list_checkpoints(
        &self,
        stream_name: &str,
        consumer_group_name: &str,
    ) -> Result<Vec<Checkpoint>> {
        self.check_available()?;
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|entry| {
                entry.key().stream_name == stream_name
                    && entry.key().consumer_group_name == consumer_group_name
            })
            .map(|entry| entry.value().clone())
            .collect();
        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn claim_request(partition: &str, owner: &str, etag: Option<String>) -> OwnershipRecord {
        OwnershipRecord {
            owner_id: Some(owner.to_string()),
            etag,
            ..OwnershipRecord::unclaimed(PartitionIdentity::new("orders", "$default", partition))
        }
    }

    #[tokio::test]
    async fn test_claim_sets_version_and_timestamp() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryPartitionStore::with_clock(clock.clone());

        let stored = store.claim_ownership(claim_request("0", "a", None)).await.unwrap();
        assert_eq!(stored.owner(), Some("a"));
        assert_eq!(stored.last_modified_time, Some(clock.now()));
        assert!(stored.etag.is_some());

        clock.advance(Duration::from_secs(3));
        let renewed = store
            .claim_ownership(claim_request("0", "a", stored.etag.clone()))
            .await
            .unwrap();
        assert_ne!(renewed.etag, stored.etag);
        assert_eq!(renewed.last_modified_time, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_stale_version_never_wins() {
        let store = InMemoryPartitionStore::new();
        let first = store.claim_ownership(claim_request("0", "a", None)).await.unwrap();

        // Second creator with no version loses
        let err = store.claim_ownership(claim_request("0", "b", None)).await.unwrap_err();
        assert!(err.is_concurrency_conflict());

        // Writing with a made-up version loses
        let err = store
            .claim_ownership(claim_request("1", "b", Some("bogus".to_string())))
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());

        // Once "a" renews, its old version is stale for "b"
        store
            .claim_ownership(claim_request("0", "a", first.etag.clone()))
            .await
            .unwrap();
        let err = store
            .claim_ownership(claim_request("0", "b", first.etag.clone()))
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());

        let records = store.list_ownership("orders", "$default").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner(), Some("a"));
    }

    #[tokio::test]
    async fn test_concurrent_claimants_exactly_one_wins() {
        let store = Arc::new(InMemoryPartitionStore::new());
        let mut handles = Vec::new();
        for owner in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_ownership(claim_request("0", &format!("owner-{}", owner), None))
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_concurrency_conflict()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip_and_owner_guard() {
        let store = InMemoryPartitionStore::new();
        let identity = PartitionIdentity::new("orders", "$default", "0");
        store.claim_ownership(claim_request("0", "a", None)).await.unwrap();

        store
            .write_checkpoint(Checkpoint::new(identity.clone(), 10, 10), "a")
            .await
            .unwrap();
        store
            .write_checkpoint(Checkpoint::new(identity.clone(), 25, 25), "a")
            .await
            .unwrap();
        assert_eq!(
            store.read_checkpoint(&identity).await.unwrap(),
            Some(Checkpoint::new(identity.clone(), 25, 25))
        );

        let err = store
            .write_checkpoint(Checkpoint::new(identity.clone(), 30, 30), "b")
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Store(_)));

        let missing = PartitionIdentity::new("orders", "$default", "7");
        assert_eq!(store.read_checkpoint(&missing).await.unwrap(), None);
        assert_eq!(store.list_checkpoints("orders", "$default").await.unwrap().len(), 1);
        assert!(store.list_checkpoints("orders", "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryPartitionStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_ownership("orders", "$default").await,
            Err(ProcessorError::Store(_))
        ));
        assert!(store.claim_ownership(claim_request("0", "a", None)).await.is_err());

        store.set_unavailable(false);
        assert!(store.list_ownership("orders", "$default").await.unwrap().is_empty());
    }
}
