use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type PartitionId = String;
pub type OwnerId = String;
pub type Offset = u64;
pub type SequenceNumber = u64;
pub type ETag = String;

/// (stream, consumer group, partition): the key of both ownership and checkpoint records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionIdentity {
    pub stream_name: String,
    pub consumer_group_name: String,
    pub partition_id: PartitionId,
}

impl PartitionIdentity {
    pub fn new(
        stream_name: impl Into<String>,
        consumer_group_name: impl Into<String>,
        partition_id: impl Into<PartitionId>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            consumer_group_name: consumer_group_name.into(),
            partition_id: partition_id.into(),
        }
    }
}

impl fmt::Display for PartitionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}",
            self.stream_name, self.consumer_group_name, self.partition_id
        )
    }
}

/// Coordination record asserting which processor currently reads a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub stream_name: String,
    pub consumer_group_name: String,
    pub partition_id: PartitionId,
    pub owner_id: Option<OwnerId>,
    /// Set by the store on every successful write.
    pub last_modified_time: Option<DateTime<Utc>>,
    /// Version token. `None` on a write means "expect no record to exist yet".
    pub etag: Option<ETag>,
}

impl OwnershipRecord {
    /// A record for a partition that has never been claimed.
    pub fn unclaimed(identity: PartitionIdentity) -> Self {
        Self {
            stream_name: identity.stream_name,
            consumer_group_name: identity.consumer_group_name,
            partition_id: identity.partition_id,
            owner_id: None,
            last_modified_time: None,
            etag: None,
        }
    }

    pub fn identity(&self) -> PartitionIdentity {
        PartitionIdentity::new(
            self.stream_name.clone(),
            self.consumer_group_name.clone(),
            self.partition_id.clone(),
        )
    }

    /// Owner id, treating an empty string the same as no owner.
    pub fn owner(&self) -> Option<&str> {
        self.owner_id.as_deref().filter(|owner| !owner.is_empty())
    }

    /// Whether the owner renewed this record within `timeout` of `now`.
    ///
    /// A modification time in the future (clock skew between instances) counts as live.
    pub fn is_live(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        if self.owner().is_none() {
            return false;
        }
        match self.last_modified_time {
            Some(modified) => now
                .signed_duration_since(modified)
                .to_std()
                .map(|elapsed| elapsed < timeout)
                .unwrap_or(true),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream_name: String,
    pub consumer_group_name: String,
    pub partition_id: PartitionId,
    pub offset: Offset,
    pub sequence_number: SequenceNumber,
}

impl Checkpoint {
    pub fn new(identity: PartitionIdentity, offset: Offset, sequence_number: SequenceNumber) -> Self {
        Self {
            stream_name: identity.stream_name,
            consumer_group_name: identity.consumer_group_name,
            partition_id: identity.partition_id,
            offset,
            sequence_number,
        }
    }

    pub fn identity(&self) -> PartitionIdentity {
        PartitionIdentity::new(
            self.stream_name.clone(),
            self.consumer_group_name.clone(),
            self.partition_id.clone(),
        )
    }
}

/// Where a partition consumer begins reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPosition {
    Earliest,
    Latest,
    Offset { offset: Offset, inclusive: bool },
    SequenceNumber { sequence_number: SequenceNumber, inclusive: bool },
}

impl EventPosition {
    /// Resume strictly after a checkpointed position.
    pub fn after_checkpoint(checkpoint: &Checkpoint) -> Self {
        EventPosition::Offset {
            offset: checkpoint.offset,
            inclusive: false,
        }
    }
}

impl Default for EventPosition {
    fn default() -> Self {
        EventPosition::Earliest
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPosition::Earliest => write!(f, "earliest"),
            EventPosition::Latest => write!(f, "latest"),
            EventPosition::Offset { offset, inclusive } => {
                write!(f, "offset {}{}", if *inclusive { ">=" } else { ">" }, offset)
            }
            EventPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => write!(
                f,
                "sequence {}{}",
                if *inclusive { ">=" } else { ">" },
                sequence_number
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub partition_id: PartitionId,
    pub offset: Offset,
    pub sequence_number: SequenceNumber,
    pub enqueued_time: DateTime<Utc>,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
}
