//! In-process event stream.
//!
//! Each partition is an append-only log where an event's offset and sequence number are both
//! its index in the log. Consumers opened with an owner level are exclusive per consumer group:
//! opening a consumer at the same or a higher level supersedes the previous one, whose next
//! receive fails with [`StreamError::OwnershipStolen`].

use super::traits::*;
use crate::types::{EventData, EventPosition, PartitionId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

pub struct InMemoryEventStream {
    name: String,
    partition_ids: Vec<PartitionId>,
    partitions: HashMap<PartitionId, Arc<PartitionLog>>,
    next_consumer_id: AtomicU64,
    unavailable: AtomicBool,
}

struct PartitionLog {
    events: RwLock<Vec<EventData>>,
    /// Bumped on every append and every change of exclusive holder, to wake waiting receivers.
    changes: watch::Sender<u64>,
    /// consumer group -> (consumer id, owner level)
    exclusive_holders: Mutex<HashMap<String, (u64, i64)>>,
    injected_errors: Mutex<VecDeque<StreamError>>,
    opened: AtomicUsize,
    close_calls: AtomicUsize,
}

impl PartitionLog {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            events: RwLock::new(Vec::new()),
            changes,
            exclusive_holders: Mutex::new(HashMap::new()),
            injected_errors: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn read_from(&self, cursor: usize, max: usize) -> Vec<EventData> {
        let events = self.events.read();
        if cursor >= events.len() {
            return Vec::new();
        }
        let end = events.len().min(cursor.saturating_add(max));
        events[cursor..end].to_vec()
    }
}

impl InMemoryEventStream {
    /// A stream with partitions `"0"..partition_count`.
    pub fn new(name: impl Into<String>, partition_count: usize) -> Self {
        Self::with_partition_ids(name, (0..partition_count).map(|p| p.to_string()).collect())
    }

    pub fn with_partition_ids(name: impl Into<String>, partition_ids: Vec<PartitionId>) -> Self {
        let partitions = partition_ids
            .iter()
            .map(|id| (id.clone(), Arc::new(PartitionLog::new())))
            .collect();
        Self {
            name: name.into(),
            partition_ids,
            partitions,
            next_consumer_id: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
        }
    }

    fn partition(&self, partition_id: &str) -> Result<&Arc<PartitionLog>, StreamError> {
        self.partitions
            .get(partition_id)
            .ok_or_else(|| StreamError::Fatal(format!("partition {} does not exist", partition_id)))
    }

    /// Append one event and return it as stored.
    pub fn send(&self, partition_id: &str, body: impl Into<Bytes>) -> Result<EventData, StreamError> {
        self.send_with_properties(partition_id, body, HashMap::new())
    }

    pub fn send_with_properties(
        &self,
        partition_id: &str,
        body: impl Into<Bytes>,
        properties: HashMap<String, String>,
    ) -> Result<EventData, StreamError> {
        let log = self.partition(partition_id)?;
        let event = {
            let mut events = log.events.write();
            let position = events.len() as u64;
            let event = EventData {
                partition_id: partition_id.to_string(),
                offset: position,
                sequence_number: position,
                enqueued_time: Utc::now(),
                body: body.into(),
                properties,
            };
            events.push(event.clone());
            event
        };
        log.notify();
        Ok(event)
    }

    /// The next receive on `partition_id` (by any consumer) fails with `error`.
    pub fn inject_error(&self, partition_id: &str, error: StreamError) -> Result<(), StreamError> {
        let log = self.partition(partition_id)?;
        log.injected_errors.lock().push_back(error);
        log.notify();
        Ok(())
    }

    /// While unavailable, listing partitions and opening consumers fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn event_count(&self, partition_id: &str) -> usize {
        self.partitions
            .get(partition_id)
            .map(|log| log.events.read().len())
            .unwrap_or(0)
    }

    pub fn opened_consumers(&self, partition_id: &str) -> usize {
        self.partitions
            .get(partition_id)
            .map(|log| log.opened.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of `close()` calls made on consumers of this partition, including repeated ones.
    pub fn close_calls(&self, partition_id: &str) -> usize {
        self.partitions
            .get(partition_id)
            .map(|log| log.close_calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn open_consumers(&self, partition_id: &str) -> usize {
        self.opened_consumers(partition_id)
            .saturating_sub(self.close_calls(partition_id))
    }

    fn check_available(&self) -> Result<(), StreamError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StreamError::Transient(format!(
                "stream {} is unavailable",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStreamClient for InMemoryEventStream {
    fn stream_name(&self) -> &str {
        &self.name
    }

    async fn list_partition_ids(&self) -> Result<Vec<PartitionId>, StreamError> {
        self.check_available()?;
        Ok(self.partition_ids.clone())
    }

    async fn open_consumer(
        &self,
        consumer_group: &str,
        partition_id: &str,
        starting_position: EventPosition,
        options: ConsumerOptions,
    ) -> Result<Box<dyn PartitionConsumer>, StreamError> {
        self.check_available()?;
        let log = self.partition(partition_id)?.clone();
        let consumer_id = self.next_consumer_id.fetch_add(1, Ordering::SeqCst);

        if let Some(level) = options.owner_level {
            let mut holders = log.exclusive_holders.lock();
            if let Some((_, current)) = holders.get(consumer_group) {
                if *current > level {
                    return Err(StreamError::OwnershipStolen {
                        partition_id: partition_id.to_string(),
                        message: format!(
                            "a consumer with higher owner level {} is active",
                            current
                        ),
                    });
                }
            }
            holders.insert(consumer_group.to_string(), (consumer_id, level));
        }

        let cursor = {
            let events = log.events.read();
            match starting_position {
                EventPosition::Earliest => 0,
                EventPosition::Latest => events.len(),
                EventPosition::Offset { offset, inclusive }
                | EventPosition::SequenceNumber {
                    sequence_number: offset,
                    inclusive,
                } => {
                    let start = if inclusive { offset } else { offset.saturating_add(1) };
                    start as usize
                }
            }
        };

        log.opened.fetch_add(1, Ordering::SeqCst);
        log.notify();
        debug!(
            "Opened consumer {} on {}:{} for group {} at index {}",
            consumer_id, self.name, partition_id, consumer_group, cursor
        );

        let updates = log.changes.subscribe();
        Ok(Box::new(InMemoryPartitionConsumer {
            log,
            partition_id: partition_id.to_string(),
            consumer_group: consumer_group.to_string(),
            consumer_id,
            exclusive: options.owner_level.is_some(),
            cursor,
            updates,
            closed: false,
        }))
    }
}

pub struct InMemoryPartitionConsumer {
    log: Arc<PartitionLog>,
    partition_id: PartitionId,
    consumer_group: String,
    consumer_id: u64,
    exclusive: bool,
    cursor: usize,
    updates: watch::Receiver<u64>,
    closed: bool,
}

impl InMemoryPartitionConsumer {
    fn check_exclusive(&self) -> Result<(), StreamError> {
        if !self.exclusive {
            return Ok(());
        }
        let holders = self.log.exclusive_holders.lock();
        match holders.get(&self.consumer_group) {
            Some((holder, level)) if *holder != self.consumer_id => Err(StreamError::OwnershipStolen {
                partition_id: self.partition_id.clone(),
                message: format!("superseded by consumer with owner level {}", level),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PartitionConsumer for InMemoryPartitionConsumer {
    async fn receive(
        &mut self,
        max_batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<EventData>, StreamError> {
        if self.closed {
            return Err(StreamError::Fatal("consumer is closed".to_string()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.updates.borrow_and_update();

            if let Some(error) = self.log.injected_errors.lock().pop_front() {
                return Err(error);
            }
            self.check_exclusive()?;

            let batch = self.log.read_from(self.cursor, max_batch_size);
            if !batch.is_empty() {
                self.cursor += batch.len();
                return Ok(batch);
            }

            match tokio::time::timeout_at(deadline, self.updates.changed()).await {
                Err(_) => return Ok(Vec::new()),
                Ok(Err(_)) => {
                    return Err(StreamError::Fatal(format!(
                        "partition {} was removed",
                        self.partition_id
                    )))
                }
                Ok(Ok(())) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.log.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut holders = self.log.exclusive_holders.lock();
        if matches!(holders.get(&self.consumer_group), Some((holder, _)) if *holder == self.consumer_id)
        {
            holders.remove(&self.consumer_group);
        }
        Ok(())
    }
}
