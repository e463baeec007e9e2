use super::context::PartitionContext;
use super::partition::{CloseReason, PartitionProcessorFactory};
use super::task::{PartitionTask, TaskSettings, TaskState};
use crate::clock::{Clock, SystemClock};
use crate::config::ProcessorConfig;
use crate::metrics::ProcessorMetrics;
use crate::ownership::OwnershipManager;
use crate::storage::{CheckpointStore, OwnershipStore};
use crate::stream::EventStreamClient;
use crate::types::*;
use crate::Result;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Stopped,
    Running,
}

/// Snapshot returned by [`EventProcessor::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStatus {
    pub id: OwnerId,
    pub state: ProcessorState,
    /// Partitions this processor is consuming, with their task state
    pub partitions: BTreeMap<PartitionId, TaskState>,
}

struct PartitionTaskHandle {
    cancel: CancellationToken,
    state: watch::Receiver<TaskState>,
    join: JoinHandle<CloseReason>,
}

/// One start/stop cycle of the claim loop.
struct RunHandle {
    /// Cancelled by `stop`; every task spawned during the run listens on a child of it
    shutdown: CancellationToken,
    claim_loop: JoinHandle<()>,
}

#[derive(Default)]
struct TaskTable {
    active: HashMap<PartitionId, PartitionTaskHandle>,
    /// Cancelled tasks that may still be running their close path
    closing: Vec<(PartitionId, PartitionTaskHandle)>,
}

struct Inner<F: PartitionProcessorFactory> {
    id: OwnerId,
    config: ProcessorConfig,
    stream_client: Arc<dyn EventStreamClient>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    ownership: OwnershipManager,
    factory: F,
    /// `Some` while running
    run: Mutex<Option<RunHandle>>,
    tasks: Mutex<TaskTable>,
    metrics: Arc<ProcessorMetrics>,
}

/// Cooperatively consumes every partition of one stream together with other processors in the
/// same consumer group.
///
/// Each polling interval the processor renews and claims ownership through the ownership store,
/// then starts a consumption task for every newly held partition and cancels the tasks of
/// partitions it no longer holds. Per-partition failures only ever end that partition's task.
pub struct EventProcessor<F: PartitionProcessorFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: PartitionProcessorFactory> Clone for EventProcessor<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: PartitionProcessorFactory> EventProcessor<F> {
    pub fn new(
        stream_client: Arc<dyn EventStreamClient>,
        ownership_store: Arc<dyn OwnershipStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        factory: F,
        config: ProcessorConfig,
    ) -> Result<Self> {
        Self::with_clock(
            stream_client,
            ownership_store,
            checkpoint_store,
            factory,
            config,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        stream_client: Arc<dyn EventStreamClient>,
        ownership_store: Arc<dyn OwnershipStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        factory: F,
        config: ProcessorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let id = config
            .owner_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ownership = OwnershipManager::new(
            id.clone(),
            config.consumer_group.clone(),
            stream_client.clone(),
            ownership_store,
            config.ownership_timeout(),
            config.load_balancing.steal_policy,
            clock,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                stream_client,
                checkpoint_store,
                ownership,
                factory,
                run: Mutex::new(None),
                tasks: Mutex::new(TaskTable::default()),
                metrics: ProcessorMetrics::new()?,
            }),
        })
    }

    /// The owner id this processor writes into ownership records.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn metrics(&self) -> &Arc<ProcessorMetrics> {
        &self.inner.metrics
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    /// Start the claim loop in the background. Calling this while running does nothing.
    pub async fn start(&self) {
        let mut run = self.inner.run.lock();
        if run.is_some() {
            debug!("Event processor {} is already running", self.inner.id);
            return;
        }

        info!(
            "Starting event processor {} on {}/{}",
            self.inner.id,
            self.inner.stream_client.stream_name(),
            self.inner.config.consumer_group
        );
        let shutdown = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_shutdown = shutdown.clone();
        let claim_loop = tokio::spawn(async move { inner.run_claim_loop(loop_shutdown).await });
        *run = Some(RunHandle {
            shutdown,
            claim_loop,
        });
    }

    /// Stop claiming, cancel every partition task and wait up to the shutdown grace period for
    /// their close paths and the claim loop. Ownership records are left in place and expire on
    /// their own.
    pub async fn stop(&self) {
        let (claim_loop, handles) = {
            let mut run = self.inner.run.lock();
            let Some(current) = run.take() else {
                debug!("Event processor {} is not running", self.inner.id);
                return;
            };
            info!("Stopping event processor {}", self.inner.id);
            // Cancels the claim loop and every task of this run
            current.shutdown.cancel();

            let mut tasks = self.inner.tasks.lock();
            let active: Vec<_> = tasks.active.drain().collect();
            let handles: Vec<(PartitionId, JoinHandle<CloseReason>)> = active
                .into_iter()
                .chain(tasks.closing.drain(..))
                .map(|(partition_id, handle)| (partition_id, handle.join))
                .collect();
            (current.claim_loop, handles)
        };
        self.inner.metrics.owned_partitions.set(0);

        let grace = self.inner.config.shutdown_grace_period();
        let deadline = Instant::now() + grace;
        let (partition_ids, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        match timeout_at(deadline, join_all(joins)).await {
            Ok(results) => {
                for (partition_id, result) in partition_ids.iter().zip(results) {
                    match result {
                        Ok(reason) => debug!("Partition {} closed: {}", partition_id, reason),
                        Err(e) => error!("Task for partition {} failed: {}", partition_id, e),
                    }
                }
            }
            Err(_) => warn!(
                "Event processor {}: partition tasks did not close within {:?}",
                self.inner.id, grace
            ),
        }

        if timeout_at(deadline, claim_loop).await.is_err() {
            warn!(
                "Event processor {}: claim loop did not exit within {:?}",
                self.inner.id, grace
            );
        }
        info!("Event processor {} stopped", self.inner.id);
    }

    pub fn status(&self) -> ProcessorStatus {
        let partitions = self
            .inner
            .tasks
            .lock()
            .active
            .iter()
            .map(|(partition_id, handle)| (partition_id.clone(), *handle.state.borrow()))
            .collect();

        ProcessorStatus {
            id: self.inner.id.clone(),
            state: if self.is_running() {
                ProcessorState::Running
            } else {
                ProcessorState::Stopped
            },
            partitions,
        }
    }
}

impl<F: PartitionProcessorFactory> Inner<F> {
    async fn run_claim_loop(&self, shutdown: CancellationToken) {
        let polling_interval = self.config.polling_interval();

        while !shutdown.is_cancelled() {
            let claimed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.ownership.claim_ownership() => result,
            };

            match claimed {
                Ok(records) => {
                    self.metrics.claim_cycles.inc();
                    self.reconcile(&records, &shutdown);
                }
                Err(e) => {
                    // Running tasks keep their partitions; their leases are still valid.
                    self.metrics.claim_failures.inc();
                    warn!(
                        "Event processor {} failed to claim ownership, retrying in {:?}: {}",
                        self.id, polling_interval, e
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(polling_interval) => {}
            }
        }
        debug!("Claim loop of event processor {} exited", self.id);
    }

    /// Bring the task table in line with the partitions claimed this cycle.
    fn reconcile(&self, claimed: &[OwnershipRecord], shutdown: &CancellationToken) {
        let claimed_ids: HashSet<&str> = claimed.iter().map(|r| r.partition_id.as_str()).collect();

        let mut tasks = self.tasks.lock();
        if shutdown.is_cancelled() {
            return;
        }

        tasks.closing.retain(|(_, handle)| !handle.join.is_finished());

        let finished: Vec<PartitionId> = tasks
            .active
            .iter()
            .filter(|(_, handle)| handle.join.is_finished())
            .map(|(partition_id, _)| partition_id.clone())
            .collect();
        for partition_id in finished {
            tasks.active.remove(&partition_id);
            debug!("Reaped finished task for partition {}", partition_id);
        }

        let to_cancel: Vec<PartitionId> = tasks
            .active
            .keys()
            .filter(|partition_id| !claimed_ids.contains(partition_id.as_str()))
            .cloned()
            .collect();
        for partition_id in to_cancel {
            if let Some(handle) = tasks.active.remove(&partition_id) {
                info!(
                    "Event processor {} no longer owns partition {}, cancelling its task",
                    self.id, partition_id
                );
                handle.cancel.cancel();
                tasks.closing.push((partition_id, handle));
            }
        }

        for record in claimed {
            if !tasks.active.contains_key(&record.partition_id) {
                let handle = self.spawn_task(&record.partition_id, shutdown);
                tasks.active.insert(record.partition_id.clone(), handle);
            }
        }

        self.metrics.owned_partitions.set(tasks.active.len() as i64);
    }

    fn spawn_task(&self, partition_id: &str, shutdown: &CancellationToken) -> PartitionTaskHandle {
        let cancel = shutdown.child_token();
        let (state_tx, state) = watch::channel(TaskState::Initializing);
        let identity = PartitionIdentity::new(
            self.stream_client.stream_name(),
            self.config.consumer_group.clone(),
            partition_id,
        );

        let task = PartitionTask {
            processor: self.factory.create(partition_id),
            context: PartitionContext::new(
                identity,
                self.id.clone(),
                self.checkpoint_store.clone(),
                self.metrics.clone(),
            ),
            stream_client: self.stream_client.clone(),
            checkpoint_store: self.checkpoint_store.clone(),
            settings: TaskSettings {
                initial_position: self.config.initial_position.clone(),
                owner_level: self.config.owner_level,
                max_batch_size: self.config.max_batch_size,
                receive_timeout: self.config.receive_timeout(),
            },
            cancel: cancel.clone(),
            shutdown: shutdown.clone(),
            state: state_tx,
            metrics: self.metrics.clone(),
        };

        info!(
            "Event processor {} starting task for partition {}",
            self.id, partition_id
        );
        self.metrics.partition_tasks_started.inc();
        PartitionTaskHandle {
            cancel,
            state,
            join: tokio::spawn(task.run()),
        }
    }
}
