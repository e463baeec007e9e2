use super::context::PartitionContext;
use super::partition::{CloseReason, PartitionProcessor};
use crate::error::ProcessorError;
use crate::metrics::ProcessorMetrics;
use crate::storage::CheckpointStore;
use crate::stream::{ConsumerOptions, EventStreamClient, PartitionConsumer, StreamError};
use crate::types::EventPosition;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of one partition consumption task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Initializing,
    Receiving,
    Processing,
    Closing,
    Closed,
}

/// Per-task copy of the settings a consumption task needs.
#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    pub initial_position: EventPosition,
    pub owner_level: Option<i64>,
    pub max_batch_size: usize,
    pub receive_timeout: Duration,
}

/// Consumes one partition until cancelled or a failure ends it.
pub(crate) struct PartitionTask<P: PartitionProcessor> {
    pub processor: P,
    pub context: PartitionContext,
    pub stream_client: Arc<dyn EventStreamClient>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub settings: TaskSettings,
    pub cancel: CancellationToken,
    /// Cancelled when the run that spawned this task stops; `cancel` is a child of it
    pub shutdown: CancellationToken,
    pub state: watch::Sender<TaskState>,
    pub metrics: Arc<ProcessorMetrics>,
}

impl<P: PartitionProcessor> PartitionTask<P> {
    pub async fn run(mut self) -> CloseReason {
        let mut consumer: Option<Box<dyn PartitionConsumer>> = None;
        let reason = self.consume(&mut consumer).await;

        self.state.send_replace(TaskState::Closing);
        info!(
            "Closing partition {} of {} for owner {}: {}",
            self.context.partition_id(),
            self.context.stream_name(),
            self.context.owner_id(),
            reason
        );

        if let Err(e) = guarded(self.processor.close(reason, &self.context)).await {
            error!(
                "Close hook for partition {} failed: {:#}",
                self.context.partition_id(),
                e
            );
        }

        if let Some(mut consumer) = consumer.take() {
            if let Err(e) = consumer.close().await {
                warn!(
                    "Failed to close consumer for partition {}: {}",
                    self.context.partition_id(),
                    e
                );
            }
        }

        self.metrics
            .partition_tasks_closed
            .with_label_values(&[reason.as_str()])
            .inc();
        self.state.send_replace(TaskState::Closed);
        reason
    }

    /// Runs until something ends the task and reports why. The opened consumer is left in
    /// `consumer` for the caller to release.
    async fn consume(&mut self, consumer: &mut Option<Box<dyn PartitionConsumer>>) -> CloseReason {
        let partition_id = self.context.partition_id().to_string();

        let checkpoint = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled_reason(),
            result = self.checkpoint_store.read_checkpoint(self.context.identity()) => result,
        };
        let starting_position = match checkpoint {
            Ok(Some(checkpoint)) => EventPosition::after_checkpoint(&checkpoint),
            Ok(None) => self.settings.initial_position.clone(),
            Err(e) => {
                self.report_error(e).await;
                return CloseReason::ProcessEventsError;
            }
        };

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled_reason(),
            result = self.stream_client.open_consumer(
                self.context.consumer_group_name(),
                &partition_id,
                starting_position.clone(),
                ConsumerOptions {
                    owner_level: self.settings.owner_level,
                },
            ) => result,
        };
        match opened {
            Ok(opened) => *consumer = Some(opened),
            Err(e) => return self.stream_failure(e).await,
        }
        info!(
            "Consuming partition {} of {} from {} as {}",
            partition_id,
            self.context.stream_name(),
            starting_position,
            self.context.owner_id()
        );

        let initialized = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled_reason(),
            result = guarded(self.processor.initialize(&self.context)) => result,
        };
        if let Err(e) = initialized {
            self.report_error(ProcessorError::ProcessEvents(e)).await;
            return CloseReason::ProcessEventsError;
        }

        let Some(receiver) = consumer.as_mut() else {
            return CloseReason::EventStreamError;
        };

        loop {
            self.state.send_replace(TaskState::Receiving);
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled_reason(),
                result = receiver.receive(self.settings.max_batch_size, self.settings.receive_timeout) => result,
            };
            let events = match received {
                Ok(events) => events,
                Err(e) => return self.stream_failure(e).await,
            };

            self.state.send_replace(TaskState::Processing);
            self.metrics.events_received.inc_by(events.len() as u64);
            debug!("Partition {} received {} events", partition_id, events.len());

            let processed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled_reason(),
                result = guarded(self.processor.process_events(events, &self.context)) => result,
            };
            if let Err(e) = processed {
                self.report_error(ProcessorError::ProcessEvents(e)).await;
                return CloseReason::ProcessEventsError;
            }
        }
    }

    fn cancelled_reason(&self) -> CloseReason {
        if self.shutdown.is_cancelled() {
            CloseReason::Shutdown
        } else {
            CloseReason::OwnershipLost
        }
    }

    async fn stream_failure(&mut self, error: StreamError) -> CloseReason {
        if error.is_ownership_stolen() {
            info!(
                "Partition {} was taken over by another consumer: {}",
                self.context.partition_id(),
                error
            );
            return CloseReason::OwnershipLost;
        }
        self.report_error(ProcessorError::Stream(error)).await;
        CloseReason::EventStreamError
    }

    async fn report_error(&mut self, error: ProcessorError) {
        warn!(
            "Partition {} of {} failed ({}): {}",
            self.context.partition_id(),
            self.context.stream_name(),
            error.category(),
            error
        );
        if let Err(e) = guarded(self.processor.process_error(&error, &self.context)).await {
            error!(
                "Error hook for partition {} failed: {:#}",
                self.context.partition_id(),
                e
            );
        }
    }
}

/// Await a user hook, turning a panic into an error.
async fn guarded<F>(hook: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "partition processor panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryPartitionStore;
    use crate::stream::InMemoryEventStream;
    use crate::types::{Checkpoint, EventData, PartitionIdentity};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct Calls {
        initialized: usize,
        batches: Vec<Vec<u64>>,
        errors: Vec<String>,
        closed: Vec<CloseReason>,
    }

    struct Recorder {
        calls: Arc<Mutex<Calls>>,
        fail_on_batch: Option<usize>,
        panic_on_batch: Option<usize>,
        stall_on_batch: Option<usize>,
        checkpoint: bool,
    }

    #[async_trait]
    impl PartitionProcessor for Recorder {
        async fn initialize(&mut self, _context: &PartitionContext) -> anyhow::Result<()> {
            self.calls.lock().initialized += 1;
            Ok(())
        }

        async fn process_events(
            &mut self,
            events: Vec<EventData>,
            context: &PartitionContext,
        ) -> anyhow::Result<()> {
            if events.is_empty() {
                return Ok(());
            }
            let batch = {
                let mut calls = self.calls.lock();
                calls.batches.push(events.iter().map(|e| e.offset).collect());
                calls.batches.len()
            };
            if self.stall_on_batch == Some(batch) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.panic_on_batch == Some(batch) {
                panic!("boom on batch {}", batch);
            }
            if self.fail_on_batch == Some(batch) {
                anyhow::bail!("cannot handle batch {}", batch);
            }
            if self.checkpoint {
                if let Some(last) = events.last() {
                    context.checkpoint_event(last).await?;
                }
            }
            Ok(())
        }

        async fn process_error(
            &mut self,
            error: &ProcessorError,
            _context: &PartitionContext,
        ) -> anyhow::Result<()> {
            self.calls.lock().errors.push(error.category().to_string());
            anyhow::bail!("error hooks may fail too")
        }

        async fn close(&mut self, reason: CloseReason, _context: &PartitionContext) -> anyhow::Result<()> {
            self.calls.lock().closed.push(reason);
            Ok(())
        }
    }

    struct Harness {
        stream: Arc<InMemoryEventStream>,
        store: Arc<InMemoryPartitionStore>,
        calls: Arc<Mutex<Calls>>,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        state: watch::Receiver<TaskState>,
        handle: JoinHandle<CloseReason>,
    }

    fn spawn_task(
        stream: Arc<InMemoryEventStream>,
        store: Arc<InMemoryPartitionStore>,
        recorder: impl FnOnce(Arc<Mutex<Calls>>) -> Recorder,
    ) -> Harness {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let shutdown = CancellationToken::new();
        let cancel = shutdown.child_token();
        let metrics = ProcessorMetrics::new().unwrap();
        let (state_tx, state) = watch::channel(TaskState::Initializing);

        let task = PartitionTask {
            processor: recorder(calls.clone()),
            context: PartitionContext::new(
                PartitionIdentity::new("orders", "$default", "0"),
                "owner-a".to_string(),
                store.clone(),
                metrics.clone(),
            ),
            stream_client: stream.clone(),
            checkpoint_store: store.clone(),
            settings: TaskSettings {
                initial_position: EventPosition::Earliest,
                owner_level: Some(0),
                max_batch_size: 2,
                receive_timeout: Duration::from_millis(20),
            },
            cancel: cancel.clone(),
            shutdown: shutdown.clone(),
            state: state_tx,
            metrics,
        };

        Harness {
            stream,
            store,
            calls,
            cancel,
            shutdown,
            state,
            handle: tokio::spawn(task.run()),
        }
    }

    fn recorder(calls: Arc<Mutex<Calls>>) -> Recorder {
        Recorder {
            calls,
            fail_on_batch: None,
            panic_on_batch: None,
            stall_on_batch: None,
            checkpoint: false,
        }
    }

    fn new_stream(events: usize) -> Arc<InMemoryEventStream> {
        let stream = Arc::new(InMemoryEventStream::new("orders", 1));
        for i in 0..events {
            stream.send("0", format!("event-{}", i)).unwrap();
        }
        stream
    }

    async fn wait_for_batches(calls: &Arc<Mutex<Calls>>, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.lock().batches.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_running_means_ownership_lost() {
        let h = spawn_task(new_stream(3), Arc::new(InMemoryPartitionStore::new()), recorder);
        wait_for_batches(&h.calls, 2).await;

        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap(), CloseReason::OwnershipLost);

        let calls = h.calls.lock();
        assert_eq!(calls.initialized, 1);
        assert_eq!(calls.batches, vec![vec![0, 1], vec![2]]);
        assert_eq!(calls.closed, vec![CloseReason::OwnershipLost]);
        assert!(calls.errors.is_empty());
        assert_eq!(h.stream.close_calls("0"), 1);
        assert_eq!(*h.state.borrow(), TaskState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_after_stop_means_shutdown() {
        let h = spawn_task(new_stream(0), Arc::new(InMemoryPartitionStore::new()), recorder);
        tokio::time::sleep(Duration::from_millis(30)).await;

        h.shutdown.cancel();
        assert!(h.cancel.is_cancelled());
        assert_eq!(h.handle.await.unwrap(), CloseReason::Shutdown);
        assert_eq!(h.calls.lock().closed, vec![CloseReason::Shutdown]);
        assert_eq!(h.stream.close_calls("0"), 1);
        assert_eq!(h.stream.open_consumers("0"), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_processing_closes_once() {
        for (stopping, expected) in [
            (false, CloseReason::OwnershipLost),
            (true, CloseReason::Shutdown),
        ] {
            let h = spawn_task(new_stream(3), Arc::new(InMemoryPartitionStore::new()), |calls| {
                Recorder {
                    stall_on_batch: Some(1),
                    ..recorder(calls)
                }
            });
            wait_for_batches(&h.calls, 1).await;
            assert_eq!(*h.state.borrow(), TaskState::Processing);

            if stopping {
                h.shutdown.cancel();
            } else {
                h.cancel.cancel();
            }
            assert_eq!(h.handle.await.unwrap(), expected);

            let calls = h.calls.lock();
            assert_eq!(calls.batches, vec![vec![0, 1]]);
            assert_eq!(calls.closed, vec![expected]);
            assert!(calls.errors.is_empty());
            assert_eq!(h.stream.close_calls("0"), 1);
            assert_eq!(h.stream.open_consumers("0"), 0);
            assert_eq!(*h.state.borrow(), TaskState::Closed);
        }
    }

    #[tokio::test]
    async fn test_processing_failure_closes_task() {
        let h = spawn_task(new_stream(10), Arc::new(InMemoryPartitionStore::new()), |calls| Recorder {
            fail_on_batch: Some(3),
            ..recorder(calls)
        });

        assert_eq!(h.handle.await.unwrap(), CloseReason::ProcessEventsError);
        let calls = h.calls.lock();
        assert_eq!(calls.batches.len(), 3);
        assert_eq!(calls.errors, vec!["process_events".to_string()]);
        assert_eq!(calls.closed, vec![CloseReason::ProcessEventsError]);
        assert_eq!(h.stream.close_calls("0"), 1);
    }

    #[tokio::test]
    async fn test_panic_in_processing_is_contained() {
        let h = spawn_task(new_stream(4), Arc::new(InMemoryPartitionStore::new()), |calls| Recorder {
            panic_on_batch: Some(1),
            ..recorder(calls)
        });

        assert_eq!(h.handle.await.unwrap(), CloseReason::ProcessEventsError);
        assert_eq!(h.calls.lock().closed, vec![CloseReason::ProcessEventsError]);
        assert_eq!(h.stream.close_calls("0"), 1);
    }

    #[tokio::test]
    async fn test_stream_errors_are_classified() {
        let stream = new_stream(0);
        stream
            .inject_error("0", StreamError::Transient("link reset".to_string()))
            .unwrap();
        let h = spawn_task(stream, Arc::new(InMemoryPartitionStore::new()), recorder);
        assert_eq!(h.handle.await.unwrap(), CloseReason::EventStreamError);
        assert_eq!(h.calls.lock().errors, vec!["transient".to_string()]);

        let stream = new_stream(0);
        stream
            .inject_error(
                "0",
                StreamError::OwnershipStolen {
                    partition_id: "0".to_string(),
                    message: "epoch".to_string(),
                },
            )
            .unwrap();
        let h = spawn_task(stream, Arc::new(InMemoryPartitionStore::new()), recorder);
        assert_eq!(h.handle.await.unwrap(), CloseReason::OwnershipLost);
        assert!(h.calls.lock().errors.is_empty());
        assert_eq!(h.stream.close_calls("0"), 1);
    }

    #[tokio::test]
    async fn test_resumes_after_checkpoint() {
        let store = Arc::new(InMemoryPartitionStore::new());
        store
            .write_checkpoint(
                Checkpoint::new(PartitionIdentity::new("orders", "$default", "0"), 4, 4),
                "owner-a",
            )
            .await
            .unwrap();

        let h = spawn_task(new_stream(8), store, recorder);
        wait_for_batches(&h.calls, 2).await;
        h.cancel.cancel();
        h.handle.await.unwrap();

        assert_eq!(h.calls.lock().batches, vec![vec![5, 6], vec![7]]);
    }

    #[tokio::test]
    async fn test_checkpoint_read_failure_closes_without_consumer() {
        let store = Arc::new(InMemoryPartitionStore::new());
        store.set_unavailable(true);
        let h = spawn_task(new_stream(2), store, recorder);

        assert_eq!(h.handle.await.unwrap(), CloseReason::ProcessEventsError);
        let calls = h.calls.lock();
        assert_eq!(calls.errors, vec!["store".to_string()]);
        assert_eq!(calls.initialized, 0);
        assert_eq!(calls.closed, vec![CloseReason::ProcessEventsError]);
        assert_eq!(h.stream.opened_consumers("0"), 0);
        assert_eq!(h.stream.close_calls("0"), 0);
    }

    #[tokio::test]
    async fn test_checkpoints_written_from_processing() {
        let store = Arc::new(InMemoryPartitionStore::new());
        let h = spawn_task(new_stream(3), store, |calls| Recorder {
            checkpoint: true,
            ..recorder(calls)
        });
        wait_for_batches(&h.calls, 2).await;
        h.cancel.cancel();
        h.handle.await.unwrap();

        let identity = PartitionIdentity::new("orders", "$default", "0");
        let checkpoint = h.store.read_checkpoint(&identity).await.unwrap().unwrap();
        assert_eq!(checkpoint.offset, 2);
    }
}
