use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Per-processor metrics. Each processor owns its registry so several instances can share a process.
pub struct ProcessorMetrics {
    pub claim_cycles: IntCounter,
    pub claim_failures: IntCounter,
    pub owned_partitions: IntGauge,
    pub partition_tasks_started: IntCounter,
    pub partition_tasks_closed: IntCounterVec,
    pub events_received: IntCounter,
    pub checkpoints_written: IntCounter,
    pub registry: Registry,
}

impl ProcessorMetrics {
    pub fn new() -> crate::Result<Arc<Self>> {
        let registry = Registry::new();

        let claim_cycles = IntCounter::new(
            "processor_claim_cycles_total",
            "Total number of completed ownership claim cycles",
        )?;

        let claim_failures = IntCounter::new(
            "processor_claim_failures_total",
            "Total number of claim cycles that failed to reach the ownership store",
        )?;

        let owned_partitions = IntGauge::new(
            "processor_owned_partitions",
            "Number of partitions currently consumed by this processor",
        )?;

        let partition_tasks_started = IntCounter::new(
            "processor_partition_tasks_started_total",
            "Total number of partition consumption tasks started",
        )?;

        let partition_tasks_closed = IntCounterVec::new(
            Opts::new(
                "processor_partition_tasks_closed_total",
                "Total number of partition consumption tasks closed, by close reason",
            ),
            &["reason"],
        )?;

        let events_received = IntCounter::new(
            "processor_events_received_total",
            "Total number of events handed to partition processors",
        )?;

        let checkpoints_written = IntCounter::new(
            "processor_checkpoints_written_total",
            "Total number of successful checkpoint writes",
        )?;

        registry.register(Box::new(claim_cycles.clone()))?;
        registry.register(Box::new(claim_failures.clone()))?;
        registry.register(Box::new(owned_partitions.clone()))?;
        registry.register(Box::new(partition_tasks_started.clone()))?;
        registry.register(Box::new(partition_tasks_closed.clone()))?;
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(checkpoints_written.clone()))?;

        Ok(Arc::new(Self {
            claim_cycles,
            claim_failures,
            owned_partitions,
            partition_tasks_started,
            partition_tasks_closed,
            events_received,
            checkpoints_written,
            registry,
        }))
    }

    pub fn closed_with(&self, reason: &str) -> u64 {
        self.partition_tasks_closed.with_label_values(&[reason]).get()
    }
}
