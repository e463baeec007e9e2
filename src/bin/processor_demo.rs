//! RustMQ event processor demo
//!
//! Runs several event processors in one process against the in-memory stream and partition
//! store, feeds events into every partition and prints how partitions were spread across the
//! processors and how far each partition was checkpointed.

use async_trait::async_trait;
use clap::Parser;
use rustmq_processor::storage::{CheckpointStore, InMemoryPartitionStore, OwnershipStore};
use rustmq_processor::stream::InMemoryEventStream;
use rustmq_processor::types::EventData;
use rustmq_processor::{
    EventProcessor, PartitionContext, PartitionProcessor, ProcessorConfig, Result,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rustmq-processor-demo")]
#[command(about = "Run cooperating event processors against an in-memory stream")]
struct Args {
    /// Number of partitions in the stream
    #[arg(long, default_value = "8")]
    partitions: usize,

    /// Number of processors sharing the consumer group
    #[arg(long, default_value = "3")]
    instances: usize,

    /// How long to run, in seconds
    #[arg(long, default_value = "10")]
    duration_secs: u64,

    /// Claim cycle interval in milliseconds
    #[arg(long, default_value = "500")]
    polling_interval_ms: u64,

    /// Events produced per partition per second
    #[arg(long, default_value = "20")]
    events_per_second: u64,

    /// Stop the first processor halfway through to show takeover
    #[arg(long)]
    stop_one: bool,

    /// Optional processor configuration file (TOML)
    #[arg(long)]
    config: Option<String>,
}

struct CountingProcessor {
    processed: Arc<AtomicU64>,
}

#[async_trait]
impl PartitionProcessor for CountingProcessor {
    async fn initialize(&mut self, context: &PartitionContext) -> anyhow::Result<()> {
        info!(
            "{} took partition {}",
            context.owner_id(),
            context.partition_id()
        );
        Ok(())
    }

    async fn process_events(
        &mut self,
        events: Vec<EventData>,
        context: &PartitionContext,
    ) -> anyhow::Result<()> {
        if let Some(last) = events.last() {
            self.processed.fetch_add(events.len() as u64, Ordering::Relaxed);
            context.checkpoint_event(last).await?;
        }
        Ok(())
    }

    async fn close(
        &mut self,
        reason: rustmq_processor::CloseReason,
        context: &PartitionContext,
    ) -> anyhow::Result<()> {
        info!(
            "{} released partition {}: {}",
            context.owner_id(),
            context.partition_id(),
            reason
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let base_config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            match ProcessorConfig::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    error!("Failed to load configuration: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => ProcessorConfig {
            polling_interval_ms: args.polling_interval_ms,
            receive_timeout_ms: 200,
            max_batch_size: 50,
            ..Default::default()
        },
    };

    let stream = Arc::new(InMemoryEventStream::new("demo-stream", args.partitions));
    let store = Arc::new(InMemoryPartitionStore::new());
    let processed = Arc::new(AtomicU64::new(0));

    let mut processors = Vec::with_capacity(args.instances);
    for instance in 0..args.instances {
        let config = ProcessorConfig {
            owner_id: Some(format!("processor-{}", instance)),
            ..base_config.clone()
        };
        let counter = processed.clone();
        let processor = EventProcessor::new(
            stream.clone(),
            store.clone(),
            store.clone(),
            move |_: &str| CountingProcessor {
                processed: counter.clone(),
            },
            config,
        )?;
        processor.start().await;
        processors.push(processor);
    }

    let producer_stream = stream.clone();
    let partitions = args.partitions;
    let interval = Duration::from_millis((1000 / args.events_per_second.max(1)).max(1));
    let producer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut sequence = 0u64;
        loop {
            ticker.tick().await;
            for partition in 0..partitions {
                let partition_id = partition.to_string();
                if let Err(e) = producer_stream.send(&partition_id, format!("event-{}", sequence)) {
                    error!("Failed to produce to partition {}: {}", partition_id, e);
                }
            }
            sequence += 1;
        }
    });

    let total = Duration::from_secs(args.duration_secs);
    if args.stop_one && !processors.is_empty() {
        tokio::time::sleep(total / 2).await;
        info!("Stopping {}", processors[0].id());
        processors[0].stop().await;
        tokio::time::sleep(total / 2).await;
    } else {
        tokio::time::sleep(total).await;
    }

    print_distribution(&processors);
    producer.abort();
    for processor in &processors {
        processor.stop().await;
    }

    let ownership = store.list_ownership("demo-stream", &base_config.consumer_group).await?;
    let checkpoints = store
        .list_checkpoints("demo-stream", &base_config.consumer_group)
        .await?;
    let checkpointed: BTreeMap<_, _> = checkpoints
        .iter()
        .map(|c| (c.partition_id.clone(), c.offset))
        .collect();

    println!("\nPartition  Last owner      Checkpoint  Produced");
    for record in &ownership {
        println!(
            "{:<10} {:<15} {:<11} {}",
            record.partition_id,
            record.owner().unwrap_or("-"),
            checkpointed
                .get(&record.partition_id)
                .map(|offset| offset.to_string())
                .unwrap_or_else(|| "-".to_string()),
            stream.event_count(&record.partition_id)
        );
    }
    println!("\nEvents processed: {}", processed.load(Ordering::Relaxed));

    Ok(())
}

fn print_distribution<F: rustmq_processor::PartitionProcessorFactory>(
    processors: &[EventProcessor<F>],
) {
    println!("\nProcessor       State     Partitions");
    for processor in processors {
        let status = processor.status();
        let partitions: Vec<&str> = status.partitions.keys().map(String::as_str).collect();
        println!(
            "{:<15} {:<9} {}",
            status.id,
            format!("{:?}", status.state),
            partitions.join(",")
        );
    }
}
