use chrono::{Duration as ChronoDuration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rustmq_processor::clock::SystemClock;
use rustmq_processor::config::StealPolicy;
use rustmq_processor::ownership::{LoadBalancer, OwnershipManager};
use rustmq_processor::storage::{InMemoryPartitionStore, OwnershipStore};
use rustmq_processor::stream::InMemoryEventStream;
use rustmq_processor::types::{OwnershipRecord, PartitionIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const TIMEOUT: Duration = Duration::from_secs(20);

// Ownership table where `owners` processors split the partitions round robin
fn owned_table(partitions: usize, owners: usize) -> (Vec<String>, Vec<OwnershipRecord>) {
    let now = Utc::now();
    let partition_ids: Vec<String> = (0..partitions).map(|p| p.to_string()).collect();
    let records = partition_ids
        .iter()
        .enumerate()
        .map(|(i, partition_id)| OwnershipRecord {
            owner_id: Some(format!("owner-{}", i % owners)),
            last_modified_time: Some(now - ChronoDuration::milliseconds(i as i64)),
            etag: Some(format!("etag-{}", i)),
            ..OwnershipRecord::unclaimed(PartitionIdentity::new("orders", "$default", partition_id.as_str()))
        })
        .collect();
    (partition_ids, records)
}

// Benchmark planning for a processor joining an already balanced group
fn bench_plan_newcomer(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_newcomer");

    for &partitions in &[32usize, 256, 1024] {
        let (partition_ids, records) = owned_table(partitions, 8);
        group.throughput(Throughput::Elements(partitions as u64));

        for policy in [StealPolicy::EarliestModified, StealPolicy::LargestOwnerFirst] {
            let balancer = LoadBalancer::new("newcomer", "orders", "$default", TIMEOUT, policy);
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", policy), partitions),
                &partitions,
                |b, _| {
                    b.iter(|| balancer.plan(&partition_ids, &records, Utc::now()));
                },
            );
        }
    }
    group.finish();
}

// Benchmark planning for a processor that already holds its share
fn bench_plan_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_steady_state");

    for &partitions in &[32usize, 256, 1024] {
        let (partition_ids, records) = owned_table(partitions, 8);
        let balancer = LoadBalancer::new(
            "owner-0",
            "orders",
            "$default",
            TIMEOUT,
            StealPolicy::EarliestModified,
        );
        group.throughput(Throughput::Elements(partitions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(partitions), &partitions, |b, _| {
            b.iter(|| balancer.plan(&partition_ids, &records, Utc::now()));
        });
    }
    group.finish();
}

// Benchmark a full claim cycle against the in-memory store
fn bench_claim_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("claim_cycle");

    for &partitions in &[32usize, 256] {
        let stream = Arc::new(InMemoryEventStream::new("orders", partitions));
        let store = Arc::new(InMemoryPartitionStore::new());
        let manager = OwnershipManager::new(
            "owner-0",
            "$default",
            stream,
            store.clone(),
            TIMEOUT,
            StealPolicy::EarliestModified,
            Arc::new(SystemClock),
        );
        rt.block_on(async {
            manager.claim_ownership().await.unwrap();
            assert_eq!(store.list_ownership("orders", "$default").await.unwrap().len(), partitions);
        });

        group.throughput(Throughput::Elements(partitions as u64));
        group.bench_with_input(BenchmarkId::new("renew_all", partitions), &partitions, |b, _| {
            b.to_async(&rt).iter(|| manager.claim_ownership());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_plan_newcomer,
    bench_plan_steady_state,
    bench_claim_cycle
);
criterion_main!(benches);
