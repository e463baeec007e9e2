use super::balancer::LoadBalancer;
use crate::clock::Clock;
use crate::config::StealPolicy;
use crate::storage::OwnershipStore;
use crate::stream::EventStreamClient;
use crate::types::*;
use crate::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Runs one claim cycle per call: list, plan, conditionally write.
pub struct OwnershipManager {
    owner_id: OwnerId,
    consumer_group: String,
    stream_client: Arc<dyn EventStreamClient>,
    ownership_store: Arc<dyn OwnershipStore>,
    balancer: LoadBalancer,
    clock: Arc<dyn Clock>,
}

impl OwnershipManager {
    pub fn new(
        owner_id: impl Into<OwnerId>,
        consumer_group: impl Into<String>,
        stream_client: Arc<dyn EventStreamClient>,
        ownership_store: Arc<dyn OwnershipStore>,
        ownership_timeout: Duration,
        steal_policy: StealPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let owner_id = owner_id.into();
        let consumer_group = consumer_group.into();
        let balancer = LoadBalancer::new(
            owner_id.clone(),
            stream_client.stream_name(),
            consumer_group.clone(),
            ownership_timeout,
            steal_policy,
        );
        Self {
            owner_id,
            consumer_group,
            stream_client,
            ownership_store,
            balancer,
            clock,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Renew held partitions, claim this processor's share, and return what it holds afterwards.
    ///
    /// Lost races are dropped from the result. Any other failure (listing partitions, listing
    /// ownership, or a write) fails the whole cycle so the caller can tell "nothing to own"
    /// apart from "cannot reach the store".
    pub async fn claim_ownership(&self) -> Result<Vec<OwnershipRecord>> {
        let stream_name = self.stream_client.stream_name();
        let partition_ids = self.stream_client.list_partition_ids().await?;
        let records = self
            .ownership_store
            .list_ownership(stream_name, &self.consumer_group)
            .await?;

        let plan = self.balancer.plan(&partition_ids, &records, self.clock.now());
        debug!(
            "Owner {} on {}/{}: {} partitions, renewing {}, claiming {}",
            self.owner_id,
            stream_name,
            self.consumer_group,
            partition_ids.len(),
            plan.renew.len(),
            plan.claim.len()
        );

        let results = join_all(
            plan.into_requests()
                .into_iter()
                .map(|request| self.ownership_store.claim_ownership(request)),
        )
        .await;

        let mut claimed = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(record) => claimed.push(record),
                Err(e) if e.is_concurrency_conflict() => {
                    debug!("Owner {} lost a claim race: {}", self.owner_id, e);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        claimed.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(claimed)
    }
}
