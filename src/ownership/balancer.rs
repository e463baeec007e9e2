//! Claim planning.
//!
//! Membership is inferred from the ownership table: every owner with a live record counts as
//! active, plus this processor. With `n` active owners and `t` partitions the fair share is
//! between `floor(t / n)` and `ceil(t / n)`.
//!
//! A plan renews every live record this processor holds, then tops it up to `ceil(t / n)` from
//! unowned partitions first and expired ones second. Stealing from other live owners only
//! happens while this processor is below its share: first up to `floor` from owners above
//! `floor`, then one more from owners above `ceil`. Victims are never taken below the
//! threshold they were picked at, so a table where every owner holds `floor` or `ceil`
//! partitions is stable.

use crate::config::StealPolicy;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimPlan {
    /// Live records this processor already holds
    pub renew: Vec<OwnershipRecord>,
    /// Unowned, expired or stolen records, with `owner_id` set to this processor
    pub claim: Vec<OwnershipRecord>,
}

impl ClaimPlan {
    pub fn is_empty(&self) -> bool {
        self.renew.is_empty() && self.claim.is_empty()
    }

    /// Conditional writes to issue, renewals first.
    pub fn into_requests(self) -> Vec<OwnershipRecord> {
        let mut requests = self.renew;
        requests.extend(self.claim);
        requests
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    owner_id: OwnerId,
    stream_name: String,
    consumer_group_name: String,
    ownership_timeout: Duration,
    steal_policy: StealPolicy,
}

impl LoadBalancer {
    pub fn new(
        owner_id: impl Into<OwnerId>,
        stream_name: impl Into<String>,
        consumer_group_name: impl Into<String>,
        ownership_timeout: Duration,
        steal_policy: StealPolicy,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            stream_name: stream_name.into(),
            consumer_group_name: consumer_group_name.into(),
            ownership_timeout,
            steal_policy,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn plan(
        &self,
        partition_ids: &[PartitionId],
        records: &[OwnershipRecord],
        now: DateTime<Utc>,
    ) -> ClaimPlan {
        let partitions: BTreeSet<&str> = partition_ids.iter().map(String::as_str).collect();
        if partitions.is_empty() {
            return ClaimPlan::default();
        }

        // Records for partitions the stream no longer has are ignored
        let existing: HashMap<&str, &OwnershipRecord> = records
            .iter()
            .filter(|r| {
                r.stream_name == self.stream_name
                    && r.consumer_group_name == self.consumer_group_name
                    && partitions.contains(r.partition_id.as_str())
            })
            .map(|r| (r.partition_id.as_str(), r))
            .collect();

        let mut renew = Vec::new();
        let mut unowned = Vec::new();
        let mut expired = Vec::new();
        let mut live_by_owner: HashMap<&str, Vec<&OwnershipRecord>> = HashMap::new();

        for partition_id in &partitions {
            match existing.get(partition_id) {
                None => unowned.push(OwnershipRecord::unclaimed(PartitionIdentity::new(
                    self.stream_name.clone(),
                    self.consumer_group_name.clone(),
                    *partition_id,
                ))),
                Some(record) => match record.owner() {
                    Some(owner) if record.is_live(now, self.ownership_timeout) => {
                        live_by_owner.entry(owner).or_default().push(*record);
                        if owner == self.owner_id {
                            renew.push((*record).clone());
                        }
                    }
                    Some(_) => expired.push((*record).clone()),
                    None => unowned.push((*record).clone()),
                },
            }
        }

        let active_owners = live_by_owner.len()
            + usize::from(!live_by_owner.contains_key(self.owner_id.as_str()));
        let total = partitions.len();
        let floor = total / active_owners;
        let ceil = (total + active_owners - 1) / active_owners;

        let mut held = renew.len();
        let mut claim = Vec::new();
        if held >= ceil {
            return ClaimPlan { renew, claim };
        }

        unowned.sort_by_key(|record| self.spread_key(&record.partition_id));
        expired.sort_by(|a, b| {
            a.last_modified_time
                .cmp(&b.last_modified_time)
                .then_with(|| a.partition_id.cmp(&b.partition_id))
        });
        for record in unowned.into_iter().chain(expired) {
            if held >= ceil {
                break;
            }
            claim.push(self.claimed(&record));
            held += 1;
        }

        let mut counts: HashMap<&str, usize> = live_by_owner
            .iter()
            .filter(|(owner, _)| **owner != self.owner_id)
            .map(|(owner, records)| (*owner, records.len()))
            .collect();
        let mut candidates: Vec<&OwnershipRecord> = live_by_owner
            .iter()
            .filter(|(owner, _)| **owner != self.owner_id)
            .flat_map(|(_, records)| records.iter().copied())
            .collect();
        candidates.sort_by(|a, b| {
            a.last_modified_time
                .cmp(&b.last_modified_time)
                .then_with(|| a.partition_id.cmp(&b.partition_id))
        });

        if held < floor {
            held += self.steal(&candidates, &mut counts, floor, floor - held, &mut claim);
        }
        if held < ceil {
            self.steal(&candidates, &mut counts, ceil, ceil - held, &mut claim);
        }

        ClaimPlan { renew, claim }
    }

    /// Move up to `budget` records from owners holding more than `threshold` into `claim`.
    fn steal<'a>(
        &self,
        candidates: &[&'a OwnershipRecord],
        counts: &mut HashMap<&'a str, usize>,
        threshold: usize,
        budget: usize,
        claim: &mut Vec<OwnershipRecord>,
    ) -> usize {
        let mut taken: HashSet<String> = claim.iter().map(|r| r.partition_id.clone()).collect();
        let mut stolen = 0;

        while stolen < budget {
            let pick = match self.steal_policy {
                StealPolicy::EarliestModified => candidates.iter().find(|r| {
                    !taken.contains(&r.partition_id)
                        && r.owner()
                            .and_then(|owner| counts.get(owner))
                            .map_or(false, |count| *count > threshold)
                }),
                StealPolicy::LargestOwnerFirst => {
                    let victim = counts
                        .iter()
                        .filter(|(_, count)| **count > threshold)
                        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                        .map(|(owner, _)| *owner);
                    victim.and_then(|victim| {
                        candidates
                            .iter()
                            .find(|r| !taken.contains(&r.partition_id) && r.owner() == Some(victim))
                    })
                }
            };

            let record = match pick {
                Some(record) => *record,
                None => break,
            };
            if let Some(count) = record.owner().and_then(|owner| counts.get_mut(owner)) {
                *count -= 1;
            }
            taken.insert(record.partition_id.clone());
            claim.push(self.claimed(record));
            stolen += 1;
        }

        stolen
    }

    fn claimed(&self, record: &OwnershipRecord) -> OwnershipRecord {
        OwnershipRecord {
            owner_id: Some(self.owner_id.clone()),
            ..record.clone()
        }
    }

    /// Per-owner ordering of unowned partitions, so simultaneous starters contend less.
    fn spread_key(&self, partition_id: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.owner_id.hash(&mut hasher);
        partition_id.hash(&mut hasher);
        hasher.finish()
    }
}
