use crate::types::EventPosition;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONSUMER_GROUP: &str = "$default";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub consumer_group: String,
    /// Identity written into ownership records. A random UUID is used when unset.
    pub owner_id: Option<String>,
    /// Starting position for partitions that have no checkpoint yet
    pub initial_position: EventPosition,
    /// Interval between two claim cycles
    pub polling_interval_ms: u64,
    /// Lease length; defaults to twice the polling interval
    pub ownership_timeout_ms: Option<u64>,
    pub receive_timeout_ms: u64,
    pub max_batch_size: usize,
    /// Upper bound on how long `stop()` waits for partition tasks to close
    pub shutdown_grace_period_ms: u64,
    /// Exclusive-consumer level requested when opening partition consumers
    pub owner_level: Option<i64>,
    pub load_balancing: LoadBalancingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub steal_policy: StealPolicy,
}

/// Which partition to take first when stealing from an over-full owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StealPolicy {
    /// Least recently renewed record first, across all over-full owners
    EarliestModified,
    /// Owner holding the most partitions first, then least recently renewed
    LargestOwnerFirst,
}

impl Default for StealPolicy {
    fn default() -> Self {
        StealPolicy::EarliestModified
    }
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            steal_policy: StealPolicy::default(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            owner_id: None,
            initial_position: EventPosition::Earliest,
            polling_interval_ms: 10_000,     // 10 seconds
            ownership_timeout_ms: None,      // 2x polling interval
            receive_timeout_ms: 5_000,
            max_batch_size: 300,
            shutdown_grace_period_ms: 2_000,
            owner_level: Some(0),
            load_balancing: LoadBalancingConfig::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: ProcessorConfig = toml::from_str(content)
            .map_err(|e| crate::error::ProcessorError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn ownership_timeout(&self) -> Duration {
        Duration::from_millis(
            self.ownership_timeout_ms
                .unwrap_or(self.polling_interval_ms.saturating_mul(2)),
        )
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.consumer_group.is_empty() {
            return Err(crate::error::ProcessorError::InvalidConfig(
                "consumer_group cannot be empty".to_string(),
            ));
        }

        if matches!(&self.owner_id, Some(id) if id.is_empty()) {
            return Err(crate::error::ProcessorError::InvalidConfig(
                "owner_id cannot be empty when set".to_string(),
            ));
        }

        if self.polling_interval_ms == 0 {
            return Err(crate::error::ProcessorError::InvalidConfig(
                "polling_interval_ms must be greater than 0".to_string(),
            ));
        }

        // Renewals happen once per polling interval; a shorter lease expires between them.
        if self.ownership_timeout() <= self.polling_interval() {
            return Err(crate::error::ProcessorError::InvalidConfig(
                "ownership_timeout_ms must be greater than polling_interval_ms".to_string(),
            ));
        }

        if self.receive_timeout_ms == 0 {
            return Err(crate::error::ProcessorError::InvalidConfig(
                "receive_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_batch_size == 0 {
            return Err(crate::error::ProcessorError::InvalidConfig(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
