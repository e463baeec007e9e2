use crate::stream::StreamError;
use crate::types::PartitionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Concurrency conflict on partition {partition_id}: ownership version is stale")]
    ConcurrencyConflict { partition_id: PartitionId },

    #[error("Checkpoint write failed for partition {partition_id}: {reason}")]
    CheckpointWrite {
        partition_id: PartitionId,
        reason: String,
    },

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Process events error: {0:#}")]
    ProcessEvents(anyhow::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ProcessorError {
    /// True when a conditional ownership write lost its race.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, ProcessorError::ConcurrencyConflict { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            ProcessorError::Io(_) => "io",
            ProcessorError::Config(_) | ProcessorError::InvalidConfig(_) => "configuration",
            ProcessorError::Store(_) => "store",
            ProcessorError::ConcurrencyConflict { .. } => "concurrency_conflict",
            ProcessorError::CheckpointWrite { .. } => "checkpoint",
            ProcessorError::Stream(e) => e.kind(),
            ProcessorError::ProcessEvents(_) => "process_events",
            ProcessorError::Metrics(_) => "metrics",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_conflict_detection() {
        let err = ProcessorError::ConcurrencyConflict {
            partition_id: "3".to_string(),
        };
        assert!(err.is_concurrency_conflict());
        assert_eq!(err.category(), "concurrency_conflict");
        assert!(err.to_string().contains("partition 3"));

        let err = ProcessorError::Store("connection refused".to_string());
        assert!(!err.is_concurrency_conflict());
    }

    #[test]
    fn test_stream_error_category_passthrough() {
        let err: ProcessorError = StreamError::OwnershipStolen {
            partition_id: "0".to_string(),
            message: "higher owner level connected".to_string(),
        }
        .into();
        assert_eq!(err.category(), "ownership_stolen");
    }

    #[test]
    fn test_process_events_error_keeps_context() {
        let inner = anyhow::anyhow!("bad payload").context("decoding batch 3");
        let err = ProcessorError::ProcessEvents(inner);
        let rendered = err.to_string();
        assert!(rendered.contains("decoding batch 3"));
        assert!(rendered.contains("bad payload"));
    }
}
