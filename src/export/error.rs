use std::time::Duration;

use thiserror::Error;

/// Failure of a single backend call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("encoding request: {0}")]
    Encode(String),
}

/// Errors reported by the export pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExportError {
    /// The view's aggregation/window combination cannot be represented.
    #[error("{metric_type}: unsupported aggregation: {reason}")]
    UnsupportedAggregation { metric_type: String, reason: String },

    /// The backend already holds an incompatible descriptor.
    #[error("{metric_type}: descriptor mismatch: {reason}")]
    DescriptorMismatch { metric_type: String, reason: String },

    #[error("{operation} for {target} failed: {source}")]
    Transport {
        operation: &'static str,
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("export queue full, dropped snapshot of view {view}")]
    QueueFull { view: String },

    #[error("exporter is not running, dropped snapshot of view {view}")]
    NotRunning { view: String },
}

impl ExportError {
    /// Validation errors are caught before any network call and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAggregation { .. } | Self::DescriptorMismatch { .. }
        )
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedAggregation { .. } | Self::DescriptorMismatch { .. } => "validation",
            Self::Transport {
                source: TransportError::Timeout(_),
                ..
            } => "timeout",
            Self::Transport { .. } => "transport",
            Self::QueueFull { .. } => "queue_full",
            Self::NotRunning { .. } => "not_running",
        }
    }
}
