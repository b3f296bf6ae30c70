//! Error types for the buffering queue

use std::fmt;

use thiserror::Error;

/// Result type alias for buffering queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Why the consumer side refused an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamFault {
    /// Nothing is attached downstream anymore
    NotLinked,
    /// Downstream is torn down or not running
    WrongState,
    /// Downstream failed while handling data
    Error(String),
}

impl fmt::Display for DownstreamFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownstreamFault::NotLinked => write!(f, "not linked"),
            DownstreamFault::WrongState => write!(f, "wrong state"),
            DownstreamFault::Error(msg) => write!(f, "{}", msg),
        }
    }
}

/// Error types that can occur in the buffering queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// Invalid or contradictory configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue is full and no spill store is available (non-blocking paths only)
    #[error("Queue capacity exceeded")]
    CapacityExceeded,

    /// Requested range was overwritten, consumed or never resident
    #[error("Range unavailable: offset {offset}, length {length}")]
    RangeUnavailable {
        /// First requested byte
        offset: u64,
        /// Requested length
        length: u64,
    },

    /// Requested range has not been produced yet
    #[error("Range not yet available: offset {offset}, length {length}")]
    NotYetAvailable {
        /// First requested byte
        offset: u64,
        /// Requested length
        length: u64,
    },

    /// Consumer side failed or is in an invalid state
    #[error("Downstream error: {0}")]
    Downstream(DownstreamFault),

    /// Spill file read/write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A previous spill failure made the queue unusable
    #[error("Spill store failed: {0}")]
    Fatal(String),

    /// Operation cancelled by a flush or state change
    #[error("Queue is flushing")]
    Flushed,

    /// End of stream reached
    #[error("End of stream")]
    Eos,

    /// Level accounting went inconsistent
    #[error("Internal consistency fault: {0}")]
    Internal(String),

    /// Requested lifecycle transition is not allowed
    #[error("Invalid state change from {from} to {to}")]
    StateChange {
        /// State the element was in
        from: String,
        /// State that was requested
        to: String,
    },

    /// Upstream source failed
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl QueueError {
    /// True for the expected stop conditions (flushing, end of stream),
    /// false for real failures that should be reported.
    pub fn is_flow_stop(&self) -> bool {
        matches!(self, QueueError::Flushed | QueueError::Eos)
    }

    /// Clone-able copy of the error for sticky storage. I/O errors are
    /// flattened into `Fatal` since `std::io::Error` is not `Clone`.
    pub(crate) fn duplicate(&self) -> QueueError {
        match self {
            QueueError::Config(msg) => QueueError::Config(msg.clone()),
            QueueError::CapacityExceeded => QueueError::CapacityExceeded,
            QueueError::RangeUnavailable { offset, length } => QueueError::RangeUnavailable {
                offset: *offset,
                length: *length,
            },
            QueueError::NotYetAvailable { offset, length } => QueueError::NotYetAvailable {
                offset: *offset,
                length: *length,
            },
            QueueError::Downstream(fault) => QueueError::Downstream(fault.clone()),
            QueueError::Io(err) => QueueError::Fatal(err.to_string()),
            QueueError::Fatal(msg) => QueueError::Fatal(msg.clone()),
            QueueError::Flushed => QueueError::Flushed,
            QueueError::Eos => QueueError::Eos,
            QueueError::Internal(msg) => QueueError::Internal(msg.clone()),
            QueueError::StateChange { from, to } => QueueError::StateChange {
                from: from.clone(),
                to: to.clone(),
            },
            QueueError::Upstream(msg) => QueueError::Upstream(msg.clone()),
        }
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Upstream(err.to_string())
    }
}

impl From<DownstreamFault> for QueueError {
    fn from(fault: DownstreamFault) -> Self {
        QueueError::Downstream(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_stop_classification() {
        assert!(QueueError::Flushed.is_flow_stop());
        assert!(QueueError::Eos.is_flow_stop());
        assert!(!QueueError::Downstream(DownstreamFault::WrongState).is_flow_stop());
        assert!(!QueueError::CapacityExceeded.is_flow_stop());
    }

    #[test]
    fn test_io_error_duplicates_as_fatal() {
        let err = QueueError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        ));
        match err.duplicate() {
            QueueError::Fatal(msg) => assert!(msg.contains("disk full")),
            other => panic!("Expected Fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_downstream_display() {
        let err = QueueError::from(DownstreamFault::WrongState);
        assert_eq!(err.to_string(), "Downstream error: wrong state");
    }
}
