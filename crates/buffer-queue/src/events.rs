//! Outward notifications
//!
//! The queue only produces buffering/error values; transport to the
//! rest of the application goes through a broadcast channel that any
//! number of subscribers can listen on.

use tokio::sync::broadcast;

use crate::config::SpillMode;
use crate::level::QueueLevel;

/// How the queue is buffering, derived from the spill mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    /// Memory only
    Stream,
    /// Grow-only file
    Download,
    /// Disk ring
    Timeshift,
}

impl From<SpillMode> for BufferingMode {
    fn from(mode: SpillMode) -> Self {
        match mode {
            SpillMode::Memory => BufferingMode::Stream,
            SpillMode::Unbounded => BufferingMode::Download,
            SpillMode::Ring(_) => BufferingMode::Timeshift,
        }
    }
}

/// Notification emitted by a queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Buffering percentage or state changed
    Buffering {
        /// 0..=100
        percent: u32,
        /// True while consumers should wait
        buffering: bool,
        /// Buffering mode
        mode: BufferingMode,
    },
    /// Memory queue is full; the producer blocks
    Overrun {
        /// Level at the time
        level: QueueLevel,
    },
    /// Something lossy or inconsistent happened
    Warning {
        /// Description
        message: String,
    },
    /// Fatal failure
    Error {
        /// Description
        message: String,
    },
}

/// Broadcast sender for queue events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a bus keeping up to `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Post an event. Having no subscribers is not an error.
    pub fn post(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
