//! RemoteMedia Buffer Queue - buffering stage between a producer and a consumer
//!
//! This crate absorbs rate mismatches between an upstream source and a
//! downstream sink inside a streaming pipeline.
//!
//! # Architecture
//!
//! - `level`: fill counters over bytes, time and buffers, plus the
//!   buffering percentage with watermark hysteresis
//! - `ring`: arrival-ordered in-memory queue
//! - `spill`: disk-backed circular store that receives data evicted from
//!   memory
//! - `range`: random-access reads stitched from memory and disk
//! - `flow`: the lock/condvar core that blocks and wakes producers and
//!   consumers, with a cancellation generation for flush and shutdown
//! - `element`: Null/Ready/Paused/Playing lifecycle with input and
//!   output worker threads
//!
//! # Example
//!
//! ```ignore
//! use remotemedia_buffer_queue::{BufferQueue, QueueConfig, State, StreamItem};
//!
//! let config = QueueConfig::bytes_only(4096).with_ring_buffer(64 * 1024);
//! let queue = BufferQueue::new("prefetch", config)?;
//! queue.set_state(State::Paused)?;
//!
//! queue.push(StreamItem::data(vec![0u8; 8192]))?;
//! let window = queue.range_read(1024, 4096)?;
//! assert_eq!(window.len(), 4096);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod element;
pub mod error;
pub mod events;
pub mod flow;
pub mod item;
pub mod level;
pub mod range;
pub mod ring;
pub mod spill;

pub use config::{QueueConfig, SpillMode};
pub use element::{BufferQueue, ItemSink, ItemSource, State};
pub use error::{DownstreamFault, QueueError, Result};
pub use events::{BufferingMode, EventBus, QueueEvent};
pub use flow::{FlowController, QueueStats};
pub use item::{ControlEvent, DataChunk, Segment, SegmentFormat, StreamItem, SECOND};
pub use level::{BufferingState, LevelTracker, QueueLevel};
pub use range::RangeAccessor;
pub use spill::{DiskSpillStore, RingCursor};
