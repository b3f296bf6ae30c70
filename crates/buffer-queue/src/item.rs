//! Items flowing through the queue
//!
//! A queue carries either opaque data chunks or in-band control markers.
//! Timestamps are nanoseconds; `None` means "not set".

use bytes::Bytes;

/// One second in nanoseconds
pub const SECOND: u64 = 1_000_000_000;

/// A chunk of payload with optional timing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataChunk {
    /// Opaque payload
    pub payload: Bytes,
    /// Presentation timestamp
    pub pts: Option<u64>,
    /// Decode timestamp
    pub dts: Option<u64>,
    /// Duration
    pub duration: Option<u64>,
}

impl DataChunk {
    /// Chunk without timing information
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Chunk of `len` zero bytes
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Set the presentation timestamp
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Set the decode timestamp
    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for an empty payload
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Timestamp used for running-time tracking (dts preferred, like a decoder queue would)
    pub fn timestamp(&self) -> Option<u64> {
        self.dts.or(self.pts)
    }
}

/// Unit of a segment's start/stop/position values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentFormat {
    /// Nanoseconds
    #[default]
    Time,
    /// Byte offsets
    Bytes,
}

/// Time-domain mapping for subsequent items
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Unit of the values below
    pub format: SegmentFormat,
    /// First valid timestamp / offset
    pub start: u64,
    /// Last valid timestamp / offset
    pub stop: Option<u64>,
    /// Playback rate; never zero
    pub rate: f64,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            format: SegmentFormat::Time,
            start: 0,
            stop: None,
            rate: 1.0,
        }
    }
}

impl Segment {
    /// Time segment starting at `start`
    pub fn time(start: u64) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }

    /// Byte segment starting at `start`
    pub fn bytes(start: u64) -> Self {
        Self {
            format: SegmentFormat::Bytes,
            start,
            ..Self::default()
        }
    }

    /// Convert a timestamp to running time.
    ///
    /// Returns `None` for timestamps outside `[start, stop]` or for byte
    /// segments. Arithmetic is checked, so timestamps close to `u64::MAX`
    /// never wrap into small values.
    pub fn to_running_time(&self, ts: u64) -> Option<u64> {
        if self.format != SegmentFormat::Time {
            return None;
        }
        if ts < self.start {
            return None;
        }
        if let Some(stop) = self.stop {
            if ts > stop {
                return None;
            }
        }

        let delta = ts - self.start;
        let rate = self.rate.abs();
        if rate == 1.0 || !rate.is_normal() {
            Some(delta)
        } else {
            // float -> int casts saturate
            Some((delta as f64 / rate) as u64)
        }
    }
}

/// In-band control markers
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Start flushing: drop queued data, unblock everyone
    FlushStart,
    /// Stop flushing: accept data again
    FlushStop,
    /// New time-domain mapping
    Segment(Segment),
    /// No more data will follow
    EndOfStream,
    /// A new stream begins
    StreamStart {
        /// Stream identifier
        stream_id: String,
    },
}

/// An item pushed through the queue
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Payload
    Data(DataChunk),
    /// Control marker
    Control(ControlEvent),
}

impl StreamItem {
    /// Data item from a payload without timing
    pub fn data(payload: impl Into<Bytes>) -> Self {
        StreamItem::Data(DataChunk::new(payload))
    }

    /// End-of-stream marker
    pub fn eos() -> Self {
        StreamItem::Control(ControlEvent::EndOfStream)
    }

    /// Segment marker
    pub fn segment(segment: Segment) -> Self {
        StreamItem::Control(ControlEvent::Segment(segment))
    }

    /// Stream-start marker
    pub fn stream_start(stream_id: impl Into<String>) -> Self {
        StreamItem::Control(ControlEvent::StreamStart {
            stream_id: stream_id.into(),
        })
    }

    /// True for the end-of-stream marker
    pub fn is_eos(&self) -> bool {
        matches!(self, StreamItem::Control(ControlEvent::EndOfStream))
    }

    /// Payload size, 0 for control markers
    pub fn size(&self) -> u64 {
        match self {
            StreamItem::Data(chunk) => chunk.len() as u64,
            StreamItem::Control(_) => 0,
        }
    }

    /// Borrow the data chunk, if any
    pub fn as_data(&self) -> Option<&DataChunk> {
        match self {
            StreamItem::Data(chunk) => Some(chunk),
            StreamItem::Control(_) => None,
        }
    }
}

impl From<DataChunk> for StreamItem {
    fn from(chunk: DataChunk) -> Self {
        StreamItem::Data(chunk)
    }
}

impl From<ControlEvent> for StreamItem {
    fn from(event: ControlEvent) -> Self {
        StreamItem::Control(event)
    }
}
