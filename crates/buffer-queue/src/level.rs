//! Level accounting and buffering percentage
//!
//! Tracks the queue fill across bytes, time and buffer count, derives a
//! 0..=100 percentage against the configured maxima and applies
//! low/high watermark hysteresis to decide whether the queue is
//! buffering.

use std::time::{Duration, Instant};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::item::{DataChunk, SECOND};

/// Sampling period for the byte rate estimators
const RATE_INTERVAL: Duration = Duration::from_millis(200);

/// Fill counters for the three level dimensions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLevel {
    /// Payload bytes
    pub bytes: u64,
    /// Summed durations, nanoseconds
    pub time: u64,
    /// Data chunk count
    pub buffers: u64,
}

impl QueueLevel {
    /// Contribution of a single chunk. Chunks without a duration add
    /// nothing to the time dimension.
    pub fn of(chunk: &DataChunk) -> Self {
        Self {
            bytes: chunk.len() as u64,
            time: chunk.duration.unwrap_or(0),
            buffers: 1,
        }
    }

    /// Limits from the configured maxima (0 = dimension disabled)
    pub fn limits(config: &QueueConfig) -> Self {
        Self {
            bytes: config.max_size_bytes as u64,
            time: config.max_size_time,
            buffers: config.max_size_buffers as u64,
        }
    }

    /// True when all counters are zero
    pub fn is_empty(&self) -> bool {
        self.bytes == 0 && self.time == 0 && self.buffers == 0
    }

    /// True if any enabled limit is reached
    pub fn is_filled(&self, limits: &QueueLevel) -> bool {
        (limits.bytes > 0 && self.bytes >= limits.bytes)
            || (limits.time > 0 && self.time >= limits.time)
            || (limits.buffers > 0 && self.buffers >= limits.buffers)
    }

    /// True if any enabled limit is strictly exceeded
    pub fn exceeds(&self, limits: &QueueLevel) -> bool {
        (limits.bytes > 0 && self.bytes > limits.bytes)
            || (limits.time > 0 && self.time > limits.time)
            || (limits.buffers > 0 && self.buffers > limits.buffers)
    }
}

/// Running total of level contributions. Time is summed in 128 bits so
/// that removing exactly what was added never underflows, however large
/// the individual durations are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelSum {
    bytes: u64,
    time: u128,
    buffers: u64,
}

impl LevelSum {
    /// Account a contribution
    pub fn add(&mut self, level: QueueLevel) {
        self.bytes = self.bytes.saturating_add(level.bytes);
        self.time = self.time.saturating_add(u128::from(level.time));
        self.buffers = self.buffers.saturating_add(level.buffers);
    }

    /// Remove a contribution, clamping every dimension at zero. Returns
    /// false if any dimension would have gone negative.
    pub fn sub(&mut self, level: QueueLevel) -> bool {
        let bytes = self.bytes.checked_sub(level.bytes);
        let time = self.time.checked_sub(u128::from(level.time));
        let buffers = self.buffers.checked_sub(level.buffers);

        self.bytes = bytes.unwrap_or(0);
        self.time = time.unwrap_or(0);
        self.buffers = buffers.unwrap_or(0);
        bytes.is_some() && time.is_some() && buffers.is_some()
    }

    /// Counters with time clamped to `u64::MAX`
    pub fn level(&self) -> QueueLevel {
        QueueLevel {
            bytes: self.bytes,
            time: u64::try_from(self.time).unwrap_or(u64::MAX),
            buffers: self.buffers,
        }
    }
}

/// Exponentially weighted byte rate
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    period_start: Option<Instant>,
    period_bytes: u64,
    avg: f64,
}

impl RateEstimator {
    /// Account `bytes` observed at `now`
    pub fn record(&mut self, bytes: u64, now: Instant) {
        let start = *self.period_start.get_or_insert(now);
        self.period_bytes = self.period_bytes.saturating_add(bytes);

        let elapsed = now.saturating_duration_since(start);
        if elapsed >= RATE_INTERVAL {
            let sample = self.period_bytes as f64 / elapsed.as_secs_f64();
            self.avg = if self.avg == 0.0 {
                sample
            } else {
                (self.avg * 3.0 + sample) / 4.0
            };
            self.period_start = Some(now);
            self.period_bytes = 0;
        }
    }

    /// Smoothed rate in bytes per second (0 until the first period closes)
    pub fn rate(&self) -> f64 {
        self.avg
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Buffering notification payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingState {
    /// 0..=100
    pub percent: u32,
    /// True while the queue wants the consumer to wait
    pub buffering: bool,
}

/// Aggregate fill counters plus the buffering decision
#[derive(Debug)]
pub struct LevelTracker {
    current: LevelSum,
    limits: QueueLevel,
    use_rate_estimate: bool,
    low_percent: u32,
    high_percent: u32,
    buffering: bool,
    last_state: Option<BufferingState>,
    in_rate: RateEstimator,
    out_rate: RateEstimator,
    faults: u64,
}

impl LevelTracker {
    /// Create a tracker for the configured maxima and watermarks
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            current: LevelSum::default(),
            limits: QueueLevel::limits(config),
            use_rate_estimate: config.use_rate_estimate,
            low_percent: config.low_percent,
            high_percent: config.high_percent.max(1),
            buffering: false,
            last_state: None,
            in_rate: RateEstimator::default(),
            out_rate: RateEstimator::default(),
            faults: 0,
        }
    }

    /// Current counters
    pub fn level(&self) -> QueueLevel {
        self.current.level()
    }

    /// Configured maxima
    pub fn limits(&self) -> QueueLevel {
        self.limits
    }

    /// Number of underflows detected so far
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Smoothed incoming byte rate
    pub fn in_rate(&self) -> f64 {
        self.in_rate.rate()
    }

    /// Smoothed outgoing byte rate
    pub fn out_rate(&self) -> f64 {
        self.out_rate.rate()
    }

    /// Account a pushed chunk
    pub fn on_push(&mut self, chunk: &DataChunk) {
        self.on_push_at(chunk, Instant::now());
    }

    /// Account a pushed chunk observed at `now`
    pub fn on_push_at(&mut self, chunk: &DataChunk, now: Instant) {
        let level = QueueLevel::of(chunk);
        self.current.add(level);
        self.in_rate.record(level.bytes, now);
    }

    /// Account a consumed chunk
    pub fn on_pop(&mut self, level: QueueLevel) -> Result<()> {
        self.out_rate.record(level.bytes, Instant::now());
        self.remove(level)
    }

    /// Remove a chunk that left the queue without being consumed
    /// (overwritten in the disk ring). Underflow clamps at zero and is
    /// reported as an internal fault.
    pub fn remove(&mut self, level: QueueLevel) -> Result<()> {
        let before = self.current.level();
        if self.current.sub(level) {
            return Ok(());
        }

        self.faults += 1;
        Err(QueueError::Internal(format!(
            "level underflow: removing {:?} from {:?}",
            level, before
        )))
    }

    /// Drop every counter and rate sample; watermark state restarts too
    pub fn reset(&mut self) {
        self.current = LevelSum::default();
        self.buffering = false;
        self.last_state = None;
        self.in_rate.reset();
        self.out_rate.reset();
    }

    /// Fill percentage against the configured maxima, always in 0..=100.
    ///
    /// With `use-rate-estimate` and a measured input rate, the time
    /// dimension is replaced by bytes against `max-size-time * rate`. The
    /// byte dimension keeps its fixed `max-size-bytes` limit, which is
    /// also what the producer blocks and spills on.
    pub fn percent(&self) -> u32 {
        let current = self.current.level();
        let mut perc = ratio(current.buffers, self.limits.buffers);
        perc = perc.max(ratio(current.bytes, self.limits.bytes));

        let rate = self.in_rate.rate();
        if self.use_rate_estimate && rate > 0.0 && self.limits.time > 0 {
            let rate_bytes = (self.limits.time as f64 / SECOND as f64 * rate) as u64;
            if rate_bytes > 0 {
                perc = perc.max(ratio(current.bytes, rate_bytes));
            } else {
                perc = perc.max(ratio(current.time, self.limits.time));
            }
        } else {
            perc = perc.max(ratio(current.time, self.limits.time));
        }

        perc
    }

    /// Apply the watermark hysteresis and return the current state.
    pub fn buffering_state(&mut self, eos: bool) -> BufferingState {
        if eos {
            self.buffering = false;
            return BufferingState {
                percent: 100,
                buffering: false,
            };
        }

        let raw = self.percent();
        if self.buffering {
            if raw >= self.high_percent {
                self.buffering = false;
            }
        } else if raw < self.low_percent {
            self.buffering = true;
        }

        let scaled = (raw as u64 * 100 / self.high_percent as u64).min(100) as u32;
        BufferingState {
            percent: scaled,
            buffering: self.buffering,
        }
    }

    /// Like `buffering_state` but only returns a value when it differs
    /// from the last one returned here.
    pub fn buffering_update(&mut self, eos: bool) -> Option<BufferingState> {
        let state = self.buffering_state(eos);
        if self.last_state == Some(state) {
            return None;
        }
        self.last_state = Some(state);
        Some(state)
    }
}

fn ratio(cur: u64, max: u64) -> u32 {
    if max == 0 {
        return 0;
    }
    (cur as u128 * 100 / max as u128).min(100) as u32
}
