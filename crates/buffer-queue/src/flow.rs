//! Producer/consumer flow control
//!
//! One mutex guards the memory ring, the level counters and the spill
//! store cursors. Producers wait on `space_available`, consumers on
//! `data_available`. Every wait records the cancellation generation
//! first; flush, shutdown and downstream errors bump the generation
//! while holding the lock and wake all waiters.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;

use crate::config::{QueueConfig, SpillMode};
use crate::error::{DownstreamFault, QueueError, Result};
use crate::events::{BufferingMode, EventBus, QueueEvent};
use crate::item::{ControlEvent, DataChunk, Segment, SegmentFormat, StreamItem};
use crate::level::{BufferingState, LevelTracker, QueueLevel};
use crate::range::{self, RangeAccessor};
use crate::ring::{MemoryRing, QueuedData, QueuedEntry, Storage};
use crate::spill::{DiskSpillStore, RingCursor};

/// Snapshot of the queue bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    /// Level of everything queued (memory + disk)
    pub level: QueueLevel,
    /// Level recomputed from the queued entries
    pub queued_level: QueueLevel,
    /// Level of payload held in memory
    pub memory_level: QueueLevel,
    /// Queued entries, data and control
    pub entries: usize,
    /// End of the produced stream
    pub write_offset: u64,
    /// Bytes moved to disk since the last flush
    pub spilled_bytes: u64,
    /// Spilled bytes lost to ring overwrites since the last flush
    pub overwritten_bytes: u64,
    /// Disk ring cursor, once the spill file exists
    pub disk: Option<RingCursor>,
    /// Smoothed incoming rate, bytes/s
    pub avg_in_rate: f64,
    /// Smoothed outgoing rate, bytes/s
    pub avg_out_rate: f64,
    /// Running time of the newest queued chunk
    pub in_running_time: Option<u64>,
    /// Running time of the last consumed chunk
    pub out_running_time: Option<u64>,
    /// Level underflows detected
    pub level_faults: u64,
    /// End of stream received
    pub eos: bool,
    /// Between flush-start and flush-stop
    pub flushing: bool,
}

struct FlowState {
    ring: MemoryRing,
    level: LevelTracker,
    spill: Option<DiskSpillStore>,
    segment: Segment,
    write_offset: u64,
    eos: bool,
    flushing: bool,
    inactive: bool,
    downstream: Option<DownstreamFault>,
    fatal: Option<String>,
    buffering: BufferingState,
    spilled_bytes: u64,
    overwritten_bytes: u64,
    in_running_time: Option<u64>,
    out_running_time: Option<u64>,
}

impl FlowState {
    fn new(config: &QueueConfig) -> Self {
        Self {
            ring: MemoryRing::with_spill_limit(config.spill_mode().capacity()),
            level: LevelTracker::new(config),
            spill: None,
            segment: Segment::default(),
            write_offset: 0,
            eos: false,
            flushing: false,
            inactive: false,
            downstream: None,
            fatal: None,
            buffering: BufferingState {
                percent: 0,
                buffering: false,
            },
            spilled_bytes: 0,
            overwritten_bytes: 0,
            in_running_time: None,
            out_running_time: None,
        }
    }

    /// Errors that stop every operation
    fn check_common(&self) -> Result<()> {
        if self.flushing || self.inactive {
            return Err(QueueError::Flushed);
        }
        if let Some(msg) = &self.fatal {
            return Err(QueueError::Fatal(msg.clone()));
        }
        if let Some(fault) = &self.downstream {
            return Err(QueueError::Downstream(fault.clone()));
        }
        Ok(())
    }

    fn check_push(&self) -> Result<()> {
        self.check_common()?;
        if self.eos {
            return Err(QueueError::Eos);
        }
        Ok(())
    }

    /// What a waiter reports after the generation moved
    fn cancel_reason(&self) -> QueueError {
        match self.check_common() {
            Err(err) => err,
            Ok(()) => QueueError::Flushed,
        }
    }

    fn nothing_stored(&self) -> bool {
        self.ring.is_empty()
            && self
                .spill
                .as_ref()
                .map_or(true, |spill| spill.stream_ranges().next().is_none())
    }

    /// Drop all data; the spill file stays open but empty
    fn clear(&mut self) -> Result<()> {
        self.ring.clear();
        self.level.reset();
        self.write_offset = 0;
        self.eos = false;
        self.spilled_bytes = 0;
        self.overwritten_bytes = 0;
        self.in_running_time = None;
        self.out_running_time = None;
        if let Some(spill) = self.spill.as_mut() {
            spill.reset()?;
        }
        Ok(())
    }
}

/// Synchronization core of the buffering queue
pub struct FlowController {
    name: String,
    config: QueueConfig,
    mode: SpillMode,
    limits: QueueLevel,
    state: Mutex<FlowState>,
    data_available: Condvar,
    space_available: Condvar,
    generation: AtomicU64,
    events: EventBus,
}

impl FlowController {
    /// Create a controller for a validated configuration
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            mode: config.spill_mode(),
            limits: QueueLevel::limits(&config),
            state: Mutex::new(FlowState::new(&config)),
            config,
            data_available: Condvar::new(),
            space_available: Condvar::new(),
            generation: AtomicU64::new(0),
            events: EventBus::default(),
        })
    }

    /// Name used in log output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spill mode in effect
    pub fn spill_mode(&self) -> SpillMode {
        self.mode
    }

    /// Notification bus
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to buffering and error notifications
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Current cancellation generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Push an item, blocking while a memory-only queue is full
    pub fn push(&self, item: StreamItem) -> Result<()> {
        match item {
            StreamItem::Data(chunk) => self.push_data(chunk, true),
            StreamItem::Control(event) => self.push_control(event),
        }
    }

    /// Push without blocking. A full memory-only queue drops the chunk
    /// and returns `CapacityExceeded`.
    pub fn try_push(&self, item: StreamItem) -> Result<()> {
        match item {
            StreamItem::Data(chunk) => self.push_data(chunk, false),
            StreamItem::Control(event) => self.push_control(event),
        }
    }

    fn push_data(&self, chunk: DataChunk, block: bool) -> Result<()> {
        let mut state = self.state.lock();
        let generation = self.generation();
        state.check_push()?;

        if !self.mode.is_enabled() {
            let mut overrun_posted = false;
            while state.level.level().is_filled(&self.limits) {
                if !block {
                    return Err(QueueError::CapacityExceeded);
                }
                if !overrun_posted {
                    overrun_posted = true;
                    tracing::trace!(
                        queue = %self.name,
                        level = ?state.level.level(),
                        "Queue full, producer waiting"
                    );
                    self.events.post(QueueEvent::Overrun {
                        level: state.level.level(),
                    });
                }

                self.space_available.wait(&mut state);

                if self.generation() != generation {
                    return Err(state.cancel_reason());
                }
                state.check_push()?;
            }
        }

        let result = self.store(&mut state, chunk);
        self.data_available.notify_all();
        self.update_buffering(&mut state);
        result
    }

    /// Queue a chunk and spill what no longer fits in memory. When the
    /// spill store fails the chunk is taken back out, so an error means
    /// nothing was stored.
    fn store(&self, state: &mut FlowState, chunk: DataChunk) -> Result<()> {
        let offset = state.write_offset;
        let len = chunk.len() as u64;
        let previous_running_time = state.in_running_time;

        let running_time = chunk
            .timestamp()
            .map(|ts| ts.saturating_add(chunk.duration.unwrap_or(0)))
            .and_then(|ts| state.segment.to_running_time(ts));
        if running_time.is_some() {
            state.in_running_time = running_time;
        }

        state.level.on_push(&chunk);
        state.write_offset = offset.saturating_add(len);
        state
            .ring
            .push_back(QueuedEntry::Data(QueuedData::new(chunk, offset, running_time)));

        tracing::trace!(
            queue = %self.name,
            offset = offset,
            len = len,
            level = ?state.level.level(),
            "Queued chunk"
        );

        if self.mode.is_enabled() {
            if let Err(err) = self.spill_excess(state) {
                if let Some(QueuedEntry::Data(data)) = state.ring.pop_back() {
                    if let Err(fault) = state.level.remove(data.level()) {
                        self.report_fault(&fault);
                    }
                }
                state.write_offset = offset;
                state.in_running_time = previous_running_time;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Move the oldest resident chunks to disk until memory is back
    /// under the thresholds or nothing else can be moved.
    fn spill_excess(&self, state: &mut FlowState) -> Result<()> {
        let capacity = self.mode.capacity();

        while state.ring.resident_level().exceeds(&self.limits) {
            let (index, stream_offset, payload) = match state.ring.next_evictable() {
                Some(next) => next,
                None => break,
            };

            let template = self.config.temp_template.clone();
            let keep = !self.config.temp_remove;
            let written = state
                .spill
                .get_or_insert_with(|| DiskSpillStore::open(template, capacity).keep_files(keep))
                .spill(stream_offset, &payload);
            let disk = match written {
                Ok(disk) => disk,
                Err(err) => return Err(self.fail(state, err)),
            };

            state.ring.mark_spilled(index, disk);
            state.spilled_bytes = state.spilled_bytes.saturating_add(payload.len() as u64);

            let oldest = state
                .spill
                .as_ref()
                .map_or(0, |spill| spill.cursor().oldest_valid());
            let dropped = state.ring.drop_overwritten(oldest);
            if !dropped.is_empty() {
                let mut lost = 0u64;
                for data in &dropped {
                    lost = lost.saturating_add(data.len);
                    if let Err(err) = state.level.remove(data.level()) {
                        self.report_fault(&err);
                    }
                }
                state.overwritten_bytes = state.overwritten_bytes.saturating_add(lost);
                tracing::warn!(
                    queue = %self.name,
                    dropped_chunks = dropped.len(),
                    dropped_bytes = lost,
                    ring_size = capacity,
                    "Disk ring overflow, overwrote oldest spilled data"
                );
            }
        }
        Ok(())
    }

    fn push_control(&self, event: ControlEvent) -> Result<()> {
        match event {
            ControlEvent::FlushStart => self.flush_start(),
            ControlEvent::FlushStop => self.flush_stop(),
            ControlEvent::EndOfStream => {
                let mut state = self.state.lock();
                state.check_push()?;
                state.eos = true;
                state
                    .ring
                    .push_back(QueuedEntry::Control(ControlEvent::EndOfStream));
                tracing::debug!(queue = %self.name, write_offset = state.write_offset, "Received EOS");
                self.data_available.notify_all();
                self.update_buffering(&mut state);
                Ok(())
            }
            ControlEvent::Segment(segment) => {
                let mut state = self.state.lock();
                state.check_push()?;
                match segment.format {
                    SegmentFormat::Bytes => {
                        if state.nothing_stored() {
                            state.write_offset = segment.start;
                        } else if segment.start != state.write_offset {
                            tracing::warn!(
                                queue = %self.name,
                                start = segment.start,
                                write_offset = state.write_offset,
                                "Ignoring byte segment while data is buffered"
                            );
                        }
                    }
                    SegmentFormat::Time => state.segment = segment.clone(),
                }
                state
                    .ring
                    .push_back(QueuedEntry::Control(ControlEvent::Segment(segment)));
                self.data_available.notify_all();
                Ok(())
            }
            ControlEvent::StreamStart { stream_id } => {
                let mut state = self.state.lock();
                state.check_push()?;
                tracing::debug!(queue = %self.name, stream_id = %stream_id, "Stream start");
                state
                    .ring
                    .push_back(QueuedEntry::Control(ControlEvent::StreamStart { stream_id }));
                self.data_available.notify_all();
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    /// Take the oldest item, blocking until one is queued. Returns
    /// `Eos` once the end-of-stream marker has been consumed.
    pub fn pop(&self) -> Result<StreamItem> {
        let mut state = self.state.lock();
        let generation = self.generation();

        loop {
            state.check_common()?;
            if let Some(item) = self.take_front(&mut state)? {
                return Ok(item);
            }
            if state.eos {
                return Err(QueueError::Eos);
            }

            self.data_available.wait(&mut state);

            if self.generation() != generation {
                return Err(state.cancel_reason());
            }
        }
    }

    /// Take the oldest item if there is one
    pub fn try_pop(&self) -> Result<Option<StreamItem>> {
        let mut state = self.state.lock();
        state.check_common()?;
        match self.take_front(&mut state)? {
            Some(item) => Ok(Some(item)),
            None if state.eos => Err(QueueError::Eos),
            None => Ok(None),
        }
    }

    fn take_front(&self, state: &mut FlowState) -> Result<Option<StreamItem>> {
        let entry = match state.ring.pop_front() {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let item = match entry {
            QueuedEntry::Control(event) => StreamItem::Control(event),
            QueuedEntry::Data(data) => {
                if let Err(err) = state.level.on_pop(data.level()) {
                    self.report_fault(&err);
                }
                if data.running_time.is_some() {
                    state.out_running_time = data.running_time;
                }

                let payload = match &data.storage {
                    Storage::Resident(payload) => payload.clone(),
                    Storage::Spilled(disk) => {
                        let read = match state.spill.as_mut() {
                            Some(spill) => spill.read(disk.start, disk.end - disk.start),
                            None => Err(QueueError::Internal(
                                "spilled chunk without spill store".to_string(),
                            )),
                        };
                        match read {
                            Ok(payload) => payload,
                            Err(err) => return Err(self.fail(state, err)),
                        }
                    }
                };
                StreamItem::Data(data.into_chunk(payload))
            }
        };

        self.space_available.notify_all();
        self.update_buffering(state);
        Ok(Some(item))
    }

    /// Read exactly `length` bytes at logical `offset`, blocking until
    /// the producer has written them. Does not consume anything.
    pub fn range_read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut state = self.state.lock();
        let generation = self.generation();

        loop {
            state.check_common()?;

            let result = {
                let st = &mut *state;
                RangeAccessor::new(&st.ring, st.spill.as_mut(), st.write_offset, st.eos)
                    .get_range(offset, length)
            };

            match result {
                Err(QueueError::NotYetAvailable { .. }) if self.exceeds_window(length) => {
                    return Err(QueueError::RangeUnavailable { offset, length });
                }
                Err(QueueError::NotYetAvailable { .. }) => {
                    tracing::trace!(
                        queue = %self.name,
                        offset = offset,
                        length = length,
                        write_offset = state.write_offset,
                        "Range not yet written, waiting"
                    );
                    self.data_available.wait(&mut state);
                    if self.generation() != generation {
                        return Err(state.cancel_reason());
                    }
                }
                Err(QueueError::Io(err)) => return Err(self.fail(&mut state, QueueError::Io(err))),
                other => return other,
            }
        }
    }

    /// True if a range of `length` bytes can never be held at once: the
    /// disk ring plus the memory byte limit is smaller than it.
    fn exceeds_window(&self, length: u64) -> bool {
        match self.mode {
            SpillMode::Ring(capacity) if self.limits.bytes > 0 => {
                length > capacity.saturating_add(self.limits.bytes)
            }
            _ => false,
        }
    }

    /// Record a consumer-side failure. Blocked and future producer
    /// operations fail with `Downstream` until the next flush-stop.
    pub fn signal_downstream_error(&self, fault: DownstreamFault) {
        let mut state = self.state.lock();
        if state.downstream.is_none() {
            tracing::warn!(queue = %self.name, fault = %fault, "Downstream failed");
            if let DownstreamFault::Error(message) = &fault {
                self.events.post(QueueEvent::Error {
                    message: message.clone(),
                });
            }
            state.downstream = Some(fault);
        }
        self.bump_generation();
    }

    // ------------------------------------------------------------------
    // Flushing and lifecycle
    // ------------------------------------------------------------------

    /// Enter flushing: drop all data and release every waiter
    pub fn flush_start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.flushing = true;
        let result = state.clear();
        self.bump_generation();
        tracing::debug!(queue = %self.name, "Flush start");
        result
    }

    /// Leave flushing and forget EOS and downstream errors
    pub fn flush_stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.flushing = false;
        state.eos = false;
        state.downstream = None;
        state.segment = Segment::default();
        tracing::debug!(queue = %self.name, "Flush stop");
        self.data_available.notify_all();
        self.space_available.notify_all();
        Ok(())
    }

    /// Flush-start followed by flush-stop
    pub fn flush(&self) -> Result<()> {
        self.flush_start()?;
        self.flush_stop()
    }

    /// Wake every waiter with `Flushed` without touching the data
    pub fn interrupt(&self) {
        let _state = self.state.lock();
        self.bump_generation();
    }

    /// Reject every operation with `Flushed` and release all waiters,
    /// keeping the queued data
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        state.inactive = true;
        self.bump_generation();
    }

    /// Undo `deactivate`, leaving EOS and error state untouched
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.inactive = false;
        self.data_available.notify_all();
        self.space_available.notify_all();
    }

    /// Accept data again after `deactivate` or `shutdown`, forgetting
    /// EOS and any recorded error
    pub fn activate(&self) {
        let mut state = self.state.lock();
        state.flushing = false;
        state.inactive = false;
        state.eos = false;
        state.downstream = None;
        state.fatal = None;
        state.segment = Segment::default();
        self.data_available.notify_all();
        self.space_available.notify_all();
    }

    /// Drop everything and release the spill file. Waiters are woken
    /// and later operations return `Flushed` until `activate`.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.flushing = true;
        let cleared = state.clear();
        let closed = match state.spill.take() {
            Some(mut spill) => spill.close(),
            None => Ok(()),
        };
        state.downstream = None;
        state.fatal = None;
        self.bump_generation();
        tracing::debug!(queue = %self.name, "Queue shut down");
        cleared.and(closed)
    }

    /// Park a worker while the queue is drained to EOS, flushing or
    /// inactive. Returns once that changes or the generation moves past
    /// `generation`.
    pub(crate) fn wait_resumable(&self, generation: u64) {
        let mut state = self.state.lock();
        while (state.eos || state.flushing || state.inactive) && self.generation() == generation {
            self.data_available.wait(&mut state);
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.data_available.notify_all();
        self.space_available.notify_all();
    }

    fn fail(&self, state: &mut FlowState, err: QueueError) -> QueueError {
        let sticky = err.duplicate();
        if let QueueError::Fatal(message) = &sticky {
            tracing::error!(queue = %self.name, error = %message, "Spill store failed");
            self.events.post(QueueEvent::Error {
                message: message.clone(),
            });
            state.fatal = Some(message.clone());
            self.bump_generation();
        }
        err
    }

    fn report_fault(&self, err: &QueueError) {
        tracing::error!(queue = %self.name, error = %err, "Level accounting fault");
        self.events.post(QueueEvent::Warning {
            message: err.to_string(),
        });
    }

    fn update_buffering(&self, state: &mut FlowState) {
        if let Some(update) = state.level.buffering_update(state.eos) {
            state.buffering = update;
            if self.config.use_buffering {
                tracing::debug!(
                    queue = %self.name,
                    percent = update.percent,
                    buffering = update.buffering,
                    "Buffering"
                );
                self.events.post(QueueEvent::Buffering {
                    percent: update.percent,
                    buffering: update.buffering,
                    mode: BufferingMode::from(self.mode),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current level counters
    pub fn level(&self) -> QueueLevel {
        self.state.lock().level.level()
    }

    /// current-level-bytes
    pub fn current_level_bytes(&self) -> u64 {
        self.level().bytes
    }

    /// current-level-time
    pub fn current_level_time(&self) -> u64 {
        self.level().time
    }

    /// current-level-buffers
    pub fn current_level_buffers(&self) -> u64 {
        self.level().buffers
    }

    /// Fill percentage against the configured maxima
    pub fn percent(&self) -> u32 {
        self.state.lock().level.percent()
    }

    /// Last computed buffering state
    pub fn buffering(&self) -> BufferingState {
        self.state.lock().buffering
    }

    /// End of the produced stream
    pub fn write_offset(&self) -> u64 {
        self.state.lock().write_offset
    }

    /// Logical byte ranges that `range_read` can serve right now
    pub fn buffered_ranges(&self) -> Vec<Range<u64>> {
        let state = self.state.lock();
        range::buffered_ranges(&state.ring, state.spill.as_ref())
    }

    /// Path of the template-backed spill file, if one is open
    pub fn spill_path(&self) -> Option<PathBuf> {
        let state = self.state.lock();
        state
            .spill
            .as_ref()
            .and_then(|spill| spill.path().map(|p| p.to_path_buf()))
    }

    /// Bookkeeping snapshot
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            level: state.level.level(),
            queued_level: state.ring.queued_level(),
            memory_level: state.ring.resident_level(),
            entries: state.ring.len(),
            write_offset: state.write_offset,
            spilled_bytes: state.spilled_bytes,
            overwritten_bytes: state.overwritten_bytes,
            disk: state
                .spill
                .as_ref()
                .filter(|spill| spill.is_open())
                .map(|spill| spill.cursor()),
            avg_in_rate: state.level.in_rate(),
            avg_out_rate: state.level.out_rate(),
            in_running_time: state.in_running_time,
            out_running_time: state.out_running_time,
            level_faults: state.level.faults(),
            eos: state.eos,
            flushing: state.flushing,
        }
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("generation", &self.generation())
            .finish()
    }
}
