//! In-memory ordered queue of items
//!
//! Entries keep their arrival order. A data entry either holds its
//! payload (resident) or points at the disk region it was spilled to;
//! only resident payload counts against the memory thresholds.

use std::collections::VecDeque;
use std::ops::Range;

use bytes::Bytes;

use crate::item::{ControlEvent, DataChunk};
use crate::level::{LevelSum, QueueLevel};

/// Where a queued chunk's payload lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// Payload held in memory
    Resident(Bytes),
    /// Payload moved to this logical range of the spill store
    Spilled(Range<u64>),
}

/// A queued data chunk
#[derive(Debug, Clone)]
pub struct QueuedData {
    /// Logical stream offset of the first byte
    pub offset: u64,
    /// Payload length
    pub len: u64,
    /// Presentation timestamp
    pub pts: Option<u64>,
    /// Decode timestamp
    pub dts: Option<u64>,
    /// Duration
    pub duration: Option<u64>,
    /// Running time at the end of this chunk, fixed when it was queued
    pub running_time: Option<u64>,
    /// Payload location
    pub storage: Storage,
}

impl QueuedData {
    /// Wrap a chunk placed at `offset`
    pub fn new(chunk: DataChunk, offset: u64, running_time: Option<u64>) -> Self {
        Self {
            offset,
            len: chunk.payload.len() as u64,
            pts: chunk.pts,
            dts: chunk.dts,
            duration: chunk.duration,
            running_time,
            storage: Storage::Resident(chunk.payload),
        }
    }

    /// Level contribution of this chunk
    pub fn level(&self) -> QueueLevel {
        QueueLevel {
            bytes: self.len,
            time: self.duration.unwrap_or(0),
            buffers: 1,
        }
    }

    /// Logical byte range covered
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset.saturating_add(self.len)
    }

    /// True if the payload is in memory
    pub fn is_resident(&self) -> bool {
        matches!(self.storage, Storage::Resident(_))
    }

    /// Rebuild the chunk around a payload
    pub fn into_chunk(self, payload: Bytes) -> DataChunk {
        DataChunk {
            payload,
            pts: self.pts,
            dts: self.dts,
            duration: self.duration,
        }
    }
}

/// Entry of the memory ring
#[derive(Debug, Clone)]
pub enum QueuedEntry {
    /// Data chunk
    Data(QueuedData),
    /// Control marker
    Control(ControlEvent),
}

/// Arrival-ordered queue with resident-level bookkeeping.
///
/// Chunks are spilled in arrival order, so the ring keeps a scan cursor:
/// no entry before `scan_from` can still be moved to disk, and every
/// spilled entry sits at or before it.
#[derive(Debug, Default)]
pub struct MemoryRing {
    entries: VecDeque<QueuedEntry>,
    resident: LevelSum,
    spill_limit: u64,
    scan_from: usize,
}

impl MemoryRing {
    /// Create an empty ring whose chunks may all be spilled
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty ring for a disk ring of `capacity` bytes. Chunks
    /// longer than a non-zero capacity would overwrite themselves and
    /// are never handed out for spilling.
    pub fn with_spill_limit(capacity: u64) -> Self {
        Self {
            spill_limit: capacity,
            ..Self::default()
        }
    }

    /// Number of queued entries (data and control)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Level of the payload held in memory
    pub fn resident_level(&self) -> QueueLevel {
        self.resident.level()
    }

    /// Append an entry
    pub fn push_back(&mut self, entry: QueuedEntry) {
        if let QueuedEntry::Data(data) = &entry {
            if data.is_resident() {
                self.resident.add(data.level());
            }
        }
        self.entries.push_back(entry);
    }

    /// Remove the oldest entry
    pub fn pop_front(&mut self) -> Option<QueuedEntry> {
        let entry = self.entries.pop_front()?;
        self.release(&entry);
        self.scan_from = self.scan_from.saturating_sub(1);
        Some(entry)
    }

    /// Remove the newest entry
    pub fn pop_back(&mut self) -> Option<QueuedEntry> {
        let entry = self.entries.pop_back()?;
        self.release(&entry);
        self.scan_from = self.scan_from.min(self.entries.len());
        Some(entry)
    }

    fn release(&mut self, entry: &QueuedEntry) {
        if let QueuedEntry::Data(data) = entry {
            if data.is_resident() {
                self.resident.sub(data.level());
            }
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.resident = LevelSum::default();
        self.scan_from = 0;
    }

    /// Index, stream offset and payload of the oldest resident chunk
    /// that can be moved to disk. Callers spill chunks in the order they
    /// are handed out here.
    pub fn next_evictable(&mut self) -> Option<(usize, u64, Bytes)> {
        while let Some(entry) = self.entries.get(self.scan_from) {
            if let QueuedEntry::Data(QueuedData {
                offset,
                len,
                storage: Storage::Resident(payload),
                ..
            }) = entry
            {
                if *len > 0 && (self.spill_limit == 0 || *len <= self.spill_limit) {
                    return Some((self.scan_from, *offset, payload.clone()));
                }
            }
            self.scan_from += 1;
        }
        None
    }

    /// Level of every queued chunk, resident or spilled
    pub fn queued_level(&self) -> QueueLevel {
        let mut level = LevelSum::default();
        for entry in &self.entries {
            if let QueuedEntry::Data(data) = entry {
                level.add(data.level());
            }
        }
        level.level()
    }

    /// Record that the chunk at `index` now lives at `disk` in the spill store
    pub fn mark_spilled(&mut self, index: usize, disk: Range<u64>) {
        if let Some(QueuedEntry::Data(data)) = self.entries.get_mut(index) {
            if data.is_resident() {
                self.resident.sub(data.level());
            }
            data.storage = Storage::Spilled(disk);
            self.scan_from = self.scan_from.max(index);
        }
    }

    /// Remove spilled chunks whose disk region starts before
    /// `oldest_valid`; they were overwritten by newer spills.
    /// Returns the removed chunks.
    ///
    /// Spilled chunks are ordered by disk offset, so only the entries up
    /// to the first surviving spilled chunk are visited.
    pub fn drop_overwritten(&mut self, oldest_valid: u64) -> Vec<QueuedData> {
        let mut dropped = Vec::new();
        let mut kept = Vec::new();

        let mut visited = 0usize;
        while visited <= self.scan_from {
            let entry = match self.entries.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            visited += 1;
            match entry {
                QueuedEntry::Data(data) => match &data.storage {
                    Storage::Spilled(disk) if disk.start < oldest_valid => dropped.push(data),
                    Storage::Spilled(_) => {
                        self.entries.push_front(QueuedEntry::Data(data));
                        break;
                    }
                    Storage::Resident(_) => kept.push(QueuedEntry::Data(data)),
                },
                control => kept.push(control),
            }
        }

        for entry in kept.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.scan_from = self.scan_from.saturating_sub(dropped.len());
        dropped
    }

    /// Queued chunk containing logical `offset`
    pub fn find(&self, offset: u64) -> Option<&QueuedData> {
        self.entries.iter().find_map(|entry| match entry {
            QueuedEntry::Data(data) if data.range().contains(&offset) => Some(data),
            _ => None,
        })
    }

    /// Logical ranges of chunks whose payload is in memory
    pub fn resident_ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            QueuedEntry::Data(data) if data.is_resident() && data.len > 0 => Some(data.range()),
            _ => None,
        })
    }
}
