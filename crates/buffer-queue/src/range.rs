//! Random-access reads over the buffered stream
//!
//! Resolves a logical byte range against the memory ring (newest data)
//! and the spill store (older data) and stitches the pieces together.

use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::error::{QueueError, Result};
use crate::ring::{MemoryRing, Storage};
use crate::spill::DiskSpillStore;

/// Borrowed view over the queue storage for one range lookup
pub struct RangeAccessor<'a> {
    ring: &'a MemoryRing,
    spill: Option<&'a mut DiskSpillStore>,
    write_offset: u64,
    eos: bool,
}

impl<'a> RangeAccessor<'a> {
    /// `write_offset` is the end of everything produced so far
    pub fn new(
        ring: &'a MemoryRing,
        spill: Option<&'a mut DiskSpillStore>,
        write_offset: u64,
        eos: bool,
    ) -> Self {
        Self {
            ring,
            spill,
            write_offset,
            eos,
        }
    }

    /// Read exactly `length` bytes at `offset`.
    ///
    /// `RangeUnavailable` means part of the range was already written
    /// but is gone (consumed or overwritten); waiting cannot help.
    /// `NotYetAvailable` means the caller should wait for the producer;
    /// `Eos` means the range reaches past the end of a finished stream.
    pub fn get_range(&mut self, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }

        let end = offset
            .checked_add(length)
            .ok_or(QueueError::RangeUnavailable { offset, length })?;

        if !self.is_covered(offset, end.min(self.write_offset)) {
            return Err(QueueError::RangeUnavailable { offset, length });
        }

        if end > self.write_offset {
            if self.eos {
                return Err(QueueError::Eos);
            }
            return Err(QueueError::NotYetAvailable { offset, length });
        }

        // Fast path: whole range inside one resident chunk
        if let Some(data) = self.ring.find(offset) {
            if let Storage::Resident(payload) = &data.storage {
                if end <= data.range().end {
                    let start = (offset - data.offset) as usize;
                    return Ok(payload.slice(start..start + length as usize));
                }
            }
        }

        let mut out = BytesMut::with_capacity(length as usize);
        let mut cursor = offset;
        while cursor < end {
            let piece = self.piece_at(cursor, end).map_err(|e| match e {
                QueueError::RangeUnavailable { .. } => {
                    QueueError::RangeUnavailable { offset, length }
                }
                other => other,
            })?;
            cursor += piece.len() as u64;
            out.extend_from_slice(&piece);
        }

        Ok(out.freeze())
    }

    /// True if every byte of `from..to` is resident or in a surviving
    /// disk extent
    fn is_covered(&self, from: u64, to: u64) -> bool {
        let mut cursor = from;
        while cursor < to {
            match self.piece_end(cursor) {
                Some(stop) if stop > cursor => cursor = stop,
                _ => return false,
            }
        }
        true
    }

    fn piece_end(&self, cursor: u64) -> Option<u64> {
        if let Some(data) = self.ring.find(cursor) {
            if data.is_resident() {
                return Some(data.range().end);
            }
        }
        let (_, available) = self.spill.as_deref()?.lookup(cursor)?;
        Some(cursor.saturating_add(available))
    }

    fn piece_at(&mut self, cursor: u64, end: u64) -> Result<Bytes> {
        let unavailable = QueueError::RangeUnavailable {
            offset: cursor,
            length: end - cursor,
        };

        if let Some(data) = self.ring.find(cursor) {
            if let Storage::Resident(payload) = &data.storage {
                let start = (cursor - data.offset) as usize;
                let stop = (end.min(data.range().end) - data.offset) as usize;
                return Ok(payload.slice(start..stop));
            }
        }

        let spill = self.spill.as_deref_mut().ok_or(unavailable)?;
        let (disk_offset, available) = spill.lookup(cursor).ok_or(QueueError::RangeUnavailable {
            offset: cursor,
            length: end - cursor,
        })?;
        let n = available.min(end - cursor);
        let piece = spill.read(disk_offset, n)?;
        if piece.is_empty() {
            return Err(QueueError::RangeUnavailable {
                offset: cursor,
                length: end - cursor,
            });
        }
        Ok(piece)
    }
}

/// Sorted, coalesced logical ranges readable right now
pub fn buffered_ranges(ring: &MemoryRing, spill: Option<&DiskSpillStore>) -> Vec<Range<u64>> {
    let mut ranges: Vec<Range<u64>> = ring.resident_ranges().collect();
    if let Some(spill) = spill {
        ranges.extend(spill.stream_ranges());
    }
    ranges.sort_by_key(|r| r.start);

    let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}
