//! Disk-backed spill store
//!
//! A byte-addressable region in a temporary file. With a capacity of 0
//! the file only grows; with a capacity `C > 0` it is a ring: the
//! logical write offset `W` only increases, physical position is
//! `W % C`, and everything before `W - C` has been overwritten.
//!
//! Besides the raw region the store keeps an index of spilled extents
//! (stream offset -> disk offset) so that byte ranges of the stream can
//! be resolved after the queue entries themselves are gone.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;

use crate::error::{QueueError, Result};

/// Logical cursor of the ring region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCursor {
    /// Total bytes ever written
    pub write_offset: u64,
    /// Capacity, 0 = unbounded
    pub capacity: u64,
}

impl RingCursor {
    /// Oldest logical offset that is still readable
    pub fn oldest_valid(&self) -> u64 {
        if self.capacity == 0 {
            0
        } else {
            self.write_offset.saturating_sub(self.capacity)
        }
    }

    /// Physical file position of a logical offset
    fn physical(&self, offset: u64) -> u64 {
        if self.capacity == 0 {
            offset
        } else {
            offset % self.capacity
        }
    }
}

/// A contiguous piece of the stream stored on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillExtent {
    /// Stream offset of the first byte
    pub stream_offset: u64,
    /// Logical disk offset of the first byte
    pub disk_offset: u64,
    /// Length in bytes
    pub len: u64,
}

impl SpillExtent {
    fn stream_range(&self) -> Range<u64> {
        self.stream_offset..self.stream_offset + self.len
    }
}

enum Backing {
    /// Unlinked file, removed by the OS on close
    Anonymous(File),
    /// Named file from the template; deleted on drop unless kept
    Named(NamedTempFile),
}

impl Backing {
    fn file(&mut self) -> &mut File {
        match self {
            Backing::Anonymous(file) => file,
            Backing::Named(named) => named.as_file_mut(),
        }
    }
}

/// Disk spill region plus extent index
pub struct DiskSpillStore {
    template: Option<PathBuf>,
    remove_on_close: bool,
    backing: Option<Backing>,
    cursor: RingCursor,
    extents: VecDeque<SpillExtent>,
}

impl std::fmt::Debug for DiskSpillStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSpillStore")
            .field("template", &self.template)
            .field("open", &self.backing.is_some())
            .field("cursor", &self.cursor)
            .field("extents", &self.extents.len())
            .finish()
    }
}

impl DiskSpillStore {
    /// Configure a store. Nothing touches the filesystem until the
    /// first write.
    pub fn open(template: Option<PathBuf>, capacity: u64) -> Self {
        Self {
            template,
            remove_on_close: true,
            backing: None,
            cursor: RingCursor {
                write_offset: 0,
                capacity,
            },
            extents: VecDeque::new(),
        }
    }

    /// Keep template-backed files on close instead of deleting them
    pub fn keep_files(mut self, keep: bool) -> Self {
        self.remove_on_close = !keep;
        self
    }

    /// Current cursor
    pub fn cursor(&self) -> RingCursor {
        self.cursor
    }

    /// Capacity, 0 = unbounded
    pub fn capacity(&self) -> u64 {
        self.cursor.capacity
    }

    /// True once the backing file exists
    pub fn is_open(&self) -> bool {
        self.backing.is_some()
    }

    /// Path of a template-backed file
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Some(Backing::Named(named)) => Some(named.path()),
            _ => None,
        }
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.backing.is_none() {
            let backing = match &self.template {
                Some(template) => Backing::Named(create_from_template(template)?),
                None => Backing::Anonymous(tempfile::tempfile()?),
            };
            if let Backing::Named(named) = &backing {
                tracing::debug!(path = %named.path().display(), "Opened spill file");
            } else {
                tracing::debug!("Opened anonymous spill file");
            }
            self.backing = Some(backing);
        }

        match self.backing.as_mut() {
            Some(backing) => Ok(backing.file()),
            None => Err(QueueError::Internal("spill file not open".to_string())),
        }
    }

    /// Append `data` at the write cursor, wrapping as needed. Returns
    /// the logical range now occupied. When `data` is longer than the
    /// ring only its tail survives.
    pub fn write(&mut self, data: &[u8]) -> Result<Range<u64>> {
        let start = self.cursor.write_offset;
        let len = data.len() as u64;
        let cursor = self.cursor;
        let file = self.ensure_open()?;

        let (skip, mut logical) = if cursor.capacity > 0 && len > cursor.capacity {
            (len - cursor.capacity, start + len - cursor.capacity)
        } else {
            (0, start)
        };

        let mut remaining = &data[skip as usize..];
        while !remaining.is_empty() {
            let pos = cursor.physical(logical);
            let room = if cursor.capacity == 0 {
                remaining.len() as u64
            } else {
                cursor.capacity - pos
            };
            let n = (remaining.len() as u64).min(room) as usize;

            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&remaining[..n])?;

            remaining = &remaining[n..];
            logical += n as u64;
        }

        self.cursor.write_offset = start + len;
        self.trim_extents();

        Ok(start..start + len)
    }

    /// Read `length` bytes at logical `offset`
    pub fn read(&mut self, offset: u64, length: u64) -> Result<Bytes> {
        let unavailable = QueueError::RangeUnavailable { offset, length };

        if self.cursor.capacity > 0 && length > self.cursor.capacity {
            return Err(unavailable);
        }
        let end = match offset.checked_add(length) {
            Some(end) => end,
            None => return Err(unavailable),
        };
        if offset < self.cursor.oldest_valid() || end > self.cursor.write_offset {
            return Err(unavailable);
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let cursor = self.cursor;
        let file = self.ensure_open()?;
        let mut out = BytesMut::zeroed(length as usize);

        let mut filled = 0usize;
        let mut logical = offset;
        while filled < out.len() {
            let pos = cursor.physical(logical);
            let room = if cursor.capacity == 0 {
                (out.len() - filled) as u64
            } else {
                cursor.capacity - pos
            };
            let n = ((out.len() - filled) as u64).min(room) as usize;

            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut out[filled..filled + n])?;

            filled += n;
            logical += n as u64;
        }

        Ok(out.freeze())
    }

    /// Spill a stream chunk and index it. Returns the disk range.
    pub fn spill(&mut self, stream_offset: u64, data: &[u8]) -> Result<Range<u64>> {
        let disk = self.write(data)?;
        let len = disk.end - disk.start;
        let capacity = self.cursor.capacity;

        // A chunk that overwrote its own head is useless for range reads
        if len > 0 && (capacity == 0 || len <= capacity) {
            self.extents.push_back(SpillExtent {
                stream_offset,
                disk_offset: disk.start,
                len,
            });
        }
        Ok(disk)
    }

    /// Extent containing stream `offset`, with the number of bytes
    /// available from there to the end of the extent. Extents are
    /// indexed in stream order.
    pub fn lookup(&self, offset: u64) -> Option<(u64, u64)> {
        let after = self
            .extents
            .partition_point(|extent| extent.stream_offset <= offset);
        let extent = self.extents.get(after.checked_sub(1)?)?;
        if !extent.stream_range().contains(&offset) {
            return None;
        }
        let delta = offset - extent.stream_offset;
        Some((extent.disk_offset + delta, extent.len - delta))
    }

    /// Stream ranges readable from disk
    pub fn stream_ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.extents.iter().map(SpillExtent::stream_range)
    }

    fn trim_extents(&mut self) {
        let oldest = self.cursor.oldest_valid();
        while let Some(front) = self.extents.front() {
            if front.disk_offset < oldest {
                self.extents.pop_front();
            } else {
                break;
            }
        }
    }

    /// Forget all data but keep the file; the grow-only file is
    /// truncated to give the space back.
    pub fn reset(&mut self) -> Result<()> {
        self.cursor.write_offset = 0;
        self.extents.clear();
        if let Some(backing) = self.backing.as_mut() {
            backing.file().set_len(0)?;
        }
        Ok(())
    }

    /// Release the backing file. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        self.cursor.write_offset = 0;
        self.extents.clear();

        match self.backing.take() {
            Some(Backing::Named(named)) => {
                if self.remove_on_close {
                    let path = named.path().to_path_buf();
                    named.close()?;
                    tracing::debug!(path = %path.display(), "Removed spill file");
                } else {
                    let (_file, path) = named.keep().map_err(|e| QueueError::Io(e.error))?;
                    tracing::debug!(path = %path.display(), "Kept spill file");
                }
            }
            Some(Backing::Anonymous(_)) => {
                tracing::debug!("Closed anonymous spill file");
            }
            None => {}
        }
        Ok(())
    }
}

impl Drop for DiskSpillStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close spill file");
        }
    }
}

/// Create a file from a `dir/prefixXXXXXX` template. The trailing `X`
/// characters are replaced by a random suffix.
fn create_from_template(template: &Path) -> Result<NamedTempFile> {
    let name = template
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| QueueError::Config(format!("invalid temp-template {:?}", template)))?;
    let prefix = name.trim_end_matches('X');
    let random_len = (name.len() - prefix.len()).max(6);

    let dir = match template.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::temp_dir(),
    };

    let file = tempfile::Builder::new()
        .prefix(prefix)
        .rand_bytes(random_len)
        .tempfile_in(dir)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_lazy_open() {
        let mut store = DiskSpillStore::open(None, 1024);
        assert!(!store.is_open());

        store.write(&[1, 2, 3]).unwrap();
        assert!(store.is_open());
    }

    #[test]
    fn test_write_read_unbounded() {
        let mut store = DiskSpillStore::open(None, 0);
        let a = pattern(3000, 0);
        let b = pattern(5000, 7);

        assert_eq!(store.write(&a).unwrap(), 0..3000);
        assert_eq!(store.write(&b).unwrap(), 3000..8000);

        assert_eq!(store.read(0, 3000).unwrap().as_ref(), &a[..]);
        assert_eq!(store.read(3000, 5000).unwrap().as_ref(), &b[..]);
        assert_eq!(store.read(2990, 20).unwrap().as_ref(), &[&a[2990..], &b[..10]].concat()[..]);
    }

    #[test]
    fn test_ring_wraps_and_overwrites_oldest() {
        let mut store = DiskSpillStore::open(None, 1000);
        let a = pattern(700, 0);
        let b = pattern(600, 100);

        store.write(&a).unwrap();
        store.write(&b).unwrap();

        let cursor = store.cursor();
        assert_eq!(cursor.write_offset, 1300);
        assert_eq!(cursor.oldest_valid(), 300);

        // Overwritten region
        assert!(matches!(
            store.read(0, 100),
            Err(QueueError::RangeUnavailable { .. })
        ));

        // Straddles the physical wrap point
        let got = store.read(300, 1000).unwrap();
        let expected = [&a[300..], &b[..]].concat();
        assert_eq!(got.as_ref(), &expected[..]);
    }

    #[test]
    fn test_read_longer_than_capacity_fails() {
        let mut store = DiskSpillStore::open(None, 1000);
        store.write(&pattern(1000, 0)).unwrap();

        let result = store.read(0, 4096);
        assert!(matches!(
            result,
            Err(QueueError::RangeUnavailable {
                offset: 0,
                length: 4096
            })
        ));
    }

    #[test]
    fn test_read_beyond_write_cursor_fails() {
        let mut store = DiskSpillStore::open(None, 0);
        store.write(&pattern(10, 0)).unwrap();
        assert!(store.read(5, 10).is_err());
        assert!(store.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let mut store = DiskSpillStore::open(None, 1000);
        let data = pattern(4096, 3);

        let range = store.write(&data).unwrap();
        assert_eq!(range, 0..4096);
        assert_eq!(store.cursor().oldest_valid(), 3096);
        assert_eq!(store.read(3096, 1000).unwrap().as_ref(), &data[3096..]);
    }

    #[test]
    fn test_extent_index_follows_overwrites() {
        let mut store = DiskSpillStore::open(None, 1000);
        store.spill(10_000, &pattern(600, 0)).unwrap();
        store.spill(10_600, &pattern(300, 0)).unwrap();

        assert_eq!(store.lookup(10_650), Some((650, 250)));

        // Third spill overwrites the first extent
        store.spill(10_900, &pattern(400, 0)).unwrap();
        assert!(store.lookup(10_000).is_none());
        assert_eq!(store.lookup(10_600), Some((600, 300)));

        let ranges: Vec<_> = store.stream_ranges().collect();
        assert_eq!(ranges, vec![10_600..10_900, 10_900..11_300]);
    }

    #[test]
    fn test_lookup_across_many_extents() {
        let mut store = DiskSpillStore::open(None, 0);
        for i in 0..500u64 {
            // 10-byte extents with a 5-byte hole after each
            store.spill(i * 15, &pattern(10, i as u8)).unwrap();
        }

        assert_eq!(store.lookup(0), Some((0, 10)));
        assert_eq!(store.lookup(15 * 250 + 3), Some((10 * 250 + 3, 7)));
        assert_eq!(store.lookup(15 * 499 + 9), Some((10 * 499 + 9, 1)));
        assert!(store.lookup(12).is_none());
        assert!(store.lookup(15 * 500).is_none());
    }

    #[test]
    fn test_oversized_spill_not_indexed() {
        let mut store = DiskSpillStore::open(None, 1000);
        store.spill(0, &pattern(4096, 0)).unwrap();
        assert!(store.lookup(3500).is_none());
    }

    #[test]
    fn test_reset_clears_cursor() {
        let mut store = DiskSpillStore::open(None, 0);
        store.spill(0, &pattern(100, 0)).unwrap();
        store.reset().unwrap();

        assert_eq!(store.cursor().write_offset, 0);
        assert!(store.lookup(0).is_none());
        assert!(store.is_open());
    }

    #[test]
    fn test_template_file_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskSpillStore::open(Some(dir.path().join("spill-XXXXXX")), 0);
        store.write(&pattern(128, 0)).unwrap();

        let path = store.path().expect("named file").to_path_buf();
        assert!(path.exists());
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("spill-"))
            .unwrap_or(false));

        store.close().unwrap();
        assert!(!path.exists());
        // Idempotent
        store.close().unwrap();
    }

    #[test]
    fn test_repeated_open_close_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..10 {
            let mut store = DiskSpillStore::open(Some(dir.path().join("cycle-XXXXXX")), 512);
            store.write(&pattern(2048, 0)).unwrap();
            store.close().unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_keep_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store =
            DiskSpillStore::open(Some(dir.path().join("keep-XXXXXX")), 0).keep_files(true);
        store.write(&pattern(16, 0)).unwrap();
        let path = store.path().unwrap().to_path_buf();

        store.close().unwrap();
        assert!(path.exists());
    }
}
