//! The memory-mapped offset index backing a segment.
//!
//! Entries are fixed-width: a `u32` big-endian offset relative to the
//! segment's base, followed by the `u64` big-endian byte position of the
//! record in the companion store. The file is truncated up to its maximum
//! size at open so the mapping has a fixed address range, and truncated
//! back down to the used prefix on close.
//!
//! The data directory must be exclusive to this process while the index is
//! open; external modification of a mapped file is undefined behavior.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{LogError, LogResult};

/// Width of one index entry: 4 offset bytes + 8 position bytes.
pub const ENTRY_WIDTH: u64 = 12;

const OFF_WIDTH: usize = 4;

/// A pre-allocated, memory-mapped index file.
pub(crate) struct Index {
    path: PathBuf,
    file: Option<File>,
    mmap: Option<MmapMut>,
    size: u64,
}

impl Index {
    /// Open (creating if missing) the index at `path`, pre-allocating the
    /// file to `max_index_bytes` for the mapping.
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;
        // SAFETY: the file stays open and is never truncated below the
        // mapped length while the map is alive; the map is dropped before
        // the truncate-down in `close`.
        #[allow(unsafe_code)]
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Index {
            path,
            file: Some(file),
            mmap: Some(mmap),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the mapping holding entries.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append an entry. Fails with [`LogError::Eof`] when the mapped region
    /// is exhausted, which is the caller's signal to rotate the segment.
    pub fn write(&mut self, relative_offset: u32, position: u64) -> LogResult<()> {
        let mmap = self.mmap.as_mut().ok_or(LogError::Closed)?;
        if (mmap.len() as u64) < self.size + ENTRY_WIDTH {
            return Err(LogError::Eof);
        }
        let at = self.size as usize;
        mmap[at..at + OFF_WIDTH].copy_from_slice(&relative_offset.to_be_bytes());
        mmap[at + OFF_WIDTH..at + ENTRY_WIDTH as usize].copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Read the entry at `rel`; `-1` reads the last entry. Fails with
    /// [`LogError::Eof`] when the index is empty or `rel` is past the end.
    pub fn read(&self, rel: i64) -> LogResult<(u32, u64)> {
        let mmap = self.mmap.as_ref().ok_or(LogError::Closed)?;
        if self.size == 0 {
            return Err(LogError::Eof);
        }
        let entry = if rel == -1 {
            (self.size / ENTRY_WIDTH) - 1
        } else {
            rel as u64
        };
        let at = entry * ENTRY_WIDTH;
        if self.size < at + ENTRY_WIDTH {
            return Err(LogError::Eof);
        }
        let at = at as usize;
        let relative_offset = u32::from_be_bytes(mmap[at..at + OFF_WIDTH].try_into().unwrap());
        let position = u64::from_be_bytes(
            mmap[at + OFF_WIDTH..at + ENTRY_WIDTH as usize]
                .try_into()
                .unwrap(),
        );
        Ok((relative_offset, position))
    }

    /// Sync the mapping, unmap, sync the file, and trim it back to the used
    /// prefix. All steps run even if an earlier one fails; the first error
    /// is reported.
    pub fn close(&mut self) -> LogResult<()> {
        let mmap = self.mmap.take().ok_or(LogError::Closed)?;
        let file = self.file.take().ok_or(LogError::Closed)?;

        let mut first_err = mmap.flush().err();
        drop(mmap);
        if let Err(e) = file.sync_all() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = file.set_len(self.size) {
            first_err.get_or_insert(e);
        }
        if let Err(e) = file.sync_all() {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.index");
        let mut index = Index::open(&path, 1024).unwrap();

        assert!(matches!(index.read(-1), Err(LogError::Eof)));

        let entries = [(0u32, 0u64), (1u32, 10u64)];
        for (off, pos) in entries {
            index.write(off, pos).unwrap();
        }
        for (off, pos) in entries {
            assert_eq!(index.read(off as i64).unwrap(), (off, pos));
        }
        assert_eq!(index.read(-1).unwrap(), (1, 10));
        assert!(matches!(index.read(2), Err(LogError::Eof)));
    }

    #[test]
    fn test_index_rebuilds_from_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebuild.index");

        {
            let mut index = Index::open(&path, 1024).unwrap();
            index.write(0, 0).unwrap();
            index.write(1, 10).unwrap();
            index.close().unwrap();
        }

        // The close trimmed the file to two entries; reopen rediscovers them.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * ENTRY_WIDTH);
        let index = Index::open(&path, 1024).unwrap();
        assert_eq!(index.read(-1).unwrap(), (1, 10));
    }

    #[test]
    fn test_index_write_full_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::open(dir.path().join("full.index"), 2 * ENTRY_WIDTH).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        assert!(matches!(index.write(2, 20), Err(LogError::Eof)));
    }

    #[test]
    fn test_index_preallocates_then_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prealloc.index");
        let mut index = Index::open(&path, 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
        index.write(0, 0).unwrap();
        index.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), ENTRY_WIDTH);
    }

    #[test]
    fn test_index_close_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::open(dir.path().join("closed.index"), 1024).unwrap();
        index.close().unwrap();
        assert!(matches!(index.close(), Err(LogError::Closed)));
        assert!(matches!(index.write(0, 0), Err(LogError::Closed)));
        assert!(matches!(index.read(-1), Err(LogError::Closed)));
    }
}
