//! A segment: one store file and one index file under a base offset.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::Record;
use crate::error::{LogError, LogResult};
use crate::storage::{Index, LogConfig, Store};

/// A store/index pair covering the contiguous offset range
/// `[base_offset, next_offset)`.
pub(crate) struct Segment {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: LogConfig,
}

impl Segment {
    /// Open (creating if missing) `<base>.store` and `<base>.index` in
    /// `dir`, deriving `next_offset` from the index's last entry.
    pub fn open(dir: &Path, base_offset: u64, config: LogConfig) -> LogResult<Self> {
        let store = Store::open(store_path(dir, base_offset))?;
        let index = Index::open(index_path(dir, base_offset), config.max_index_bytes)?;
        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + u64::from(rel) + 1,
            Err(LogError::Eof) => base_offset,
            Err(e) => return Err(e),
        };
        Ok(Segment {
            store: Arc::new(store),
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// True when `offset` falls inside this segment's range.
    pub fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset < self.next_offset
    }

    /// Append a record, stamping it with the offset it receives.
    ///
    /// The store write and the index write are not atomic: a store frame
    /// without its index entry is unreachable and gets ignored by recovery,
    /// which replays the index.
    pub fn append(&mut self, record: &mut Record) -> LogResult<u64> {
        let offset = self.next_offset;
        record.offset = offset;
        let encoded = record.encode()?;
        let (_, pos) = self.store.append(&encoded)?;
        self.index
            .write((offset - self.base_offset) as u32, pos)?;
        self.next_offset += 1;
        Ok(offset)
    }

    /// Read the record at an absolute offset.
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        let bytes = self.store.read(pos)?;
        Record::decode(&bytes)
    }

    /// True when either underlying file has reached its configured limit.
    /// A maxed segment must not accept further appends.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    /// Handle on the raw store, for snapshot readers.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn close(&mut self) -> LogResult<()> {
        self.index.close()?;
        self.store.close()
    }

    /// Close, then delete both files.
    pub fn remove(&mut self) -> LogResult<()> {
        self.close()?;
        std::fs::remove_file(self.index.path())?;
        std::fs::remove_file(self.store.path())?;
        Ok(())
    }
}

fn store_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{base_offset}.store"))
}

fn index_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{base_offset}.index"))
}
