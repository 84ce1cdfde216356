//! The log: an ordered collection of segments behind a read-write lock.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

use crate::api::Record;
use crate::error::{LogError, LogResult};
use crate::storage::{LogConfig, Segment, Store};

struct LogInner {
    config: LogConfig,
    segments: Vec<Segment>,
}

impl LogInner {
    fn active(&self) -> &Segment {
        self.segments.last().expect("log always has a segment")
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("log always has a segment")
    }

    fn new_segment(&mut self, dir: &Path, base_offset: u64) -> LogResult<()> {
        let segment = Segment::open(dir, base_offset, self.config)?;
        self.segments.push(segment);
        Ok(())
    }

    fn setup(&mut self, dir: &Path) -> LogResult<()> {
        let mut base_offsets = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".store") {
                if let Ok(off) = stem.parse::<u64>() {
                    base_offsets.push(off);
                }
            }
        }
        base_offsets.sort_unstable();
        for off in base_offsets {
            self.new_segment(dir, off)?;
        }
        if self.segments.is_empty() {
            let initial = self.config.initial_offset;
            self.new_segment(dir, initial)?;
        }
        Ok(())
    }
}

/// An append-only log of records, split across size-bounded segments.
///
/// `append`, `truncate`, `reset` and `close` take the lock exclusively;
/// `read`, `lowest_offset`, `highest_offset` and `reader` share it. Segment
/// rotation happens under the exclusive lock as part of the append.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<LogInner>,
    notify: Arc<Notify>,
}

impl Log {
    /// Open the log over `dir`, creating the directory and an initial
    /// segment at `config.initial_offset` if it is empty.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut inner = LogInner {
            config,
            segments: Vec::new(),
        };
        inner.setup(&dir)?;
        Ok(Log {
            dir,
            inner: RwLock::new(inner),
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a record, returning the offset it was assigned.
    ///
    /// If the active segment is (or becomes) maxed, a fresh segment is
    /// created under the same lock so offsets stay monotonic.
    pub fn append(&self, mut record: Record) -> LogResult<u64> {
        let mut inner = self.inner.write().unwrap();
        if inner.active().is_maxed() {
            let base = inner.active().next_offset();
            inner.new_segment(&self.dir, base)?;
        }
        let offset = match inner.active_mut().append(&mut record) {
            Ok(offset) => offset,
            // The index filled up before the store did; rotate and retry.
            Err(LogError::Eof) => {
                let base = inner.active().next_offset();
                inner.new_segment(&self.dir, base)?;
                inner.active_mut().append(&mut record)?
            }
            Err(e) => return Err(e),
        };
        if inner.active().is_maxed() {
            inner.new_segment(&self.dir, offset + 1)?;
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(offset)
    }

    /// Read the record at `offset`.
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let inner = self.inner.read().unwrap();
        let segment = inner
            .segments
            .iter()
            .find(|s| s.contains(offset))
            .ok_or(LogError::OffsetOutOfRange { offset })?;
        segment.read(offset).map_err(|e| match e {
            LogError::Eof => LogError::OffsetOutOfRange { offset },
            other => other,
        })
    }

    /// The first segment's base offset.
    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.segments[0].base_offset()
    }

    /// The offset of the newest record, or 0 when the log is empty.
    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        let next = inner.active().next_offset();
        next.saturating_sub(1)
    }

    /// The offset the next append will receive.
    pub(crate) fn next_offset(&self) -> u64 {
        self.inner.read().unwrap().active().next_offset()
    }

    /// True when the log holds no records.
    pub(crate) fn is_empty_log(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.active().next_offset() == inner.segments[0].base_offset()
    }

    /// Remove every segment that lies entirely at or below `lowest`.
    pub fn truncate(&self, lowest: u64) -> LogResult<()> {
        let mut inner = self.inner.write().unwrap();
        let mut kept = Vec::with_capacity(inner.segments.len());
        for mut segment in inner.segments.drain(..) {
            if segment.next_offset() <= lowest + 1 {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        inner.segments = kept;
        // Truncating everything still leaves the log appendable at the
        // next offset.
        if inner.segments.is_empty() {
            inner.new_segment(&self.dir, lowest + 1)?;
        }
        Ok(())
    }

    /// A point-in-time byte stream over every segment's raw store contents
    /// in base order, used for snapshot production. The view is not
    /// required to stay consistent with concurrent appends.
    pub fn reader(&self) -> LogReader {
        let inner = self.inner.read().unwrap();
        LogReader {
            stores: inner.segments.iter().map(|s| s.store()).collect(),
            current: 0,
            off: 0,
        }
    }

    /// Notified whenever an append lands; used by consume streams to wait
    /// for records past the high watermark.
    pub fn append_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Close every segment.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.write().unwrap();
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Close the log and delete its directory.
    pub fn remove(&self) -> LogResult<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Delete everything and reopen empty at the configured initial offset.
    pub fn reset(&self) -> LogResult<()> {
        let initial = self.inner.read().unwrap().config.initial_offset;
        self.reset_to(initial)
    }

    /// Delete everything and reopen empty with a new initial offset. Used
    /// when restoring from a snapshot whose first record starts elsewhere.
    pub fn reset_to(&self, initial_offset: u64) -> LogResult<()> {
        let mut inner = self.inner.write().unwrap();
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        inner.segments.clear();
        std::fs::remove_dir_all(&self.dir)?;
        std::fs::create_dir_all(&self.dir)?;
        inner.config.initial_offset = initial_offset;
        inner.setup(&self.dir)
    }
}

/// Concatenated read-only view over the raw store files of a log.
pub struct LogReader {
    stores: Vec<Arc<Store>>,
    current: usize,
    off: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current < self.stores.len() {
            let n = self.stores[self.current]
                .read_at(buf, self.off)
                .map_err(|e| match e {
                    LogError::Io(io_err) => io_err,
                    other => std::io::Error::other(other.to_string()),
                })?;
            if n > 0 {
                self.off += n as u64;
                return Ok(n);
            }
            self.current += 1;
            self.off = 0;
        }
        Ok(0)
    }
}
