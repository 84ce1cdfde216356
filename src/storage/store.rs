//! The append-only record file backing a segment.
//!
//! Records are framed as `[u64 BE length][payload]`. Writes pass through a
//! buffered writer that is flushed before any read and on close, so `size`
//! always equals file length plus buffered bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{LogError, LogResult};

/// Width of the big-endian length prefix preceding every record.
pub const LEN_WIDTH: u64 = 8;

struct StoreInner {
    writer: Option<BufWriter<File>>,
    size: u64,
}

/// An append-only file of length-prefixed records.
///
/// A single mutex serializes `append`, `read`, `read_at` and `close`.
pub(crate) struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Open (creating if missing) the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Store {
            path,
            inner: Mutex::new(StoreInner {
                writer: Some(BufWriter::new(file)),
                size,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record payload. Returns `(written_len, position)` where
    /// `position` is the byte offset at which the length prefix begins and
    /// `written_len` covers the prefix plus the payload.
    pub fn append(&self, payload: &[u8]) -> LogResult<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.size;
        let writer = inner.writer.as_mut().ok_or(LogError::Closed)?;
        writer.write_all(&(payload.len() as u64).to_be_bytes())?;
        writer.write_all(payload)?;
        let written = LEN_WIDTH + payload.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the record whose length prefix begins at `pos`.
    pub fn read(&self, pos: u64) -> LogResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let writer = inner.writer.as_mut().ok_or(LogError::Closed)?;
        writer.flush()?;
        let file = writer.get_ref();
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, pos)?;
        let len = u64::from_be_bytes(len_buf);
        let mut payload = vec![0u8; len as usize];
        file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(payload)
    }

    /// Raw positional read used to expose the store as a byte stream for
    /// snapshots. Returns the number of bytes read; zero at end of store.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> LogResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let size = inner.size;
        let writer = inner.writer.as_mut().ok_or(LogError::Closed)?;
        writer.flush()?;
        if off >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - off) as usize);
        writer.get_ref().read_exact_at(&mut buf[..n], off)?;
        Ok(n)
    }

    /// Total bytes written, including buffered bytes not yet on disk.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    /// Flush and close the underlying file. Further operations fail.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut writer = inner.writer.take().ok_or(LogError::Closed)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRITE: &[u8] = b"write";
    const WIDTH: u64 = LEN_WIDTH + WRITE.len() as u64;

    #[test]
    fn test_store_append_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append_read.store");
        let store = Store::open(&path).unwrap();

        for i in 0..3u64 {
            let (written, pos) = store.append(WRITE).unwrap();
            assert_eq!(written, WIDTH);
            assert_eq!(pos, i * WIDTH);
        }

        for i in 0..3u64 {
            assert_eq!(store.read(i * WIDTH).unwrap(), WRITE);
        }
        assert_eq!(store.size(), 3 * WIDTH);
    }

    #[test]
    fn test_store_reopen_preserves_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.store");

        {
            let store = Store::open(&path).unwrap();
            store.append(WRITE).unwrap();
            store.append(WRITE).unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.size(), 2 * WIDTH);
        assert_eq!(store.read(WIDTH).unwrap(), WRITE);
    }

    #[test]
    fn test_store_read_at_streams_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("read_at.store");
        let store = Store::open(&path).unwrap();
        for _ in 0..3 {
            store.append(WRITE).unwrap();
        }
        store.close().unwrap();

        let store = Store::open(&path).unwrap();
        let mut off = 0u64;
        for _ in 0..3 {
            let mut frame = vec![0u8; WIDTH as usize];
            let n = store.read_at(&mut frame, off).unwrap();
            assert_eq!(n, WIDTH as usize);
            assert_eq!(u64::from_be_bytes(frame[..8].try_into().unwrap()), 5);
            assert_eq!(&frame[8..], WRITE);
            off += n as u64;
        }
        let mut rest = [0u8; 1];
        assert_eq!(store.read_at(&mut rest, off).unwrap(), 0);
    }

    #[test]
    fn test_store_read_past_end_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("oob.store")).unwrap();
        store.append(WRITE).unwrap();
        assert!(matches!(store.read(1024), Err(LogError::Io(_))));
    }

    #[test]
    fn test_store_close_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("closed.store")).unwrap();
        store.close().unwrap();
        assert!(matches!(store.close(), Err(LogError::Closed)));
        assert!(matches!(store.append(WRITE), Err(LogError::Closed)));
        assert!(matches!(store.read(0), Err(LogError::Closed)));
    }
}
