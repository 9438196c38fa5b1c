//! Portion I/O: positioned file access plus per-thread asynchronous
//! contexts.
//!
//! A worker thread owns one [`IoContext`] per open file. Submissions queue
//! a read or write with a completion; `flush` issues the queued requests
//! and stages their completions; `wait`/`drain` run the completions on the
//! submitting thread. Buffers stay owned by the context while a request is
//! in flight and are handed to the completion once the data is valid.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::numa::NumaBuf;

pub trait FileIo: Send + Sync {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn set_len(&self, len: u64) -> Result<()>;
}

/// Positioned I/O over a plain [`File`].
pub struct StdFileIo {
    file: File,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::unix::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Positioned read helper usable on any borrowed [`File`].
pub(crate) fn read_exact_at(file: &File, off: u64, dst: &mut [u8]) -> Result<()> {
    positioned::read_exact(file, off, dst)?;
    Ok(())
}

/// Positioned write helper usable on any borrowed [`File`].
pub(crate) fn write_all_at(file: &File, off: u64, src: &[u8]) -> Result<()> {
    positioned::write_all(file, off, src)?;
    Ok(())
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        positioned::read_exact(&self.file, off, dst)?;
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        positioned::write_all(&self.file, off, src)?;
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

/// Global I/O counters shared by every context of a runtime.
#[derive(Default)]
pub struct IoStats {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl IoStats {
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    fn on_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

enum IoKind {
    Read,
    Write,
}

type Completion = Box<dyn FnOnce(NumaBuf<u8>) -> Result<()> + Send>;

struct QueuedIo {
    kind: IoKind,
    offset: u64,
    buf: NumaBuf<u8>,
    completion: Completion,
}

/// A single thread's asynchronous context over one file.
///
/// Not `Sync`; every worker creates its own. Completions run on the
/// submitting thread and may submit further requests to *other* contexts,
/// never back into the one running them.
pub struct IoContext {
    file: Arc<dyn FileIo>,
    queued: Vec<QueuedIo>,
    staged: VecDeque<(NumaBuf<u8>, Completion)>,
    stats: Arc<IoStats>,
}

impl IoContext {
    pub fn new(file: Arc<dyn FileIo>, stats: Arc<IoStats>) -> Self {
        Self {
            file,
            queued: Vec::new(),
            staged: VecDeque::new(),
            stats,
        }
    }

    /// Requests that fill `buf` from `offset` and hand it to `completion`.
    pub fn submit_read<F>(&mut self, offset: u64, buf: NumaBuf<u8>, completion: F)
    where
        F: FnOnce(NumaBuf<u8>) -> Result<()> + Send + 'static,
    {
        self.queued.push(QueuedIo {
            kind: IoKind::Read,
            offset,
            buf,
            completion: Box::new(completion),
        });
    }

    /// Requests that write `buf` at `offset`; the completion releases the
    /// buffer once the write is out.
    pub fn submit_write<F>(&mut self, offset: u64, buf: NumaBuf<u8>, completion: F)
    where
        F: FnOnce(NumaBuf<u8>) -> Result<()> + Send + 'static,
    {
        self.queued.push(QueuedIo {
            kind: IoKind::Write,
            offset,
            buf,
            completion: Box::new(completion),
        });
    }

    /// Issues every queued request and stages its completion.
    pub fn flush(&mut self) -> Result<()> {
        for mut req in self.queued.drain(..) {
            match req.kind {
                IoKind::Read => {
                    self.file.read_at(req.offset, req.buf.as_mut_slice())?;
                    self.stats.on_read(req.buf.len());
                }
                IoKind::Write => {
                    self.file.write_at(req.offset, req.buf.as_slice())?;
                    self.stats.on_write(req.buf.len());
                }
            }
            self.staged.push_back((req.buf, req.completion));
        }
        Ok(())
    }

    /// Runs up to `max` staged completions; returns how many ran.
    pub fn wait(&mut self, max: usize) -> Result<usize> {
        let mut ran = 0;
        while ran < max {
            let Some((buf, completion)) = self.staged.pop_front() else {
                break;
            };
            completion(buf)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Flushes and runs every completion currently outstanding.
    pub fn drain(&mut self) -> Result<()> {
        while self.pending() > 0 {
            self.flush()?;
            self.wait(usize::MAX)?;
        }
        Ok(())
    }

    /// Submitted requests whose completion has not run yet.
    pub fn pending(&self) -> usize {
        self.queued.len() + self.staged.len()
    }

    /// Reads `len` bytes at `offset` into a fresh node-local buffer,
    /// driving the submit/flush/wait cycle to completion.
    pub fn read_sync(&mut self, offset: u64, len: usize, node: usize) -> Result<NumaBuf<u8>> {
        let cell: Arc<parking_lot::Mutex<Option<NumaBuf<u8>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&cell);
        self.submit_read(offset, NumaBuf::alloc(len, node), move |buf| {
            *slot.lock() = Some(buf);
            Ok(())
        });
        self.drain()?;
        let buf = cell.lock().take().expect("read completion did not run");
        trace!(offset, len, "io.read_sync");
        Ok(buf)
    }
}
