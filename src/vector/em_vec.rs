//! External-memory vectors backed by temp files.
//!
//! A vector owns its backing file exclusively; the file is created at the
//! exact byte size of the vector and unlinked when the last handle drops.
//! Worker threads reach the file through per-thread I/O contexts created
//! lazily under a short lock and cached in thread-local storage keyed by
//! vector id and epoch; `destroy_ios` bumps the epoch so stale cache
//! entries are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::bitmap::AtomicBitmap;
use crate::dispatcher::{run_dispatch, Dispatch, PortionCursor};
use crate::elem::ElemType;
use crate::error::{BrasaError, Result};
use crate::io::{FileIo, IoContext};
use crate::numa::{current_node, NumaBuf};
use crate::runtime::Runtime;
use crate::vector::local::{FillOp, LocalPortion};

static NEXT_VEC_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static IO_CACHE: std::cell::RefCell<HashMap<u64, (u64, Weak<Mutex<IoContext>>)>> =
        std::cell::RefCell::new(HashMap::new());
}

struct TempFileIo {
    tmp: NamedTempFile,
}

impl FileIo for TempFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        crate::io::read_exact_at(self.tmp.as_file(), off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        crate::io::write_all_at(self.tmp.as_file(), off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.tmp.as_file().sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.tmp.as_file().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.tmp.as_file().set_len(len)?;
        Ok(())
    }
}

struct VecInner {
    id: u64,
    len: u64,
    elem: ElemType,
    runtime: Arc<Runtime>,
    backing: Mutex<Arc<TempFileIo>>,
    ios: Mutex<HashMap<ThreadId, Arc<Mutex<IoContext>>>>,
    io_epoch: AtomicU64,
}

/// Handle to an external-memory vector. Clones share the same backing
/// file.
#[derive(Clone)]
pub struct EmVec {
    inner: Arc<VecInner>,
}

impl EmVec {
    pub(crate) fn create(runtime: Arc<Runtime>, len: u64, elem: ElemType) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vec");
        let tmp = match &runtime.config().temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        tmp.as_file().set_len(len * elem.size() as u64)?;
        let id = NEXT_VEC_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, len, elem = elem.name(), path = %tmp.path().display(), "vec.create");
        Ok(Self {
            inner: Arc::new(VecInner {
                id,
                len,
                elem,
                runtime,
                backing: Mutex::new(Arc::new(TempFileIo { tmp })),
                ios: Mutex::new(HashMap::new()),
                io_epoch: AtomicU64::new(0),
            }),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn elem(&self) -> &ElemType {
        &self.inner.elem
    }

    pub fn entry_size(&self) -> usize {
        self.inner.elem.size()
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.inner.runtime
    }

    /// Portion size in elements, derived from the anchor gap.
    pub fn portion_elems(&self) -> Result<usize> {
        self.inner
            .runtime
            .config()
            .portion_elems(self.inner.elem.size())
    }

    pub fn num_portions(&self) -> Result<u64> {
        let portion = self.portion_elems()? as u64;
        Ok(self.inner.len.div_ceil(portion))
    }

    /// Runs `f` against the calling thread's I/O context for this vector,
    /// creating the context lazily.
    pub(crate) fn with_io<R>(&self, f: impl FnOnce(&mut IoContext) -> R) -> R {
        let epoch = self.inner.io_epoch.load(Ordering::Acquire);
        let cached = IO_CACHE.with(|cache| {
            cache
                .borrow()
                .get(&self.inner.id)
                .filter(|(e, _)| *e == epoch)
                .and_then(|(_, weak)| weak.upgrade())
        });
        let ctx = match cached {
            Some(ctx) => ctx,
            None => {
                let ctx = self.current_io(epoch);
                IO_CACHE.with(|cache| {
                    cache
                        .borrow_mut()
                        .insert(self.inner.id, (epoch, Arc::downgrade(&ctx)));
                });
                ctx
            }
        };
        let mut guard = ctx.lock();
        f(&mut guard)
    }

    fn current_io(&self, _epoch: u64) -> Arc<Mutex<IoContext>> {
        let mut ios = self.inner.ios.lock();
        let thread = std::thread::current().id();
        if let Some(ctx) = ios.get(&thread) {
            return Arc::clone(ctx);
        }
        let file: Arc<dyn FileIo> = {
            let backing = self.inner.backing.lock();
            Arc::clone(&*backing) as Arc<dyn FileIo>
        };
        let ctx = Arc::new(Mutex::new(IoContext::new(
            file,
            self.inner.runtime.io_stats_handle(),
        )));
        ios.insert(thread, Arc::clone(&ctx));
        trace!(vec = self.inner.id, "vec.io.create");
        ctx
    }

    /// Drops every per-thread I/O handle. Panics if any request is still
    /// in flight.
    pub fn destroy_ios(&self) {
        let mut ios = self.inner.ios.lock();
        for ctx in ios.values() {
            assert_eq!(
                ctx.lock().pending(),
                0,
                "destroy_ios with I/O in flight"
            );
        }
        ios.clear();
        self.inner.io_epoch.fetch_add(1, Ordering::Release);
    }

    /// Drops per-thread handles without the in-flight assertion. Used on
    /// error paths where an operation was abandoned mid-way.
    pub(crate) fn abandon_ios(&self) {
        self.inner.ios.lock().clear();
        self.inner.io_epoch.fetch_add(1, Ordering::Release);
    }

    /// Submits an asynchronous read of `[start, start + nelems)`. The
    /// portion is handed to `completion` once its contents are valid.
    pub fn get_portion_async<F>(&self, start: u64, nelems: usize, completion: F) -> Result<()>
    where
        F: FnOnce(LocalPortion) -> Result<()> + Send + 'static,
    {
        assert!(
            start + nelems as u64 <= self.inner.len,
            "portion read past end of vector"
        );
        let size = self.inner.elem.size();
        let elem = Arc::clone(&self.inner.elem);
        let buf = NumaBuf::alloc(nelems * size, current_node());
        self.with_io(|io| {
            io.submit_read(start * size as u64, buf, move |buf| {
                completion(LocalPortion::from_raw(buf, elem, Some(start), nelems))
            });
            io.flush()
        })
    }

    /// Submits an asynchronous write of `portion`. Uses the portion's own
    /// `global_start` unless `at` overrides it; the buffer is released by
    /// the write completion.
    pub fn write_portion(&self, portion: LocalPortion, at: Option<u64>) -> Result<()> {
        let start = at
            .or(portion.global_start())
            .expect("write_portion without a destination offset");
        let size = self.inner.elem.size();
        let nelems = portion.len();
        assert!(
            start + nelems as u64 <= self.inner.len,
            "portion write past end of vector"
        );
        let bytes = {
            let mut buf = portion.into_buf();
            // A truncated portion writes only its live prefix.
            if buf.len() > nelems * size {
                let mut exact = NumaBuf::alloc(nelems * size, buf.node());
                exact
                    .as_mut_slice()
                    .copy_from_slice(&buf.as_slice()[..nelems * size]);
                buf = exact;
            }
            buf
        };
        self.with_io(|io| {
            io.submit_write(start * size as u64, bytes, |_buf| Ok(()));
            io.flush()
        })
    }

    /// Synchronously reads `[start, start + nelems)` into bytes.
    pub fn read_range(&self, start: u64, nelems: usize) -> Result<Vec<u8>> {
        assert!(start + nelems as u64 <= self.inner.len);
        let size = self.inner.elem.size();
        let buf = self.with_io(|io| io.read_sync(start * size as u64, nelems * size, current_node()))?;
        Ok(buf.as_slice().to_vec())
    }

    /// Reads the whole vector; intended for small vectors and tests.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.read_range(0, self.inner.len as usize)
    }

    /// Fills the vector by applying `op` to every index, in parallel
    /// portions. No reads are issued.
    pub fn set_data<F>(&self, op: F) -> Result<()>
    where
        F: Fn(u64, &mut [u8]) + Send + Sync + 'static,
    {
        let dispatcher = Arc::new(SetDataDispatcher {
            vec: self.clone(),
            cursor: PortionCursor::new(self.inner.len, self.portion_elems()?),
            op: Arc::new(op),
        });
        run_dispatch(&self.inner.runtime, dispatcher, &[self.clone()])
    }

    /// Two-level sorted test: an exact linear scan per portion plus an
    /// ordering check over the flattened portion ends.
    pub fn is_sorted(&self) -> Result<bool> {
        let num_portions = self.num_portions()? as usize;
        if num_portions == 0 {
            return Ok(true);
        }
        let summary = Arc::new(SortedSummary {
            ends: Mutex::new(vec![0u8; 2 * num_portions * self.entry_size()]),
            sorted_portions: AtomicBitmap::new(num_portions, 0),
            portion_elems: self.portion_elems()?,
        });
        let dispatcher = Arc::new(IsSortedDispatcher {
            vec: self.clone(),
            cursor: PortionCursor::new(self.inner.len, summary.portion_elems),
            summary: Arc::clone(&summary),
        });
        // The pool's completion handshake orders the relaxed bitmap
        // stores before the reads below.
        run_dispatch(&self.inner.runtime, dispatcher, &[self.clone()])?;
        let sorted = (0..num_portions).all(|i| summary.sorted_portions.get(i))
            && self.inner.elem.is_sorted(&summary.ends.lock());
        Ok(sorted)
    }

    /// Vectors cannot grow; the backing file is sized at creation.
    pub fn resize(&self, _new_len: u64) -> Result<()> {
        Err(BrasaError::Unsupported("resize of an external vector"))
    }

    /// Appending is unsupported for the same reason as `resize`.
    pub fn append(&self, _other: &EmVec) -> Result<()> {
        Err(BrasaError::Unsupported("append to an external vector"))
    }

    /// Adopts `other`'s backing file, discarding our own. Both vectors
    /// must have drained their I/O contexts first.
    pub(crate) fn adopt_backing(&self, other: &EmVec) {
        assert_eq!(self.inner.len, other.inner.len);
        assert!(
            crate::elem::same_type(&self.inner.elem, &other.inner.elem),
            "adopt across element types"
        );
        assert!(self.inner.ios.lock().is_empty(), "adopt with live I/O handles");
        assert!(other.inner.ios.lock().is_empty(), "adopt with live I/O handles");
        let mut theirs = other.inner.backing.lock();
        let mut ours = self.inner.backing.lock();
        std::mem::swap(&mut *ours, &mut *theirs);
        self.inner.io_epoch.fetch_add(1, Ordering::Release);
        other.inner.io_epoch.fetch_add(1, Ordering::Release);
    }
}

impl Drop for VecInner {
    fn drop(&mut self) {
        debug!(id = self.id, "vec.drop");
    }
}

struct SetDataDispatcher {
    vec: EmVec,
    cursor: PortionCursor,
    op: Arc<dyn FillOp>,
}

impl Dispatch for SetDataDispatcher {
    fn issue_task(&self) -> Result<bool> {
        let Some((start, len)) = self.cursor.claim() else {
            return Ok(false);
        };
        let mut portion = LocalPortion::new(
            Some(start),
            len,
            Arc::clone(self.vec.elem()),
            current_node(),
        );
        portion.set_data(self.op.as_ref());
        self.vec.write_portion(portion, None)?;
        Ok(true)
    }
}

/// Per-portion sorted flags plus the first and last element of every
/// portion, in portion order.
struct SortedSummary {
    ends: Mutex<Vec<u8>>,
    sorted_portions: AtomicBitmap,
    portion_elems: usize,
}

struct IsSortedDispatcher {
    vec: EmVec,
    cursor: PortionCursor,
    summary: Arc<SortedSummary>,
}

impl Dispatch for IsSortedDispatcher {
    fn issue_task(&self) -> Result<bool> {
        let Some((start, len)) = self.cursor.claim() else {
            return Ok(false);
        };
        let summary = Arc::clone(&self.summary);
        self.vec.get_portion_async(start, len, move |portion| {
            let idx = (start / summary.portion_elems as u64) as usize;
            if portion.is_sorted() {
                summary.sorted_portions.set(idx);
            }
            let size = portion.entry_size();
            let mut ends = summary.ends.lock();
            ends[idx * 2 * size..(idx * 2 + 1) * size].copy_from_slice(portion.elem_at(0));
            ends[(idx * 2 + 1) * size..(idx * 2 + 2) * size]
                .copy_from_slice(portion.elem_at(portion.len() - 1));
            Ok(())
        })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::elem::{self, decode_slice};

    fn runtime() -> Arc<Runtime> {
        Runtime::new(EngineConfig::compact()).unwrap()
    }

    #[test]
    fn set_data_then_read_matches_op() {
        let rt = runtime();
        let vec = rt.create_vec(200, elem::int32()).unwrap();
        vec.set_data(|idx, out| out.copy_from_slice(&((idx as i32) * 3).to_le_bytes()))
            .unwrap();
        let values = decode_slice::<i32>(&vec.read_all().unwrap());
        assert!(values.iter().enumerate().all(|(i, &v)| v == i as i32 * 3));
    }

    #[test]
    fn is_sorted_both_ways() {
        let rt = runtime();
        let vec = rt.create_vec(100, elem::int32()).unwrap();
        vec.set_data(|idx, out| out.copy_from_slice(&(idx as i32).to_le_bytes()))
            .unwrap();
        assert!(vec.is_sorted().unwrap());

        vec.set_data(|idx, out| out.copy_from_slice(&(100 - idx as i32).to_le_bytes()))
            .unwrap();
        assert!(!vec.is_sorted().unwrap());
    }

    #[test]
    fn sorted_portions_with_misordered_boundary() {
        let rt = runtime();
        // portion size for i32 under the compact config is 16 elements;
        // each portion ascends but the second starts below the first's end.
        let vec = rt.create_vec(32, elem::int32()).unwrap();
        vec.set_data(|idx, out| {
            let v = if idx < 16 { idx as i32 + 100 } else { idx as i32 };
            out.copy_from_slice(&v.to_le_bytes())
        })
        .unwrap();
        assert!(!vec.is_sorted().unwrap());
    }

    #[test]
    fn backing_file_removed_on_drop() {
        let rt = runtime();
        let path = {
            let vec = rt.create_vec(16, elem::int32()).unwrap();
            let backing = vec.inner.backing.lock();
            backing.tmp.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn backing_file_has_exact_size() {
        let rt = runtime();
        let vec = rt.create_vec(100, elem::int64()).unwrap();
        let backing = vec.inner.backing.lock();
        assert_eq!(backing.tmp.as_file().metadata().unwrap().len(), 800);
    }

    #[test]
    fn resize_and_append_are_unsupported() {
        let rt = runtime();
        let vec = rt.create_vec(8, elem::int32()).unwrap();
        let other = rt.create_vec(8, elem::int32()).unwrap();
        assert!(matches!(
            vec.resize(16),
            Err(BrasaError::Unsupported(_))
        ));
        assert!(matches!(
            vec.append(&other),
            Err(BrasaError::Unsupported(_))
        ));
    }
}
