//! In-memory typed portions: the unit of I/O and of parallel computation.

use crate::elem::ElemType;
use crate::numa::NumaBuf;

/// Fills an element given its logical index in the parent vector.
pub trait FillOp: Send + Sync {
    fn fill(&self, idx: u64, out: &mut [u8]);
}

impl<F> FillOp for F
where
    F: Fn(u64, &mut [u8]) + Send + Sync,
{
    fn fill(&self, idx: u64, out: &mut [u8]) {
        self(idx, out)
    }
}

/// A small typed vector holding a contiguous element range of its parent
/// external vector.
pub struct LocalPortion {
    global_start: Option<u64>,
    len: usize,
    elem: ElemType,
    buf: NumaBuf<u8>,
}

impl LocalPortion {
    pub fn new(global_start: Option<u64>, len: usize, elem: ElemType, node: usize) -> Self {
        let buf = NumaBuf::alloc(len * elem.size(), node);
        Self {
            global_start,
            len,
            elem,
            buf,
        }
    }

    /// Wraps a raw byte buffer that already holds `len` elements.
    pub fn from_raw(buf: NumaBuf<u8>, elem: ElemType, global_start: Option<u64>, len: usize) -> Self {
        assert_eq!(buf.len(), len * elem.size(), "buffer size mismatch");
        Self {
            global_start,
            len,
            elem,
            buf,
        }
    }

    pub fn global_start(&self) -> Option<u64> {
        self.global_start
    }

    pub fn set_global_start(&mut self, start: Option<u64>) {
        self.global_start = start;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn elem(&self) -> &ElemType {
        &self.elem
    }

    pub fn entry_size(&self) -> usize {
        self.elem.size()
    }

    pub fn node(&self) -> usize {
        self.buf.node()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf.as_slice()[..self.len * self.elem.size()]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let end = self.len * self.elem.size();
        &mut self.buf.as_mut_slice()[..end]
    }

    pub fn elem_at(&self, idx: usize) -> &[u8] {
        let size = self.elem.size();
        &self.buf.as_slice()[idx * size..(idx + 1) * size]
    }

    pub fn set_elem(&mut self, idx: usize, value: &[u8]) {
        let size = self.elem.size();
        self.buf.as_mut_slice()[idx * size..(idx + 1) * size].copy_from_slice(value);
    }

    /// Applies `op` to every logical index covered by this portion.
    /// Requires a `global_start`.
    pub fn set_data(&mut self, op: &dyn FillOp) {
        let start = self
            .global_start
            .expect("set_data requires a global start");
        let size = self.elem.size();
        let data = self.buf.as_mut_slice();
        for i in 0..self.len {
            op.fill(start + i as u64, &mut data[i * size..(i + 1) * size]);
        }
    }

    /// Shrinks the portion; capacity is retained.
    pub fn truncate(&mut self, new_len: usize) {
        assert!(new_len <= self.len);
        self.len = new_len;
    }

    pub fn is_sorted(&self) -> bool {
        self.elem.is_sorted(self.bytes())
    }

    pub fn into_buf(self) -> NumaBuf<u8> {
        self.buf
    }
}
