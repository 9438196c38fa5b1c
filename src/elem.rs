//! Erased element types.
//!
//! External vectors never carry a static element parameter; they hold an
//! [`ElemType`] descriptor and dispatch comparisons, sorting, merging and
//! arithmetic through it over raw little-endian bytes. Fixed-width
//! primitives are provided; anything with a fixed encoding and a total
//! order can implement [`ElemOps`].

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub type ElemType = Arc<dyn ElemOps>;

/// Where one merged element came from: run index and element offset
/// within that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeRef {
    pub run: u32,
    pub off: u32,
}

/// Element-wise binary operations carried by every type descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Min,
    Max,
}

pub trait ElemOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encoded size of one element in bytes.
    fn size(&self) -> usize;

    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Exact linear scan; `data` holds whole elements.
    fn is_sorted(&self, data: &[u8]) -> bool;

    /// Sorts `data` in place and writes the applied permutation into
    /// `perm`: after the call, element `i` came from offset `perm[i]`.
    fn sort_with_index(&self, data: &mut [u8], perm: &mut Vec<u32>);

    /// Writes `src[perm[i]]` to `out[i]` for every `i`.
    fn gather(&self, src: &[u8], perm: &[u32], out: &mut [u8]);

    /// K-way merges sorted `runs` into `out`, recording the source of
    /// every output element in `index`.
    fn merge_with_index(&self, runs: &[&[u8]], out: &mut [u8], index: &mut Vec<MergeRef>);

    /// Replays a recorded merge over companion runs.
    fn merge_by_index(&self, runs: &[&[u8]], index: &[MergeRef], out: &mut [u8]);

    /// First offset in sorted `data` whose element is not less than `key`.
    fn lower_bound(&self, data: &[u8], key: &[u8]) -> usize;

    fn apply(&self, op: ArithOp, a: &[u8], b: &[u8], out: &mut [u8]);
}

impl fmt::Debug for dyn ElemOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElemOps({})", self.name())
    }
}

/// Two descriptors denote the same element type iff their names match.
pub fn same_type(a: &ElemType, b: &ElemType) -> bool {
    a.name() == b.name()
}

/// A fixed-width scalar with a little-endian encoding and a total order.
pub trait Scalar: Copy + Send + Sync + 'static {
    const NAME: &'static str;
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Self;
    fn encode(self, out: &mut [u8]);
    fn key_cmp(self, other: Self) -> Ordering;
    fn arith(op: ArithOp, a: Self, b: Self) -> Self;
}

macro_rules! int_scalar {
    ($ty:ty, $name:literal) => {
        impl Scalar for $ty {
            const NAME: &'static str = $name;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn decode(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes.try_into().expect("element size mismatch"))
            }

            fn encode(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn key_cmp(self, other: Self) -> Ordering {
                self.cmp(&other)
            }

            fn arith(op: ArithOp, a: Self, b: Self) -> Self {
                match op {
                    ArithOp::Add => a.wrapping_add(b),
                    ArithOp::Min => a.min(b),
                    ArithOp::Max => a.max(b),
                }
            }
        }
    };
}

macro_rules! float_scalar {
    ($ty:ty, $name:literal) => {
        impl Scalar for $ty {
            const NAME: &'static str = $name;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn decode(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes.try_into().expect("element size mismatch"))
            }

            fn encode(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn key_cmp(self, other: Self) -> Ordering {
                self.total_cmp(&other)
            }

            fn arith(op: ArithOp, a: Self, b: Self) -> Self {
                match op {
                    ArithOp::Add => a + b,
                    ArithOp::Min => a.min(b),
                    ArithOp::Max => a.max(b),
                }
            }
        }
    };
}

int_scalar!(i32, "i32");
int_scalar!(i64, "i64");
int_scalar!(u32, "u32");
int_scalar!(u64, "u64");
float_scalar!(f32, "f32");
float_scalar!(f64, "f64");

struct Fixed<T>(PhantomData<T>);

impl<T: Scalar> Fixed<T> {
    fn decode_all(data: &[u8]) -> Vec<T> {
        debug_assert_eq!(data.len() % T::SIZE, 0);
        data.chunks_exact(T::SIZE).map(T::decode).collect()
    }
}

impl<T: Scalar> ElemOps for Fixed<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn size(&self) -> usize {
        T::SIZE
    }

    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        T::decode(a).key_cmp(T::decode(b))
    }

    fn is_sorted(&self, data: &[u8]) -> bool {
        let mut prev: Option<T> = None;
        for chunk in data.chunks_exact(T::SIZE) {
            let value = T::decode(chunk);
            if let Some(p) = prev {
                if p.key_cmp(value) == Ordering::Greater {
                    return false;
                }
            }
            prev = Some(value);
        }
        true
    }

    fn sort_with_index(&self, data: &mut [u8], perm: &mut Vec<u32>) {
        let mut pairs: Vec<(T, u32)> = Self::decode_all(data)
            .into_iter()
            .enumerate()
            .map(|(i, v)| (v, i as u32))
            .collect();
        // Stable with respect to the original order via the index tie-break.
        pairs.sort_unstable_by(|a, b| a.0.key_cmp(b.0).then(a.1.cmp(&b.1)));
        perm.clear();
        perm.reserve(pairs.len());
        for (chunk, (value, orig)) in data.chunks_exact_mut(T::SIZE).zip(&pairs) {
            value.encode(chunk);
            perm.push(*orig);
        }
    }

    fn gather(&self, src: &[u8], perm: &[u32], out: &mut [u8]) {
        assert_eq!(out.len(), perm.len() * T::SIZE);
        for (chunk, &from) in out.chunks_exact_mut(T::SIZE).zip(perm) {
            let start = from as usize * T::SIZE;
            chunk.copy_from_slice(&src[start..start + T::SIZE]);
        }
    }

    fn merge_with_index(&self, runs: &[&[u8]], out: &mut [u8], index: &mut Vec<MergeRef>) {
        let decoded: Vec<Vec<T>> = runs.iter().map(|r| Self::decode_all(r)).collect();
        let total: usize = decoded.iter().map(Vec::len).sum();
        assert_eq!(out.len(), total * T::SIZE);
        index.clear();
        index.reserve(total);
        let mut cursors = vec![0usize; decoded.len()];
        for chunk in out.chunks_exact_mut(T::SIZE) {
            let mut best: Option<(usize, T)> = None;
            for (run, values) in decoded.iter().enumerate() {
                if cursors[run] < values.len() {
                    let candidate = values[cursors[run]];
                    let better = match best {
                        None => true,
                        Some((_, current)) => candidate.key_cmp(current) == Ordering::Less,
                    };
                    if better {
                        best = Some((run, candidate));
                    }
                }
            }
            let (run, value) = best.expect("merge ran out of input");
            value.encode(chunk);
            index.push(MergeRef {
                run: run as u32,
                off: cursors[run] as u32,
            });
            cursors[run] += 1;
        }
    }

    fn merge_by_index(&self, runs: &[&[u8]], index: &[MergeRef], out: &mut [u8]) {
        assert_eq!(out.len(), index.len() * T::SIZE);
        for (chunk, mref) in out.chunks_exact_mut(T::SIZE).zip(index) {
            let src = runs[mref.run as usize];
            let start = mref.off as usize * T::SIZE;
            chunk.copy_from_slice(&src[start..start + T::SIZE]);
        }
    }

    fn lower_bound(&self, data: &[u8], key: &[u8]) -> usize {
        let key = T::decode(key);
        let len = data.len() / T::SIZE;
        let mut lo = 0usize;
        let mut hi = len;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let value = T::decode(&data[mid * T::SIZE..(mid + 1) * T::SIZE]);
            if value.key_cmp(key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn apply(&self, op: ArithOp, a: &[u8], b: &[u8], out: &mut [u8]) {
        T::arith(op, T::decode(a), T::decode(b)).encode(out);
    }
}

pub fn int32() -> ElemType {
    Arc::new(Fixed::<i32>(PhantomData))
}

pub fn int64() -> ElemType {
    Arc::new(Fixed::<i64>(PhantomData))
}

pub fn uint32() -> ElemType {
    Arc::new(Fixed::<u32>(PhantomData))
}

pub fn uint64() -> ElemType {
    Arc::new(Fixed::<u64>(PhantomData))
}

pub fn float32() -> ElemType {
    Arc::new(Fixed::<f32>(PhantomData))
}

pub fn float64() -> ElemType {
    Arc::new(Fixed::<f64>(PhantomData))
}

/// Encodes a slice of scalars into their vector byte representation.
pub fn encode_slice<T: Scalar>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::SIZE];
    for (chunk, value) in out.chunks_exact_mut(T::SIZE).zip(values) {
        value.encode(chunk);
    }
    out
}

/// Decodes vector bytes back into scalars.
pub fn decode_slice<T: Scalar>(data: &[u8]) -> Vec<T> {
    assert_eq!(data.len() % T::SIZE, 0);
    data.chunks_exact(T::SIZE).map(T::decode).collect()
}
