//! External-memory sort: partition-sort pass, anchor priority queue, and
//! the single k-way merge pass.
//!
//! Pass 1 sorts each sort-buffer-sized chunk in memory and samples an
//! anchor value every `anchor_gap` elements. Pass 2 builds a min-heap of
//! anchors and repeatedly reads the ranges that may hold the globally
//! smallest values, merging everything strictly below the heap's frontier
//! and carrying the rest as leftover into the next round.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::dispatcher::{run_dispatch, run_dispatch_single, Dispatch, PortionCursor};
use crate::elem::ElemType;
use crate::error::{BrasaError, Result};
use crate::numa::current_node;
use crate::vector::local::LocalPortion;
use crate::vector::EmVec;

/// Per-chunk anchor values captured during pass 1.
struct SortSummary {
    elem: ElemType,
    chunk_elems: usize,
    anchor_gap: usize,
    anchors: Mutex<Vec<Option<Vec<u8>>>>,
}

impl SortSummary {
    fn new(elem: ElemType, chunk_elems: usize, anchor_gap: usize, num_chunks: usize) -> Self {
        Self {
            elem,
            chunk_elems,
            anchor_gap,
            anchors: Mutex::new(vec![None; num_chunks]),
        }
    }

    fn add_chunk(&self, sorted: &LocalPortion) {
        debug_assert!(sorted.is_sorted());
        let start = sorted.global_start().expect("chunk without global start");
        let idx = (start / self.chunk_elems as u64) as usize;
        let size = self.elem.size();
        let mut keys = Vec::with_capacity(sorted.len().div_ceil(self.anchor_gap) * size);
        let mut off = 0;
        while off < sorted.len() {
            keys.extend_from_slice(sorted.elem_at(off));
            off += self.anchor_gap;
        }
        let mut anchors = self.anchors.lock();
        assert!(anchors[idx].is_none(), "chunk {idx} sorted twice");
        anchors[idx] = Some(keys);
    }

    fn into_queue(self, vec_len: u64) -> AnchorQueue {
        let anchors: Vec<Vec<u8>> = self
            .anchors
            .into_inner()
            .into_iter()
            .map(|a| a.expect("chunk missing from sort summary"))
            .collect();
        AnchorQueue::new(anchors, self.elem, self.chunk_elems, self.anchor_gap, vec_len)
    }
}

struct HeapEntry {
    key: SmallVec<[u8; 16]>,
    chunk: u32,
    pos: u32,
    elem: ElemType,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.elem
            .cmp(&self.key, &other.key)
            .then_with(|| self.chunk.cmp(&other.chunk))
            .then_with(|| self.pos.cmp(&other.pos))
    }
}

/// Min-heap over the not-yet-consumed anchors of every chunk. The top key
/// is a lower bound on every element that has not been read from its
/// chunk.
struct AnchorQueue {
    heap: BinaryHeap<std::cmp::Reverse<HeapEntry>>,
    anchors: Vec<Vec<u8>>,
    elem: ElemType,
    chunk_elems: usize,
    anchor_gap: usize,
    vec_len: u64,
}

impl AnchorQueue {
    fn new(
        anchors: Vec<Vec<u8>>,
        elem: ElemType,
        chunk_elems: usize,
        anchor_gap: usize,
        vec_len: u64,
    ) -> Self {
        let mut heap = BinaryHeap::with_capacity(anchors.len());
        let size = elem.size();
        for (chunk, keys) in anchors.iter().enumerate() {
            debug_assert!(!keys.is_empty());
            heap.push(std::cmp::Reverse(HeapEntry {
                key: SmallVec::from_slice(&keys[..size]),
                chunk: chunk as u32,
                pos: 0,
                elem: Arc::clone(&elem),
            }));
        }
        Self {
            heap,
            anchors,
            elem,
            chunk_elems,
            anchor_gap,
            vec_len,
        }
    }

    fn key_at(&self, chunk: u32, pos: u32) -> &[u8] {
        let size = self.elem.size();
        let start = pos as usize * size;
        &self.anchors[chunk as usize][start..start + size]
    }

    fn num_anchors(&self, chunk: u32) -> u32 {
        (self.anchors[chunk as usize].len() / self.elem.size()) as u32
    }

    /// Pops anchors covering at most `budget` elements and returns their
    /// global element offsets.
    fn pop(&mut self, budget: usize) -> Vec<u64> {
        let mut offs = Vec::new();
        let mut remaining = budget;
        while remaining > 0 {
            let Some(std::cmp::Reverse(top)) = self.heap.pop() else {
                break;
            };
            offs.push(top.chunk as u64 * self.chunk_elems as u64
                + top.pos as u64 * self.anchor_gap as u64);
            remaining = remaining.saturating_sub(self.anchor_gap);
            // Put the chunk back if it still has anchors left.
            if top.pos + 1 < self.num_anchors(top.chunk) {
                let key = SmallVec::from_slice(self.key_at(top.chunk, top.pos + 1));
                self.heap.push(std::cmp::Reverse(HeapEntry {
                    key,
                    chunk: top.chunk,
                    pos: top.pos + 1,
                    elem: Arc::clone(&top.elem),
                }));
            }
        }
        offs
    }

    /// The smallest anchor value that has not been popped, if any.
    fn min_frontier(&self) -> Option<Vec<u8>> {
        self.heap
            .peek()
            .map(|std::cmp::Reverse(entry)| entry.key.to_vec())
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Coalesces sorted anchor offsets into contiguous read ranges. A
    /// range never crosses a chunk boundary; each chunk is a separate
    /// sorted run.
    fn coalesce(&self, mut offs: Vec<u64>) -> Vec<(u64, usize)> {
        offs.sort_unstable();
        let gap = self.anchor_gap as u64;
        let chunk = self.chunk_elems as u64;
        let mut ranges = Vec::new();
        let mut i = 0;
        while i < offs.len() {
            let start = offs[i];
            let mut total = (self.vec_len - start).min(gap);
            while i + 1 < offs.len()
                && offs[i + 1] == offs[i] + gap
                && offs[i + 1] / chunk == offs[i] / chunk
            {
                i += 1;
                total += (self.vec_len - offs[i]).min(gap);
            }
            ranges.push((start, total as usize));
            i += 1;
        }
        ranges
    }
}

/////////////////////////// Pass 1: partition sort ///////////////////////////

struct SortDispatcher {
    from: Vec<EmVec>,
    to: Vec<EmVec>,
    cursor: PortionCursor,
    summary: Arc<SortSummary>,
}

struct ChunkState {
    to: Vec<EmVec>,
    summary: Arc<SortSummary>,
    bufs: Mutex<Vec<Option<LocalPortion>>>,
    remaining: AtomicUsize,
}

impl ChunkState {
    fn complete(&self, slot: usize, portion: LocalPortion) -> Result<()> {
        self.bufs.lock()[slot] = Some(portion);
        if self.remaining.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
            self.finish()?;
        }
        Ok(())
    }

    /// All reads for this chunk have landed: sort the key chunk, shuffle
    /// companions by the captured permutation, sample anchors, write back.
    fn finish(&self) -> Result<()> {
        let mut bufs = self.bufs.lock();
        let mut key_buf = bufs[0].take().expect("missing key chunk");
        let mut perm = Vec::new();
        let key_elem = Arc::clone(key_buf.elem());
        key_elem.sort_with_index(key_buf.bytes_mut(), &mut perm);
        self.summary.add_chunk(&key_buf);
        trace!(
            start = key_buf.global_start(),
            len = key_buf.len(),
            "sort.pass1.chunk"
        );
        self.to[0].write_portion(key_buf, None)?;
        for (slot, out_vec) in self.to.iter().enumerate().skip(1) {
            let src = bufs[slot].take().expect("missing companion chunk");
            let mut shuffled = LocalPortion::new(
                src.global_start(),
                src.len(),
                Arc::clone(src.elem()),
                src.node(),
            );
            src.elem().gather(src.bytes(), &perm, shuffled.bytes_mut());
            out_vec.write_portion(shuffled, None)?;
        }
        Ok(())
    }
}

impl Dispatch for SortDispatcher {
    fn issue_task(&self) -> Result<bool> {
        let Some((start, len)) = self.cursor.claim() else {
            return Ok(false);
        };
        let state = Arc::new(ChunkState {
            to: self.to.clone(),
            summary: Arc::clone(&self.summary),
            bufs: Mutex::new((0..self.from.len()).map(|_| None).collect()),
            remaining: AtomicUsize::new(self.from.len()),
        });
        for (slot, vec) in self.from.iter().enumerate() {
            let state = Arc::clone(&state);
            vec.get_portion_async(start, len, move |portion| state.complete(slot, portion))?;
        }
        Ok(true)
    }
}

/////////////////////////// Pass 2: k-way merge //////////////////////////////

/// Buffers appends into a write-aligned staging buffer and only writes
/// full buffers (or the final tail).
struct MergeWriter {
    to: EmVec,
    cap: usize,
    buf: LocalPortion,
    fill: usize,
    write_pos: u64,
}

impl MergeWriter {
    fn new(to: EmVec) -> Result<Self> {
        let entry = to.entry_size();
        let cap_bytes = to.runtime().config().write_io_buf_bytes;
        if cap_bytes % entry != 0 {
            return Err(BrasaError::Config(format!(
                "entry size {entry} does not divide write_io_buf_bytes ({cap_bytes})"
            )));
        }
        let cap = cap_bytes / entry;
        let buf = LocalPortion::new(None, cap, Arc::clone(to.elem()), current_node());
        Ok(Self {
            to,
            cap,
            buf,
            fill: 0,
            write_pos: 0,
        })
    }

    fn append(&mut self, mut data: &[u8]) -> Result<()> {
        let size = self.to.entry_size();
        debug_assert_eq!(data.len() % size, 0);
        while !data.is_empty() {
            let space = (self.cap - self.fill) * size;
            let take = space.min(data.len());
            self.buf.bytes_mut()[self.fill * size..self.fill * size + take]
                .copy_from_slice(&data[..take]);
            self.fill += take / size;
            data = &data[take..];
            if self.fill == self.cap {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Writes the staged data, if any. The data goes out asynchronously,
    /// so a fresh staging buffer is allocated.
    fn flush(&mut self) -> Result<()> {
        if self.fill == 0 {
            return Ok(());
        }
        let fresh = LocalPortion::new(None, self.cap, Arc::clone(self.to.elem()), current_node());
        let mut full = std::mem::replace(&mut self.buf, fresh);
        full.truncate(self.fill);
        full.set_global_start(Some(self.write_pos));
        self.to.write_portion(full, None)?;
        self.write_pos += self.fill as u64;
        self.fill = 0;
        Ok(())
    }
}

struct MergeState {
    queue: AnchorQueue,
    leftovers: Vec<Option<LocalPortion>>,
}

struct MergeShared {
    from: Vec<EmVec>,
    writers: Vec<Mutex<MergeWriter>>,
    state: Mutex<MergeState>,
    chunk_elems: usize,
}

struct MergeDispatcher {
    shared: Arc<MergeShared>,
}

struct RoundState {
    shared: Arc<MergeShared>,
    leftovers: Mutex<Vec<Option<LocalPortion>>>,
    bufs: Mutex<Vec<Vec<Option<LocalPortion>>>>,
    remaining: AtomicUsize,
}

impl Dispatch for MergeDispatcher {
    fn issue_task(&self) -> Result<bool> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let leftover = state.leftovers[0].as_ref().map_or(0, LocalPortion::len);
        assert!(
            leftover < shared.chunk_elems,
            "merge leftover exceeded the sort buffer"
        );
        let offs = state.queue.pop(shared.chunk_elems - leftover);
        if offs.is_empty() && leftover == 0 {
            debug_assert!(state.queue.is_empty());
            drop(state);
            // Nothing left to merge; force out the buffered tails.
            for writer in &shared.writers {
                writer.lock().flush()?;
            }
            return Ok(false);
        }
        if offs.is_empty() {
            // No data left on disk; the previous leftovers are the tail.
            let lefts: Vec<LocalPortion> = state
                .leftovers
                .iter_mut()
                .map(|l| l.take().expect("uneven leftovers"))
                .collect();
            drop(state);
            for (idx, left) in lefts.into_iter().enumerate() {
                let mut writer = shared.writers[idx].lock();
                writer.append(left.bytes())?;
                writer.flush()?;
            }
            return Ok(true);
        }
        let ranges = state.queue.coalesce(offs);
        let leftovers = std::mem::replace(
            &mut state.leftovers,
            (0..shared.from.len()).map(|_| None).collect(),
        );
        drop(state);
        trace!(ranges = ranges.len(), leftover, "sort.merge.round");
        let round = Arc::new(RoundState {
            shared: Arc::clone(shared),
            leftovers: Mutex::new(leftovers),
            bufs: Mutex::new(
                (0..shared.from.len())
                    .map(|_| (0..ranges.len()).map(|_| None).collect())
                    .collect(),
            ),
            remaining: AtomicUsize::new(shared.from.len() * ranges.len()),
        });
        for (v, vec) in shared.from.iter().enumerate() {
            for (r, &(start, len)) in ranges.iter().enumerate() {
                let round = Arc::clone(&round);
                vec.get_portion_async(start, len, move |portion| round.complete(v, r, portion))?;
            }
        }
        Ok(true)
    }
}

impl RoundState {
    fn complete(&self, vec_idx: usize, range_idx: usize, portion: LocalPortion) -> Result<()> {
        self.bufs.lock()[vec_idx][range_idx] = Some(portion);
        if self.remaining.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
            self.merge()?;
        }
        Ok(())
    }

    /// Every read of the round has landed: partition each run at the heap
    /// frontier, merge the safe prefixes, and carry the suffixes forward.
    fn merge(&self) -> Result<()> {
        let shared = &self.shared;
        let nvecs = shared.from.len();
        let mut bufs = self.bufs.lock();
        let mut leftovers = self.leftovers.lock();

        // Runs per vector: previous leftover first, then this round's
        // ranges. Run lengths line up across vectors because every vector
        // read the same element ranges and leftovers shrink in lockstep.
        let mut runs: Vec<Vec<LocalPortion>> = Vec::with_capacity(nvecs);
        for (v, ranges) in bufs.iter_mut().enumerate() {
            let mut vec_runs = Vec::with_capacity(ranges.len() + 1);
            if let Some(left) = leftovers[v].take() {
                vec_runs.push(left);
            }
            for slot in ranges.iter_mut() {
                vec_runs.push(slot.take().expect("missing merge range"));
            }
            runs.push(vec_runs);
        }
        drop(leftovers);
        drop(bufs);
        debug_assert!(runs.iter().all(|r| r.len() == runs[0].len()));

        let elem0 = Arc::clone(runs[0][0].elem());
        let min = shared.state.lock().queue.min_frontier();

        // Cut each key run at the first element the heap could still
        // undercut; everything before the cut is safe to emit.
        let cuts: Vec<usize> = runs[0]
            .iter()
            .map(|run| match &min {
                Some(key) => elem0.lower_bound(run.bytes(), key),
                None => run.len(),
            })
            .collect();
        let merge_len: usize = cuts.iter().sum();
        let leftover_len: usize =
            runs[0].iter().zip(&cuts).map(|(r, &c)| r.len() - c).sum();

        let mut merge_index = Vec::new();
        let mut leftover_index = Vec::new();
        let mut new_leftovers: Vec<Option<LocalPortion>> = (0..nvecs).map(|_| None).collect();

        for (v, vec_runs) in runs.iter().enumerate() {
            let elem = Arc::clone(vec_runs[0].elem());
            let size = elem.size();
            let prefixes: Vec<&[u8]> = vec_runs
                .iter()
                .zip(&cuts)
                .map(|(run, &cut)| &run.bytes()[..cut * size])
                .collect();
            let suffixes: Vec<&[u8]> = vec_runs
                .iter()
                .zip(&cuts)
                .map(|(run, &cut)| &run.bytes()[cut * size..])
                .collect();

            let mut merged = LocalPortion::new(None, merge_len, Arc::clone(&elem), current_node());
            if v == 0 {
                elem.merge_with_index(&prefixes, merged.bytes_mut(), &mut merge_index);
            } else {
                elem.merge_by_index(&prefixes, &merge_index, merged.bytes_mut());
            }
            shared.writers[v].lock().append(merged.bytes())?;

            if leftover_len > 0 {
                let mut leftover =
                    LocalPortion::new(None, leftover_len, Arc::clone(&elem), current_node());
                if v == 0 {
                    elem.merge_with_index(&suffixes, leftover.bytes_mut(), &mut leftover_index);
                } else {
                    elem.merge_by_index(&suffixes, &leftover_index, leftover.bytes_mut());
                }
                new_leftovers[v] = Some(leftover);
            }
        }

        shared.state.lock().leftovers = new_leftovers;
        Ok(())
    }
}

//////////////////////////////// Entry points ////////////////////////////////

/// Sorts `vecs[0]` and applies the same permutation to every companion
/// vector. All vectors must have the same length. Returns freshly backed
/// sorted vectors in input order.
pub fn sort_vecs(vecs: &[EmVec]) -> Result<Vec<EmVec>> {
    let Some(first) = vecs.first() else {
        return Err(BrasaError::InvalidArgument("co-sort of zero vectors".into()));
    };
    for vec in &vecs[1..] {
        if vec.len() != first.len() {
            error!(
                expected = first.len(),
                got = vec.len(),
                "co-sort length mismatch"
            );
            return Err(BrasaError::Config(
                "not all vectors have the same length".into(),
            ));
        }
    }
    let runtime = Arc::clone(first.runtime());
    let config = runtime.config();
    let entry = first.entry_size();
    // portion_elems also checks that the entry size divides the intervals
    let _ = first.portion_elems()?;
    let chunk_elems = config.sort_buf_bytes / entry;
    let anchor_gap = config.anchor_gap_bytes / entry;
    debug_assert_eq!(chunk_elems % anchor_gap, 0);
    let len = first.len();
    let num_chunks = len.div_ceil(chunk_elems as u64) as usize;
    // A single merge level keeps up to one anchor gap of leftover per
    // chunk between rounds; the leftover must always fit in the sort
    // buffer alongside at least one fresh anchor range.
    let max_chunks = chunk_elems / anchor_gap;
    if num_chunks > max_chunks {
        return Err(BrasaError::Config(format!(
            "vector spans {num_chunks} sort chunks but one merge level supports \
             at most {max_chunks} with this sort_buf_bytes/anchor_gap_bytes"
        )));
    }
    debug!(
        vectors = vecs.len(),
        len,
        chunk_elems,
        anchor_gap,
        "sort.start"
    );

    // Pass 1: sort each chunk in place into temp vectors, capturing
    // anchors.
    let mut tmp = Vec::with_capacity(vecs.len());
    for vec in vecs {
        tmp.push(runtime.create_vec(len, Arc::clone(vec.elem()))?);
    }
    let summary = Arc::new(SortSummary::new(
        Arc::clone(first.elem()),
        chunk_elems,
        anchor_gap,
        num_chunks,
    ));
    let sort_dispatcher = Arc::new(SortDispatcher {
        from: vecs.to_vec(),
        to: tmp.clone(),
        cursor: PortionCursor::new(len, chunk_elems),
        summary: Arc::clone(&summary),
    });
    let mut touched: Vec<EmVec> = vecs.to_vec();
    touched.extend(tmp.iter().cloned());
    run_dispatch(&runtime, sort_dispatcher, &touched)?;

    // Pass 2: one level of merging, driven by a single asynchronous
    // producer/consumer worker.
    let mut out = Vec::with_capacity(vecs.len());
    for vec in vecs {
        out.push(runtime.create_vec(len, Arc::clone(vec.elem()))?);
    }
    let summary = Arc::into_inner(summary).expect("sort summary still shared");
    let queue = summary.into_queue(len);
    let mut writers = Vec::with_capacity(out.len());
    for vec in &out {
        writers.push(Mutex::new(MergeWriter::new(vec.clone())?));
    }
    let merge_dispatcher = Arc::new(MergeDispatcher {
        shared: Arc::new(MergeShared {
            from: tmp.clone(),
            writers,
            state: Mutex::new(MergeState {
                queue,
                leftovers: (0..vecs.len()).map(|_| None).collect(),
            }),
            chunk_elems,
        }),
    });
    let mut touched: Vec<EmVec> = tmp.clone();
    touched.extend(out.iter().cloned());
    run_dispatch_single(&runtime, merge_dispatcher, &touched)?;
    debug!(len, "sort.done");
    Ok(out)
}

impl EmVec {
    /// Sorts this vector in place. The sorted result's backing file is
    /// adopted and the old one is unlinked.
    pub fn sort(&self) -> Result<()> {
        let out = sort_vecs(&[self.clone()])?;
        self.adopt_backing(&out[0]);
        Ok(())
    }
}
