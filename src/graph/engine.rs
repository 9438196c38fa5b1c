//! Level-synchronous vertex-centric execution.
//!
//! The engine keeps two activation structures: the sorted current-level
//! set that workers drain in ranges, and a buffered next-level set filled
//! while a level runs. The first thread through the level barrier swaps
//! them, sorts the new current set, and advances the level; an empty
//! current set completes the run. Activation dedup rides on each vertex's
//! atomic per-level flags, so the next-level buffer never sees the same
//! vertex twice for one level.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::error::{BrasaError, Result};
use crate::graph::index::GraphIndex;
use crate::graph::vertex::{Dir, PageVertex, VertexId};
use crate::io::{FileIo, IoContext, IoStats, StdFileIo};
use crate::numa::{current_node, set_current_node};
use crate::pool::pin_to_cpu;

/// Vertices claimed from the current set per cursor bump.
const CLAIM_BATCH: usize = 16;

/// User code run against active vertices. Implementations are shared by
/// every worker; per-vertex state lives behind interior mutability inside
/// the program.
pub trait VertexProgram: Send + Sync {
    /// Invoked once per activation with the vertex's adjacency list.
    fn run(&self, ctx: &GraphContext<'_>, vertex: &PageVertex<'_>);

    /// Invoked when the adjacency lists of requested neighbours arrive.
    fn run_on_neighbors(
        &self,
        _ctx: &GraphContext<'_>,
        _source: VertexId,
        _neighbors: &[PageVertex<'_>],
    ) {
    }

    /// Invoked when another vertex delivers messages to `id`.
    fn run_on_messages(&self, _ctx: &GraphContext<'_>, _id: VertexId, _msgs: &[&[u8]]) {}

    /// Whether `id` wants a batched neighbour fetch after `run`.
    fn has_required_vertices(&self, _id: VertexId) -> bool {
        false
    }

    /// Drains the queue of neighbours `id` requested.
    fn next_required_vertex(&self, _id: VertexId) -> Option<VertexId> {
        None
    }
}

fn dir_to_u8(dir: Dir) -> u8 {
    match dir {
        Dir::Out => 0,
        Dir::In => 1,
        Dir::Both => 2,
    }
}

fn dir_from_u8(value: u8) -> Dir {
    match value {
        0 => Dir::Out,
        1 => Dir::In,
        _ => Dir::Both,
    }
}

struct EngineShared {
    index: Arc<GraphIndex>,
    file: Arc<dyn FileIo>,
    io_stats: Arc<IoStats>,
    program: Arc<dyn VertexProgram>,
    required_dir: AtomicU8,
    level: AtomicU32,
    complete: AtomicBool,
    abort: AtomicBool,
    first_error: Mutex<Option<BrasaError>>,
    current: RwLock<Vec<VertexId>>,
    cursor: AtomicUsize,
    next: Mutex<Vec<VertexId>>,
    barrier1: Barrier,
    barrier2: Barrier,
}

impl EngineShared {
    /// Records a worker failure and forces the run to wind down at the
    /// next barrier. Workers keep hitting the barriers so nobody blocks.
    fn record_abort(&self, err: BrasaError) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err);
        }
        self.abort.store(true, Ordering::Release);
    }
}

/// The engine surface exposed to user programs while a level runs.
pub struct GraphContext<'a> {
    shared: &'a EngineShared,
}

impl<'a> GraphContext<'a> {
    pub fn level(&self) -> u32 {
        self.shared.level.load(Ordering::Acquire)
    }

    pub fn num_vertices(&self) -> usize {
        self.shared.index.num_vertices()
    }

    pub fn is_directed(&self) -> bool {
        self.shared.index.is_directed()
    }

    pub fn required_neighbor_dir(&self) -> Dir {
        dir_from_u8(self.shared.required_dir.load(Ordering::Relaxed))
    }

    pub fn contains(&self, id: VertexId) -> bool {
        self.shared.index.contains(id)
    }

    /// Activates `ids` for the next level. Each vertex joins the
    /// next-level set at most once regardless of how many callers scatter
    /// to it.
    pub fn activate_vertices(&self, ids: &[VertexId]) {
        let next_level = self.level() + 1;
        let mut winners = Vec::new();
        for &id in ids {
            if self.shared.index.get_vertex(id).activate_in(next_level) {
                winners.push(id);
            }
        }
        if !winners.is_empty() {
            self.shared.next.lock().extend(winners);
        }
    }

    /// Delivers a message to `dst` synchronously on the calling thread.
    pub fn send_msg(&self, dst: VertexId, msg: &[u8]) {
        self.shared.program.run_on_messages(self, dst, &[msg]);
    }
}

/// Level-synchronous BSP scheduler over a disk-resident graph.
pub struct GraphEngine {
    shared: Arc<EngineShared>,
    num_threads: usize,
    num_nodes: usize,
    print_io_stat: bool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl GraphEngine {
    pub fn create(
        config: &EngineConfig,
        graph_path: impl AsRef<std::path::Path>,
        index_path: impl AsRef<std::path::Path>,
        program: Arc<dyn VertexProgram>,
    ) -> Result<Self> {
        config.validate()?;
        let index = Arc::new(GraphIndex::load(index_path)?);
        let file = Arc::new(StdFileIo::new(std::fs::File::open(graph_path)?));
        let num_threads = config.num_threads;
        debug!(
            vertices = index.num_vertices(),
            directed = index.is_directed(),
            num_threads,
            "graph.engine.create"
        );
        Ok(Self {
            shared: Arc::new(EngineShared {
                index,
                file,
                io_stats: Arc::new(IoStats::default()),
                program,
                required_dir: AtomicU8::new(dir_to_u8(Dir::Both)),
                level: AtomicU32::new(0),
                complete: AtomicBool::new(false),
                abort: AtomicBool::new(false),
                first_error: Mutex::new(None),
                current: RwLock::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                next: Mutex::new(Vec::new()),
                barrier1: Barrier::new(num_threads),
                barrier2: Barrier::new(num_threads),
            }),
            num_threads,
            num_nodes: config.num_nodes,
            print_io_stat: config.print_io_stat,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Restricts which edge lists batched neighbour fetches expose.
    pub fn set_required_neighbor_dir(&self, dir: Dir) {
        self.shared
            .required_dir
            .store(dir_to_u8(dir), Ordering::Relaxed);
    }

    pub fn index(&self) -> &GraphIndex {
        &self.shared.index
    }

    /// Seeds level 0 with `ids` and releases the workers.
    pub fn start(&self, ids: &[VertexId]) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BrasaError::InvalidArgument(
                "graph engine already started".into(),
            ));
        }
        {
            let mut current = self.shared.current.write();
            for &id in ids {
                if self.shared.index.get_vertex(id).activate_in(0) {
                    current.push(id);
                }
            }
            current.sort_unstable();
        }
        info!(seeds = ids.len(), "graph.engine.start");
        let mut handles = self.handles.lock();
        for worker in 0..self.num_threads {
            let shared = Arc::clone(&self.shared);
            let node = worker % self.num_nodes;
            let handle = std::thread::Builder::new()
                .name(format!("brasa-graph-{worker}"))
                .spawn(move || {
                    set_current_node(node);
                    pin_to_cpu(worker);
                    worker_loop(&shared)
                })
                .expect("spawn graph worker");
            handles.push(handle);
        }
        Ok(())
    }

    /// Activates every non-empty vertex at level 0.
    pub fn start_all(&self) -> Result<()> {
        self.start(&self.shared.index.all_vertices())
    }

    /// Blocks until the engine reaches the empty-level state and all
    /// workers have joined.
    pub fn wait4complete(&self) -> Result<()> {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let mut first_err = None;
        for handle in handles {
            match handle.join() {
                Ok(()) => {}
                Err(_) => {
                    first_err =
                        first_err.or(Some(BrasaError::Corruption("graph worker panicked")))
                }
            }
        }
        if let Some(err) = self.shared.first_error.lock().take() {
            return Err(err);
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        debug_assert!(
            self.shared.complete.load(Ordering::Acquire)
                || !self.started.load(Ordering::Acquire)
        );
        let snap = self.shared.io_stats.snapshot();
        if self.print_io_stat {
            info!(
                reads = snap.reads,
                bytes_read = snap.bytes_read,
                level = self.shared.level.load(Ordering::Acquire),
                "graph.engine.io.stats"
            );
        }
        Ok(())
    }

    pub fn num_levels_run(&self) -> u32 {
        self.shared.level.load(Ordering::Acquire)
    }
}

fn worker_loop(shared: &EngineShared) {
    let mut io = IoContext::new(Arc::clone(&shared.file), Arc::clone(&shared.io_stats));
    let ctx = GraphContext { shared };
    loop {
        while !shared.abort.load(Ordering::Acquire) {
            let start = shared.cursor.fetch_add(CLAIM_BATCH, Ordering::AcqRel);
            let batch: Vec<VertexId> = {
                let current = shared.current.read();
                if start >= current.len() {
                    break;
                }
                current[start..(start + CLAIM_BATCH).min(current.len())].to_vec()
            };
            for id in batch {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    process_vertex(shared, &ctx, &mut io, id)
                }));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => shared.record_abort(err),
                    Err(_) => {
                        shared.record_abort(BrasaError::Corruption("vertex program panicked"))
                    }
                }
            }
        }
        let leader = shared.barrier1.wait().is_leader();
        if leader {
            if shared.abort.load(Ordering::Acquire) {
                shared.complete.store(true, Ordering::Release);
            } else {
                advance_level(shared);
            }
        }
        shared.barrier2.wait();
        if shared.complete.load(Ordering::Acquire) {
            return;
        }
    }
}

fn process_vertex(
    shared: &EngineShared,
    ctx: &GraphContext<'_>,
    io: &mut IoContext,
    id: VertexId,
) -> Result<()> {
    let handle = shared.index.get_vertex(id);
    let buf = io.read_sync(handle.offset(), handle.size() as usize, current_node())?;
    let vertex = PageVertex::parse(buf.as_slice(), shared.index.is_directed(), id)?;
    shared.program.run(ctx, &vertex);

    if shared.program.has_required_vertices(id) {
        let mut required = Vec::new();
        while let Some(req) = shared.program.next_required_vertex(id) {
            required.push(req);
        }
        let mut bufs = Vec::with_capacity(required.len());
        for &req in &required {
            let h = shared.index.get_vertex(req);
            bufs.push(io.read_sync(h.offset(), h.size() as usize, current_node())?);
        }
        let views = required
            .iter()
            .zip(&bufs)
            .map(|(&req, buf)| PageVertex::parse(buf.as_slice(), shared.index.is_directed(), req))
            .collect::<Result<Vec<_>>>()?;
        shared.program.run_on_neighbors(ctx, id, &views);
    }
    Ok(())
}

/// Runs on the first thread through the level barrier: swap the sets,
/// sort the new current set, advance the level, detect completion.
fn advance_level(shared: &EngineShared) {
    let mut current = shared.current.write();
    let mut next = shared.next.lock();
    current.clear();
    current.append(&mut next);
    drop(next);
    current.sort_unstable();
    shared.cursor.store(0, Ordering::Release);
    let level = shared.level.fetch_add(1, Ordering::AcqRel) + 1;
    if current.is_empty() {
        shared.complete.store(true, Ordering::Release);
    }
    trace!(level, active = current.len(), "graph.level.advance");
}
