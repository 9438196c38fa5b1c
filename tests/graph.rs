use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use brasa::graph::format::{write_directed_graph, write_undirected_graph};
use brasa::graph::PageVertex;
use brasa::{Dir, EngineConfig, GraphContext, GraphEngine, VertexId, VertexProgram};

fn config() -> EngineConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = EngineConfig::compact();
    config.num_threads = 2;
    config
}

fn write_diamond_chain() -> (TempDir, PathBuf, PathBuf) {
    // 0 -> 1 -> 3 -> 4
    // 0 -> 2 -> 3
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("graph.data");
    let index = dir.path().join("graph.index");
    let v = |id: u64| VertexId(id);
    let adjacency = vec![
        (vec![], vec![v(1), v(2)]),
        (vec![v(0)], vec![v(3)]),
        (vec![v(0)], vec![v(3)]),
        (vec![v(1), v(2)], vec![v(4)]),
        (vec![v(3)], vec![]),
    ];
    write_directed_graph(&graph, &index, &adjacency).unwrap();
    (dir, graph, index)
}

/// Breadth-first traversal recording which vertices `run` touched per
/// level. Visited vertices never scatter again, so each level is exactly
/// the new frontier.
struct Bfs {
    visited: Vec<std::sync::atomic::AtomicBool>,
    runs: Mutex<Vec<(u32, u64)>>,
}

impl Bfs {
    fn new(num_ids: usize) -> Self {
        Self {
            visited: (0..num_ids)
                .map(|_| std::sync::atomic::AtomicBool::new(false))
                .collect(),
            runs: Mutex::new(Vec::new()),
        }
    }

    fn frontiers(&self) -> HashMap<u32, HashSet<u64>> {
        let mut map: HashMap<u32, HashSet<u64>> = HashMap::new();
        for &(level, id) in self.runs.lock().iter() {
            map.entry(level).or_default().insert(id);
        }
        map
    }
}

impl VertexProgram for Bfs {
    fn run(&self, ctx: &GraphContext<'_>, vertex: &PageVertex<'_>) {
        let id = vertex.id();
        if self.visited[id.0 as usize].swap(true, Ordering::AcqRel) {
            return;
        }
        self.runs.lock().push((ctx.level(), id.0));
        let targets: Vec<VertexId> = vertex
            .edges(Dir::Out)
            .filter(|n| !self.visited[n.0 as usize].load(Ordering::Acquire))
            .collect();
        if !targets.is_empty() {
            ctx.activate_vertices(&targets);
        }
    }
}

#[test]
fn bfs_levels_match_hop_frontiers() -> brasa::Result<()> {
    let (_dir, graph, index) = write_diamond_chain();
    let program = Arc::new(Bfs::new(5));
    let engine = GraphEngine::create(&config(), &graph, &index, program.clone())?;
    engine.start(&[VertexId(0)])?;
    engine.wait4complete()?;

    let frontiers = program.frontiers();
    assert_eq!(frontiers[&0], HashSet::from([0]));
    assert_eq!(frontiers[&1], HashSet::from([1, 2]));
    assert_eq!(frontiers[&2], HashSet::from([3]));
    assert_eq!(frontiers[&3], HashSet::from([4]));
    assert_eq!(frontiers.len(), 4);

    // vertex 3 was scattered to by both 1 and 2 yet ran exactly once
    let runs_of_3 = program
        .runs
        .lock()
        .iter()
        .filter(|&&(_, id)| id == 3)
        .count();
    assert_eq!(runs_of_3, 1);
    Ok(())
}

#[test]
fn bfs_on_undirected_graph() -> brasa::Result<()> {
    // path 0 - 1 - 2
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("u.data");
    let index = dir.path().join("u.index");
    let adjacency = vec![
        vec![VertexId(1)],
        vec![VertexId(0), VertexId(2)],
        vec![VertexId(1)],
    ];
    write_undirected_graph(&graph, &index, &adjacency).unwrap();

    let program = Arc::new(Bfs::new(3));
    let engine = GraphEngine::create(&config(), &graph, &index, program.clone())?;
    assert!(!engine.index().is_directed());
    engine.start(&[VertexId(2)])?;
    engine.wait4complete()?;

    let frontiers = program.frontiers();
    assert_eq!(frontiers[&0], HashSet::from([2]));
    assert_eq!(frontiers[&1], HashSet::from([1]));
    assert_eq!(frontiers[&2], HashSet::from([0]));
    Ok(())
}

/// PageRank over in-edges with out-degree normalization. A vertex
/// scatters while its change could still move any rank by more than the
/// per-vertex share of the tolerance.
struct PageRank {
    damping: f32,
    tolerance: f32,
    max_iters: u32,
    ranks: Vec<AtomicU32>,
    out_degree: Vec<f32>,
}

impl PageRank {
    fn new(num_ids: usize, out_degree: Vec<f32>, damping: f32, tolerance: f32, max_iters: u32) -> Self {
        Self {
            damping,
            tolerance,
            max_iters,
            ranks: (0..num_ids)
                .map(|_| AtomicU32::new((1.0 - damping).to_bits()))
                .collect(),
            out_degree,
        }
    }

    fn rank(&self, id: VertexId) -> f32 {
        f32::from_bits(self.ranks[id.0 as usize].load(Ordering::Relaxed))
    }

    fn scatter_threshold(&self, num_vertices: usize) -> f32 {
        self.tolerance * (1.0 - self.damping) / num_vertices as f32
    }
}

impl VertexProgram for PageRank {
    fn run(&self, ctx: &GraphContext<'_>, vertex: &PageVertex<'_>) {
        if ctx.level() >= self.max_iters {
            return;
        }
        let id = vertex.id();
        if vertex.num_edges(Dir::In) == 0 {
            return;
        }
        let mut accum = 0.0f32;
        for neighbor in vertex.edges(Dir::In) {
            accum += self.rank(neighbor) / self.out_degree[neighbor.0 as usize];
        }
        let new_rank = (1.0 - self.damping) + self.damping * accum;
        let old_rank = f32::from_bits(
            self.ranks[id.0 as usize].swap(new_rank.to_bits(), Ordering::Relaxed),
        );
        if (new_rank - old_rank).abs() > self.scatter_threshold(ctx.num_vertices()) {
            let dests: Vec<VertexId> = vertex.edges(Dir::Out).collect();
            if !dests.is_empty() {
                ctx.activate_vertices(&dests);
            }
        }
    }
}

#[test]
fn pagerank_on_directed_ring_converges() -> brasa::Result<()> {
    // ring 0 -> 1 -> 2 -> 3 -> 0
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("ring.data");
    let index = dir.path().join("ring.index");
    let v = |id: u64| VertexId(id);
    let adjacency = vec![
        (vec![v(3)], vec![v(1)]),
        (vec![v(0)], vec![v(2)]),
        (vec![v(1)], vec![v(3)]),
        (vec![v(2)], vec![v(0)]),
    ];
    write_directed_graph(&graph, &index, &adjacency).unwrap();

    let program = Arc::new(PageRank::new(4, vec![1.0; 4], 0.85, 1e-2, 50));
    let engine = GraphEngine::create(&config(), &graph, &index, program.clone())?;
    engine.start_all()?;
    engine.wait4complete()?;

    assert!(engine.num_levels_run() <= 50);
    let ranks: Vec<f32> = (0..4).map(|id| program.rank(VertexId(id))).collect();
    for &rank in &ranks {
        assert!((rank - 1.0).abs() < 1e-2, "rank {rank} not within 1e-2 of 1.0");
    }
    let total: f32 = ranks.iter().sum();
    assert!((total - 4.0).abs() < 1e-2, "rank sum {total} not within 1e-2 of 4.0");
    Ok(())
}

/// Counts messages delivered through the engine's synchronous channel.
struct Pinger {
    target: VertexId,
    received: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl VertexProgram for Pinger {
    fn run(&self, ctx: &GraphContext<'_>, vertex: &PageVertex<'_>) {
        if vertex.id() != self.target {
            ctx.send_msg(self.target, &vertex.id().0.to_be_bytes());
        }
    }

    fn run_on_messages(&self, _ctx: &GraphContext<'_>, id: VertexId, msgs: &[&[u8]]) {
        let mut received = self.received.lock();
        for msg in msgs {
            received.push((id.0, msg.to_vec()));
        }
    }
}

#[test]
fn messages_are_delivered_synchronously() -> brasa::Result<()> {
    let (_dir, graph, index) = write_diamond_chain();
    let program = Arc::new(Pinger {
        target: VertexId(3),
        received: Mutex::new(Vec::new()),
    });
    let engine = GraphEngine::create(&config(), &graph, &index, program.clone())?;
    engine.start_all()?;
    engine.wait4complete()?;

    let received = program.received.lock();
    // every vertex except the target ran once at level 0 and pinged
    assert_eq!(received.len(), 4);
    assert!(received.iter().all(|(dst, _)| *dst == 3));
    let senders: HashSet<u64> = received
        .iter()
        .map(|(_, payload)| u64::from_be_bytes(payload.as_slice().try_into().unwrap()))
        .collect();
    assert_eq!(senders, HashSet::from([0, 1, 2, 4]));
    Ok(())
}

/// Requests every out-neighbour's adjacency list after `run` and records
/// what arrives.
struct NeighborFetcher {
    queues: Mutex<HashMap<u64, VecDeque<VertexId>>>,
    seen: Mutex<Vec<(u64, u64, usize)>>,
    fetches: AtomicUsize,
}

impl VertexProgram for NeighborFetcher {
    fn run(&self, _ctx: &GraphContext<'_>, vertex: &PageVertex<'_>) {
        let neighbors: VecDeque<VertexId> = vertex.edges(Dir::Out).collect();
        if !neighbors.is_empty() {
            self.queues.lock().insert(vertex.id().0, neighbors);
        }
    }

    fn run_on_neighbors(
        &self,
        _ctx: &GraphContext<'_>,
        source: VertexId,
        neighbors: &[PageVertex<'_>],
    ) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let mut seen = self.seen.lock();
        for neighbor in neighbors {
            seen.push((source.0, neighbor.id().0, neighbor.num_edges(Dir::Both)));
        }
    }

    fn has_required_vertices(&self, id: VertexId) -> bool {
        self.queues
            .lock()
            .get(&id.0)
            .is_some_and(|q| !q.is_empty())
    }

    fn next_required_vertex(&self, id: VertexId) -> Option<VertexId> {
        self.queues.lock().get_mut(&id.0)?.pop_front()
    }
}

#[test]
fn batched_neighbor_fetch_delivers_adjacency_lists() -> brasa::Result<()> {
    let (_dir, graph, index) = write_diamond_chain();
    let program = Arc::new(NeighborFetcher {
        queues: Mutex::new(HashMap::new()),
        seen: Mutex::new(Vec::new()),
        fetches: AtomicUsize::new(0),
    });
    let engine = GraphEngine::create(&config(), &graph, &index, program.clone())?;
    engine.set_required_neighbor_dir(Dir::Out);
    engine.start(&[VertexId(0)])?;
    engine.wait4complete()?;

    // vertex 0 requested 1 and 2; both records arrived in one batch
    assert_eq!(program.fetches.load(Ordering::Relaxed), 1);
    let seen = program.seen.lock();
    let pairs: HashSet<(u64, u64)> = seen.iter().map(|&(s, n, _)| (s, n)).collect();
    assert_eq!(pairs, HashSet::from([(0, 1), (0, 2)]));
    // each fetched record carries its full edge lists
    assert!(seen.iter().all(|&(_, _, edges)| edges == 2));
    Ok(())
}

#[test]
fn empty_seed_completes_immediately() -> brasa::Result<()> {
    let (_dir, graph, index) = write_diamond_chain();
    let program = Arc::new(Bfs::new(5));
    let engine = GraphEngine::create(&config(), &graph, &index, program.clone())?;
    engine.start(&[])?;
    engine.wait4complete()?;
    assert!(program.runs.lock().is_empty());
    Ok(())
}
