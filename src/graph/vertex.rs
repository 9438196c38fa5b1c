//! Vertex metadata, activation flags, and the borrowed adjacency view.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BrasaError, Result};
use crate::graph::format::{DIRECTED_HEADER_LEN, UNDIRECTED_HEADER_LEN};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VertexId(pub u64);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Edge direction selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dir {
    Out,
    In,
    Both,
}

/// Deepest level the activation fast path can represent.
pub const MAX_LEVELS: u32 = 64;

/// Immutable placement of a vertex's record plus its per-level activation
/// flags.
pub struct VertexHandle {
    id: VertexId,
    offset: u64,
    size: u32,
    activated_levels: AtomicU64,
}

impl VertexHandle {
    pub(crate) fn new(id: VertexId, offset: u64, size: u32) -> Self {
        Self {
            id,
            offset,
            size,
            activated_levels: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Atomically activates this vertex in `level`. Returns true iff the
    /// level bit transitioned from clear to set, so a vertex is activated
    /// at most once per level no matter how many neighbours scatter to
    /// it. Activation levels only increase.
    pub fn activate_in(&self, level: u32) -> bool {
        assert!(
            level < MAX_LEVELS,
            "activation level {level} exceeds the {MAX_LEVELS}-level fast path"
        );
        let bit = 1u64 << level;
        let prev = self.activated_levels.fetch_or(bit, Ordering::Relaxed);
        assert!(
            prev >> level <= 1,
            "vertex {} activated below level {level}",
            self.id
        );
        prev & bit == 0
    }

    pub fn is_activated(&self, level: u32) -> bool {
        assert!(level < MAX_LEVELS);
        self.activated_levels.load(Ordering::Relaxed) & (1u64 << level) != 0
    }
}

/// Borrowed view of one vertex record read from the graph data file.
pub struct PageVertex<'a> {
    id: VertexId,
    directed: bool,
    ins: &'a [u8],
    outs: &'a [u8],
}

impl<'a> PageVertex<'a> {
    /// Parses a record, checking that it belongs to `expected`.
    pub fn parse(data: &'a [u8], directed: bool, expected: VertexId) -> Result<Self> {
        let header_len = if directed {
            DIRECTED_HEADER_LEN
        } else {
            UNDIRECTED_HEADER_LEN
        };
        if data.len() < header_len {
            return Err(BrasaError::Corruption("vertex record truncated"));
        }
        let id = VertexId(u64::from_be_bytes(data[0..8].try_into().unwrap()));
        if id != expected {
            return Err(BrasaError::Corruption("vertex record id mismatch"));
        }
        let (ins, outs) = if directed {
            let num_in = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
            let num_out = u32::from_be_bytes(data[12..16].try_into().unwrap()) as usize;
            if data.len() != header_len + 8 * (num_in + num_out) {
                return Err(BrasaError::Corruption("vertex record length mismatch"));
            }
            let ins = &data[header_len..header_len + 8 * num_in];
            let outs = &data[header_len + 8 * num_in..];
            (ins, outs)
        } else {
            let num = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
            if data.len() != header_len + 8 * num {
                return Err(BrasaError::Corruption("vertex record length mismatch"));
            }
            let edges = &data[header_len..];
            (edges, edges)
        };
        Ok(Self {
            id,
            directed,
            ins,
            outs,
        })
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    pub fn num_edges(&self, dir: Dir) -> usize {
        match dir {
            Dir::In => self.ins.len() / 8,
            Dir::Out => self.outs.len() / 8,
            Dir::Both => {
                if self.directed {
                    (self.ins.len() + self.outs.len()) / 8
                } else {
                    self.outs.len() / 8
                }
            }
        }
    }

    /// Iterates over the neighbour ids in `dir`. For undirected vertices
    /// every direction yields the single edge list.
    pub fn edges(&self, dir: Dir) -> impl Iterator<Item = VertexId> + '_ {
        let (first, second): (&[u8], &[u8]) = match (self.directed, dir) {
            (false, _) => (self.outs, &[]),
            (true, Dir::In) => (self.ins, &[]),
            (true, Dir::Out) => (self.outs, &[]),
            (true, Dir::Both) => (self.ins, self.outs),
        };
        first
            .chunks_exact(8)
            .chain(second.chunks_exact(8))
            .map(|chunk| VertexId(u64::from_be_bytes(chunk.try_into().unwrap())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_is_idempotent_per_level() {
        let v = VertexHandle::new(VertexId(1), 0, 16);
        assert!(v.activate_in(0));
        assert!(!v.activate_in(0));
        assert!(v.is_activated(0));
        assert!(!v.is_activated(1));
    }

    #[test]
    fn activation_levels_increase_monotonically() {
        let v = VertexHandle::new(VertexId(1), 0, 16);
        assert!(v.activate_in(3));
        assert!(v.activate_in(7));
        assert!(v.is_activated(3) && v.is_activated(7));
    }

    #[test]
    #[should_panic(expected = "fast path")]
    fn activation_beyond_64_levels_panics() {
        let v = VertexHandle::new(VertexId(1), 0, 16);
        v.activate_in(64);
    }

    #[test]
    #[should_panic(expected = "activated below level")]
    fn activation_below_current_level_panics() {
        let v = VertexHandle::new(VertexId(1), 0, 16);
        assert!(v.activate_in(5));
        v.activate_in(2);
    }

    #[test]
    fn parse_directed_record() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u64.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        for id in [9u64, 3, 4] {
            data.extend_from_slice(&id.to_be_bytes());
        }
        let v = PageVertex::parse(&data, true, VertexId(5)).unwrap();
        assert_eq!(v.num_edges(Dir::In), 1);
        assert_eq!(v.num_edges(Dir::Out), 2);
        assert_eq!(v.num_edges(Dir::Both), 3);
        assert_eq!(
            v.edges(Dir::Out).collect::<Vec<_>>(),
            vec![VertexId(3), VertexId(4)]
        );
        assert_eq!(v.edges(Dir::In).collect::<Vec<_>>(), vec![VertexId(9)]);
    }

    #[test]
    fn parse_undirected_record_serves_both_directions() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u64.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        for id in [0u64, 1] {
            data.extend_from_slice(&id.to_be_bytes());
        }
        let v = PageVertex::parse(&data, false, VertexId(2)).unwrap();
        assert_eq!(v.edges(Dir::In).collect::<Vec<_>>(), v.edges(Dir::Out).collect::<Vec<_>>());
        assert_eq!(v.num_edges(Dir::Both), 2);
    }

    #[test]
    fn parse_rejects_id_mismatch() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u64.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        assert!(PageVertex::parse(&data, true, VertexId(6)).is_err());
    }
}
