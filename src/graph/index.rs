//! Dense vertex-id index over the compact array of non-empty vertices.

use std::path::Path;

use tracing::info;

use crate::error::{BrasaError, Result};
use crate::graph::format::{
    min_vertex_size, IndexEntry, IndexHeader, INDEX_ENTRY_LEN, INDEX_HEADER_LEN,
};
use crate::graph::vertex::{VertexHandle, VertexId};

const EMPTY: u32 = u32::MAX;

/// Maps vertex id to its handle. Vertices whose record is no larger than
/// the bare header carry no edges and stay out of the compact array.
pub struct GraphIndex {
    directed: bool,
    dense: Vec<u32>,
    vertices: Vec<VertexHandle>,
}

impl GraphIndex {
    /// Builds the index from a persisted vertex-index file. The file is
    /// consumed once; handles live in memory afterwards.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < INDEX_HEADER_LEN {
            return Err(BrasaError::Corruption("vertex index file truncated"));
        }
        let header = IndexHeader::decode(&bytes)?;
        let expected = INDEX_HEADER_LEN + header.num_vertices as usize * INDEX_ENTRY_LEN;
        if bytes.len() != expected {
            return Err(BrasaError::Corruption("vertex index entry count mismatch"));
        }
        let min_size = min_vertex_size(header.directed);
        let entries = bytes[INDEX_HEADER_LEN..]
            .chunks_exact(INDEX_ENTRY_LEN)
            .map(IndexEntry::decode)
            .collect::<Result<Vec<_>>>()?;

        // First pass counts the non-empty vertices so the compact array
        // is allocated once.
        let num_non_empty = entries
            .iter()
            .filter(|e| e.size > min_size as i32)
            .count();
        let mut dense = vec![EMPTY; entries.len()];
        let mut vertices = Vec::with_capacity(num_non_empty);
        for (id, entry) in entries.iter().enumerate() {
            if entry.size > min_size as i32 {
                if entry.offset < 0 {
                    return Err(BrasaError::Corruption("negative vertex offset"));
                }
                dense[id] = vertices.len() as u32;
                vertices.push(VertexHandle::new(
                    VertexId(id as u64),
                    entry.offset as u64,
                    entry.size as u32,
                ));
            }
        }
        debug_assert_eq!(vertices.len(), num_non_empty);
        info!(
            total = entries.len(),
            non_empty = vertices.len(),
            directed = header.directed,
            "graph.index.load"
        );
        Ok(Self {
            directed: header.directed,
            dense,
            vertices,
        })
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Handle of a non-empty vertex. Panics for empty or unknown ids;
    /// callers filter through `contains`.
    pub fn get_vertex(&self, id: VertexId) -> &VertexHandle {
        let compact = self.dense[id.0 as usize];
        assert!(compact != EMPTY, "vertex {id} has no edges");
        let vertex = &self.vertices[compact as usize];
        debug_assert_eq!(vertex.id(), id);
        vertex
    }

    pub fn contains(&self, id: VertexId) -> bool {
        (id.0 as usize) < self.dense.len() && self.dense[id.0 as usize] != EMPTY
    }

    /// Ids of every non-empty vertex, ascending.
    pub fn all_vertices(&self) -> Vec<VertexId> {
        self.vertices.iter().map(VertexHandle::id).collect()
    }

    pub fn min_vertex_id(&self) -> Option<VertexId> {
        self.vertices.first().map(VertexHandle::id)
    }

    pub fn max_vertex_id(&self) -> Option<VertexId> {
        self.vertices.last().map(VertexHandle::id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::format::write_directed_graph;

    fn diamond_index() -> (tempfile::TempDir, GraphIndex) {
        let dir = tempfile::tempdir().unwrap();
        let graph_path = dir.path().join("graph.data");
        let index_path = dir.path().join("graph.index");
        // 0 -> 1 -> 3, 0 -> 2 -> 3, vertex 4 isolated
        let adjacency = vec![
            (vec![], vec![VertexId(1), VertexId(2)]),
            (vec![VertexId(0)], vec![VertexId(3)]),
            (vec![VertexId(0)], vec![VertexId(3)]),
            (vec![VertexId(1), VertexId(2)], vec![]),
            (vec![], vec![]),
        ];
        write_directed_graph(&graph_path, &index_path, &adjacency).unwrap();
        let index = GraphIndex::load(&index_path).unwrap();
        (dir, index)
    }

    #[test]
    fn filters_empty_vertices() {
        let (_dir, index) = diamond_index();
        assert!(index.is_directed());
        assert_eq!(index.num_vertices(), 4);
        assert!(index.contains(VertexId(0)));
        assert!(!index.contains(VertexId(4)));
        assert_eq!(
            index.all_vertices(),
            vec![VertexId(0), VertexId(1), VertexId(2), VertexId(3)]
        );
        assert_eq!(index.min_vertex_id(), Some(VertexId(0)));
        assert_eq!(index.max_vertex_id(), Some(VertexId(3)));
    }

    #[test]
    fn compact_index_points_back_at_ids() {
        let (_dir, index) = diamond_index();
        for id in index.all_vertices() {
            assert_eq!(index.get_vertex(id).id(), id);
        }
    }

    #[test]
    #[should_panic(expected = "has no edges")]
    fn get_vertex_traps_on_empty_id() {
        let (_dir, index) = diamond_index();
        index.get_vertex(VertexId(4));
    }
}
