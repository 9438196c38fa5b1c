//! On-disk formats consumed by the graph engine.
//!
//! The vertex index file is a fixed header followed by one
//! `(offset: i64, size: i32)` entry per vertex id in dense order. The
//! graph data file holds one variable-length record per vertex,
//! random-accessed by the `(offset, size)` the index names. All header
//! fields are big-endian.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{BrasaError, Result};
use crate::graph::VertexId;

pub const INDEX_MAGIC: [u8; 4] = *b"BRIX";
pub const INDEX_VERSION: u16 = 1;
pub const INDEX_HEADER_LEN: usize = 16;
pub const INDEX_ENTRY_LEN: usize = 12;

/// Bytes before the edge lists of a directed vertex record:
/// id (8) + in count (4) + out count (4).
pub const DIRECTED_HEADER_LEN: usize = 16;
/// Bytes before the edge list of an undirected record: id (8) + count (4).
pub const UNDIRECTED_HEADER_LEN: usize = 12;

/// A vertex with a record no larger than the bare header has no edges.
pub fn min_vertex_size(directed: bool) -> u32 {
    if directed {
        DIRECTED_HEADER_LEN as u32
    } else {
        UNDIRECTED_HEADER_LEN as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub directed: bool,
    pub num_vertices: u64,
}

impl IndexHeader {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&INDEX_MAGIC);
        out[4..6].copy_from_slice(&INDEX_VERSION.to_be_bytes());
        out[6] = self.directed as u8;
        out[7] = 0;
        out[8..16].copy_from_slice(&self.num_vertices.to_be_bytes());
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < INDEX_HEADER_LEN {
            return Err(BrasaError::Corruption("vertex index header truncated"));
        }
        if src[0..4] != INDEX_MAGIC {
            return Err(BrasaError::Corruption("invalid vertex index magic"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().unwrap());
        if version != INDEX_VERSION {
            return Err(BrasaError::Corruption("unsupported vertex index version"));
        }
        let directed = match src[6] {
            0 => false,
            1 => true,
            _ => return Err(BrasaError::Corruption("invalid directedness flag")),
        };
        if src[7] != 0 {
            return Err(BrasaError::Corruption("index header reserved byte not zero"));
        }
        let num_vertices = u64::from_be_bytes(src[8..16].try_into().unwrap());
        Ok(Self {
            directed,
            num_vertices,
        })
    }
}

/// One index entry: where a vertex's record lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: i64,
    pub size: i32,
}

impl IndexEntry {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.offset.to_be_bytes());
        out[8..12].copy_from_slice(&self.size.to_be_bytes());
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < INDEX_ENTRY_LEN {
            return Err(BrasaError::Corruption("vertex index entry truncated"));
        }
        Ok(Self {
            offset: i64::from_be_bytes(src[0..8].try_into().unwrap()),
            size: i32::from_be_bytes(src[8..12].try_into().unwrap()),
        })
    }
}

fn encode_directed_record(id: VertexId, ins: &[VertexId], outs: &[VertexId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DIRECTED_HEADER_LEN + 8 * (ins.len() + outs.len()));
    buf.extend_from_slice(&id.0.to_be_bytes());
    buf.extend_from_slice(&(ins.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(outs.len() as u32).to_be_bytes());
    for v in ins.iter().chain(outs) {
        buf.extend_from_slice(&v.0.to_be_bytes());
    }
    buf
}

fn encode_undirected_record(id: VertexId, neighbors: &[VertexId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(UNDIRECTED_HEADER_LEN + 8 * neighbors.len());
    buf.extend_from_slice(&id.0.to_be_bytes());
    buf.extend_from_slice(&(neighbors.len() as u32).to_be_bytes());
    for v in neighbors {
        buf.extend_from_slice(&v.0.to_be_bytes());
    }
    buf
}

fn write_files(
    graph_path: &Path,
    index_path: &Path,
    directed: bool,
    records: Vec<Vec<u8>>,
) -> Result<()> {
    let mut graph = BufWriter::new(File::create(graph_path)?);
    let mut index = BufWriter::new(File::create(index_path)?);
    let mut header_buf = [0u8; INDEX_HEADER_LEN];
    IndexHeader {
        directed,
        num_vertices: records.len() as u64,
    }
    .encode(&mut header_buf);
    index.write_all(&header_buf)?;
    let mut offset = 0i64;
    for record in &records {
        graph.write_all(record)?;
        let mut entry_buf = [0u8; INDEX_ENTRY_LEN];
        IndexEntry {
            offset,
            size: record.len() as i32,
        }
        .encode(&mut entry_buf);
        index.write_all(&entry_buf)?;
        offset += record.len() as i64;
    }
    graph.flush()?;
    index.flush()?;
    Ok(())
}

/// Writes a directed graph's data and index files. `adjacency[id]` holds
/// the in- and out-neighbour lists of vertex `id`.
pub fn write_directed_graph(
    graph_path: impl AsRef<Path>,
    index_path: impl AsRef<Path>,
    adjacency: &[(Vec<VertexId>, Vec<VertexId>)],
) -> Result<()> {
    let records = adjacency
        .iter()
        .enumerate()
        .map(|(id, (ins, outs))| encode_directed_record(VertexId(id as u64), ins, outs))
        .collect();
    write_files(graph_path.as_ref(), index_path.as_ref(), true, records)
}

/// Writes an undirected graph's data and index files.
pub fn write_undirected_graph(
    graph_path: impl AsRef<Path>,
    index_path: impl AsRef<Path>,
    adjacency: &[Vec<VertexId>],
) -> Result<()> {
    let records = adjacency
        .iter()
        .enumerate()
        .map(|(id, neighbors)| encode_undirected_record(VertexId(id as u64), neighbors))
        .collect();
    write_files(graph_path.as_ref(), index_path.as_ref(), false, records)
}
