//! NUMA-partitioned dense matrices and their persisted export.
//!
//! Tall matrices only: rows (row-major) or rows-within-columns
//! (col-major) are range-partitioned across nodes through a
//! [`NodeMapper`]. The export writes a fixed header followed by
//! row-contiguous bytes for row-major stores and per-column contiguous
//! bytes for col-major stores.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::elem::ElemType;
use crate::error::{BrasaError, Result};
use crate::numa::{NodeMapper, NumaBuf};

pub const MATRIX_MAGIC: [u8; 4] = *b"BRMX";
pub const MATRIX_VERSION: u16 = 1;
pub const MATRIX_HEADER_LEN: usize = 28;

/// Rows the mapper assigns to a node at a time.
const ROW_RANGE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixLayout {
    RowMajor,
    ColMajor,
}

impl MatrixLayout {
    fn as_u8(self) -> u8 {
        match self {
            MatrixLayout::RowMajor => 0,
            MatrixLayout::ColMajor => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MatrixLayout::RowMajor),
            1 => Ok(MatrixLayout::ColMajor),
            _ => Err(BrasaError::Corruption("unknown matrix layout")),
        }
    }
}

/// Fills one matrix cell from its `(row, col)` coordinates.
pub trait MatrixFillOp: Sync {
    fn fill(&self, row: usize, col: usize, out: &mut [u8]);
}

impl<F> MatrixFillOp for F
where
    F: Fn(usize, usize, &mut [u8]) + Sync,
{
    fn fill(&self, row: usize, col: usize, out: &mut [u8]) {
        self(row, col, out)
    }
}

/// A tall dense matrix partitioned across NUMA nodes by row ranges.
pub struct NumaDenseMatrix {
    nrow: usize,
    ncol: usize,
    elem: ElemType,
    layout: MatrixLayout,
    mapper: NodeMapper,
    local_rows: Vec<usize>,
    parts: Vec<NumaBuf<u8>>,
}

impl NumaDenseMatrix {
    pub fn create(
        nrow: usize,
        ncol: usize,
        num_nodes: usize,
        layout: MatrixLayout,
        elem: ElemType,
    ) -> Result<Self> {
        if ncol > nrow {
            return Err(BrasaError::Config(format!(
                "wide matrix ({nrow}x{ncol}) is not supported by the NUMA store"
            )));
        }
        if num_nodes == 0 {
            return Err(BrasaError::Config("num_nodes must be non-zero".into()));
        }
        let mapper = NodeMapper::new(num_nodes, ROW_RANGE);
        let size = elem.size();
        let local_rows: Vec<usize> = (0..num_nodes)
            .map(|node| mapper.local_len(node, nrow))
            .collect();
        let parts = local_rows
            .iter()
            .enumerate()
            .map(|(node, &rows)| NumaBuf::alloc(rows * ncol * size, node))
            .collect();
        Ok(Self {
            nrow,
            ncol,
            elem,
            layout,
            mapper,
            local_rows,
            parts,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.nrow
    }

    pub fn num_cols(&self) -> usize {
        self.ncol
    }

    pub fn layout(&self) -> MatrixLayout {
        self.layout
    }

    pub fn elem(&self) -> &ElemType {
        &self.elem
    }

    fn cell_range(&self, row: usize, col: usize) -> (usize, usize) {
        assert!(row < self.nrow && col < self.ncol, "cell out of bounds");
        let size = self.elem.size();
        let (node, local_row) = self.mapper.map_to_physical(row);
        let idx = match self.layout {
            MatrixLayout::RowMajor => local_row * self.ncol + col,
            MatrixLayout::ColMajor => col * self.local_rows[node] + local_row,
        };
        (node, idx * size)
    }

    pub fn get(&self, row: usize, col: usize) -> &[u8] {
        let size = self.elem.size();
        let (node, off) = self.cell_range(row, col);
        &self.parts[node].as_slice()[off..off + size]
    }

    pub fn set(&mut self, row: usize, col: usize, value: &[u8]) {
        let size = self.elem.size();
        let (node, off) = self.cell_range(row, col);
        self.parts[node].as_mut_slice()[off..off + size].copy_from_slice(value);
    }

    /// Zeroes the whole store.
    pub fn reset_data(&mut self) {
        for part in &mut self.parts {
            part.as_mut_slice().fill(0);
        }
    }

    /// Applies `op` to every cell.
    pub fn set_data(&mut self, op: &dyn MatrixFillOp) {
        let size = self.elem.size();
        for row in 0..self.nrow {
            for col in 0..self.ncol {
                let (node, off) = self.cell_range(row, col);
                op.fill(
                    row,
                    col,
                    &mut self.parts[node].as_mut_slice()[off..off + size],
                );
            }
        }
    }

    /// Exports the matrix: fixed header, then row-contiguous bytes
    /// (row-major) or per-column contiguous bytes gathered from the
    /// node partitions (col-major).
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        let mut header = [0u8; MATRIX_HEADER_LEN];
        header[0..4].copy_from_slice(&MATRIX_MAGIC);
        header[4..6].copy_from_slice(&MATRIX_VERSION.to_be_bytes());
        header[6] = self.layout.as_u8();
        header[7] = 0;
        header[8..12].copy_from_slice(&(self.elem.size() as u32).to_be_bytes());
        header[12..20].copy_from_slice(&(self.nrow as u64).to_be_bytes());
        header[20..28].copy_from_slice(&(self.ncol as u64).to_be_bytes());
        out.write_all(&header)?;
        match self.layout {
            MatrixLayout::RowMajor => {
                let size = self.elem.size();
                for row in 0..self.nrow {
                    let (node, off) = self.cell_range(row, 0);
                    out.write_all(
                        &self.parts[node].as_slice()[off..off + self.ncol * size],
                    )?;
                }
            }
            MatrixLayout::ColMajor => {
                for col in 0..self.ncol {
                    for row in 0..self.nrow {
                        out.write_all(self.get(row, col))?;
                    }
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// A matrix file read back into contiguous memory, for consumers of the
/// export.
pub struct PersistedMatrix {
    pub nrow: usize,
    pub ncol: usize,
    pub entry_size: usize,
    pub layout: MatrixLayout,
    pub data: Vec<u8>,
}

impl PersistedMatrix {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header = [0u8; MATRIX_HEADER_LEN];
        file.read_exact(&mut header)?;
        if header[0..4] != MATRIX_MAGIC {
            return Err(BrasaError::Corruption("invalid matrix magic"));
        }
        let version = u16::from_be_bytes(header[4..6].try_into().unwrap());
        if version != MATRIX_VERSION {
            return Err(BrasaError::Corruption("unsupported matrix version"));
        }
        let layout = MatrixLayout::from_u8(header[6])?;
        let entry_size = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let nrow = u64::from_be_bytes(header[12..20].try_into().unwrap()) as usize;
        let ncol = u64::from_be_bytes(header[20..28].try_into().unwrap()) as usize;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.len() != nrow * ncol * entry_size {
            return Err(BrasaError::Corruption("matrix payload length mismatch"));
        }
        Ok(Self {
            nrow,
            ncol,
            entry_size,
            layout,
            data,
        })
    }

    pub fn cell(&self, row: usize, col: usize) -> &[u8] {
        let idx = match self.layout {
            MatrixLayout::RowMajor => row * self.ncol + col,
            MatrixLayout::ColMajor => col * self.nrow + row,
        };
        &self.data[idx * self.entry_size..(idx + 1) * self.entry_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elem;

    fn fill_value(row: usize, col: usize) -> i32 {
        (row * 1000 + col) as i32
    }

    fn check_roundtrip(layout: MatrixLayout) {
        let mut matrix = NumaDenseMatrix::create(100, 3, 2, layout, elem::int32()).unwrap();
        matrix.set_data(&|row: usize, col: usize, out: &mut [u8]| {
            out.copy_from_slice(&fill_value(row, col).to_le_bytes())
        });
        for row in [0, 1, 63, 64, 99] {
            for col in 0..3 {
                assert_eq!(matrix.get(row, col), fill_value(row, col).to_le_bytes());
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        matrix.persist(&path).unwrap();
        let loaded = PersistedMatrix::load(&path).unwrap();
        assert_eq!(loaded.nrow, 100);
        assert_eq!(loaded.ncol, 3);
        assert_eq!(loaded.layout, layout);
        for row in 0..100 {
            for col in 0..3 {
                assert_eq!(loaded.cell(row, col), fill_value(row, col).to_le_bytes());
            }
        }
    }

    #[test]
    fn row_major_roundtrip() {
        check_roundtrip(MatrixLayout::RowMajor);
    }

    #[test]
    fn col_major_roundtrip() {
        check_roundtrip(MatrixLayout::ColMajor);
    }

    #[test]
    fn reset_zeroes_cells() {
        let mut matrix =
            NumaDenseMatrix::create(10, 2, 1, MatrixLayout::RowMajor, elem::int32()).unwrap();
        matrix.set_data(&|_, _, out: &mut [u8]| out.copy_from_slice(&1i32.to_le_bytes()));
        matrix.reset_data();
        assert_eq!(matrix.get(5, 1), 0i32.to_le_bytes());
    }

    #[test]
    fn rejects_wide_matrices() {
        assert!(matches!(
            NumaDenseMatrix::create(2, 10, 1, MatrixLayout::RowMajor, elem::int32()),
            Err(BrasaError::Config(_))
        ));
    }
}
