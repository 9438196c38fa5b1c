use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BrasaError, Result};

/// Engine-wide tuning options.
///
/// The sort and graph subsystems both read from a single config chosen at
/// startup. `sort_buf_bytes` is the pass-1 chunk size, `anchor_gap_bytes`
/// the anchor sampling interval (and the portion size of external vectors),
/// and `write_io_buf_bytes` the staging size of the merge writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the worker pool.
    pub num_threads: usize,
    /// NUMA nodes across which workers are pinned.
    pub num_nodes: usize,
    /// Size of a pass-1 sort chunk, in bytes.
    pub sort_buf_bytes: usize,
    /// Anchor sampling interval; must divide `sort_buf_bytes`.
    pub anchor_gap_bytes: usize,
    /// Merge-writer staging size; must be a whole number of device blocks.
    pub write_io_buf_bytes: usize,
    /// Device block size all staged writes are aligned to.
    pub block_size: usize,
    /// Directory holding `vec*` temp backing files; defaults to the
    /// system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Optional path the runtime dumps an I/O summary to on shutdown.
    pub prof_file: Option<PathBuf>,
    /// Whether to log I/O counters when the runtime shuts down.
    pub print_io_stat: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            num_nodes: 1,
            sort_buf_bytes: 128 << 20,
            anchor_gap_bytes: 1 << 20,
            write_io_buf_bytes: 4 << 20,
            block_size: 4096,
            temp_dir: None,
            prof_file: None,
            print_io_stat: false,
        }
    }
}

impl EngineConfig {
    /// Settings sized for multi-node machines with large RAID arrays.
    pub fn large_scale() -> Self {
        Self {
            num_threads: 32,
            num_nodes: 4,
            sort_buf_bytes: 512 << 20,
            anchor_gap_bytes: 4 << 20,
            write_io_buf_bytes: 16 << 20,
            ..Self::default()
        }
    }

    /// Small buffers that force multi-chunk sorts and merge rounds on tiny
    /// inputs. Intended for tests and local experiments.
    pub fn compact() -> Self {
        Self {
            num_threads: 2,
            num_nodes: 1,
            sort_buf_bytes: 512,
            anchor_gap_bytes: 64,
            write_io_buf_bytes: 256,
            block_size: 64,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 || self.num_nodes == 0 {
            return Err(BrasaError::Config(
                "num_threads and num_nodes must be non-zero".into(),
            ));
        }
        if self.num_nodes > self.num_threads {
            return Err(BrasaError::Config(format!(
                "num_nodes ({}) exceeds num_threads ({})",
                self.num_nodes, self.num_threads
            )));
        }
        if self.block_size == 0 {
            return Err(BrasaError::Config("block_size must be non-zero".into()));
        }
        if self.anchor_gap_bytes == 0 || self.sort_buf_bytes % self.anchor_gap_bytes != 0 {
            return Err(BrasaError::Config(format!(
                "anchor_gap_bytes ({}) must divide sort_buf_bytes ({})",
                self.anchor_gap_bytes, self.sort_buf_bytes
            )));
        }
        if self.write_io_buf_bytes == 0 || self.write_io_buf_bytes % self.block_size != 0 {
            return Err(BrasaError::Config(format!(
                "write_io_buf_bytes ({}) must be a multiple of block_size ({})",
                self.write_io_buf_bytes, self.block_size
            )));
        }
        Ok(())
    }

    /// Portion size in elements for a given entry size, or an error when the
    /// entry size does not evenly divide the configured byte intervals.
    pub fn portion_elems(&self, entry_size: usize) -> Result<usize> {
        if self.anchor_gap_bytes % entry_size != 0 || self.sort_buf_bytes % entry_size != 0 {
            return Err(BrasaError::Config(format!(
                "entry size {entry_size} does not divide anchor_gap_bytes/sort_buf_bytes"
            )));
        }
        Ok(self.anchor_gap_bytes / entry_size)
    }
}
