//! The shared substrate of both subsystems: validated config, the worker
//! pool, and global I/O counters.

use std::io::Write;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::elem::ElemType;
use crate::error::Result;
use crate::io::{IoStats, IoStatsSnapshot};
use crate::pool::WorkerPool;
use crate::vector::EmVec;

pub struct Runtime {
    config: EngineConfig,
    pool: WorkerPool,
    io_stats: Arc<IoStats>,
}

impl Runtime {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = WorkerPool::new(config.num_threads, config.num_nodes);
        Ok(Arc::new(Self {
            config,
            pool,
            io_stats: Arc::new(IoStats::default()),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn io_stats(&self) -> IoStatsSnapshot {
        self.io_stats.snapshot()
    }

    pub(crate) fn io_stats_handle(&self) -> Arc<IoStats> {
        Arc::clone(&self.io_stats)
    }

    /// Creates an external-memory vector backed by a fresh temp file.
    pub fn create_vec(self: &Arc<Self>, len: u64, elem: ElemType) -> Result<EmVec> {
        EmVec::create(Arc::clone(self), len, elem)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let snap = self.io_stats.snapshot();
        if self.config.print_io_stat {
            info!(
                reads = snap.reads,
                writes = snap.writes,
                bytes_read = snap.bytes_read,
                bytes_written = snap.bytes_written,
                "runtime.io.stats"
            );
        }
        if let Some(path) = &self.config.prof_file {
            if let Err(err) = write_profile(path, &snap) {
                warn!(%err, path = %path.display(), "runtime.prof.write_failed");
            }
        }
    }
}

fn write_profile(path: &std::path::Path, snap: &IoStatsSnapshot) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "reads: {}", snap.reads)?;
    writeln!(file, "writes: {}", snap.writes)?;
    writeln!(file, "bytes_read: {}", snap.bytes_read)?;
    writeln!(file, "bytes_written: {}", snap.bytes_written)?;
    Ok(())
}
