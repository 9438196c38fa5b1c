//! Portion-based task dispatch.
//!
//! A dispatcher hands out successive portion ranges under a short lock and
//! creates the work for each range outside of it. Workers call
//! `issue_task` in a loop until the dispatcher is exhausted, then drain
//! their outstanding asynchronous completions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::pool::PoolTask;
use crate::runtime::Runtime;
use crate::vector::EmVec;

/// One unit of dispatchable work. `issue_task` claims the next range and
/// submits its I/O; it returns `false` once the input is exhausted.
pub trait Dispatch: Send + Sync {
    fn issue_task(&self) -> Result<bool>;
}

/// Shared cursor over `[0, total)` in `portion`-sized steps.
pub struct PortionCursor {
    next: Mutex<u64>,
    total: u64,
    portion: usize,
}

impl PortionCursor {
    pub fn new(total: u64, portion: usize) -> Self {
        assert!(portion > 0);
        Self {
            next: Mutex::new(0),
            total,
            portion,
        }
    }

    /// Claims the next `(global_start, length)` range, if any.
    pub fn claim(&self) -> Option<(u64, usize)> {
        let mut next = self.next.lock();
        if *next >= self.total {
            return None;
        }
        let start = *next;
        let len = (self.total - start).min(self.portion as u64) as usize;
        *next += len as u64;
        Some((start, len))
    }
}

/// Pool task that drives a dispatcher: issue until exhausted, draining the
/// registered vectors' per-thread contexts between rounds, then drain to
/// quiescence. Completions may submit follow-up writes into other
/// registered vectors, so the final drain loops until nothing is pending.
pub struct IoWorkerTask {
    dispatcher: Arc<dyn Dispatch>,
    vecs: Vec<EmVec>,
}

impl IoWorkerTask {
    pub fn new(dispatcher: Arc<dyn Dispatch>, vecs: Vec<EmVec>) -> Self {
        Self { dispatcher, vecs }
    }
}

impl PoolTask for IoWorkerTask {
    fn run(&mut self) -> Result<()> {
        while self.dispatcher.issue_task()? {
            for vec in &self.vecs {
                vec.with_io(|io| io.drain())?;
            }
        }
        loop {
            let mut pending = 0;
            for vec in &self.vecs {
                vec.with_io(|io| {
                    io.drain()?;
                    pending += io.pending();
                    Ok::<_, crate::error::BrasaError>(())
                })?;
            }
            if pending == 0 {
                return Ok(());
            }
        }
    }
}

/// Runs `dispatcher` on every pool worker and waits for completion, then
/// drops the per-thread I/O handles of the touched vectors.
pub(crate) fn run_dispatch(
    runtime: &Arc<Runtime>,
    dispatcher: Arc<dyn Dispatch>,
    vecs: &[EmVec],
) -> Result<()> {
    let pool = runtime.pool();
    for worker in 0..pool.num_threads() {
        pool.process_task(
            worker % pool.num_nodes(),
            Box::new(IoWorkerTask::new(Arc::clone(&dispatcher), vecs.to_vec())),
        );
    }
    let result = pool.wait4complete();
    release_ios(vecs, &result);
    result
}

/// Single-worker variant used by the merge pass, whose dispatcher is an
/// asynchronous producer/consumer rather than a parallel walk.
pub(crate) fn run_dispatch_single(
    runtime: &Arc<Runtime>,
    dispatcher: Arc<dyn Dispatch>,
    vecs: &[EmVec],
) -> Result<()> {
    let pool = runtime.pool();
    pool.process_task(0, Box::new(IoWorkerTask::new(dispatcher, vecs.to_vec())));
    let result = pool.wait4complete();
    release_ios(vecs, &result);
    result
}

fn release_ios(vecs: &[EmVec], result: &Result<()>) {
    for vec in vecs {
        if result.is_ok() {
            vec.destroy_ios();
        } else {
            // A failed operation may leave requests in flight; drop them.
            vec.abandon_ios();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_covers_range_with_short_tail() {
        let cursor = PortionCursor::new(100, 32);
        let mut ranges = Vec::new();
        while let Some(r) = cursor.claim() {
            ranges.push(r);
        }
        assert_eq!(ranges, vec![(0, 32), (32, 32), (64, 32), (96, 4)]);
        assert!(cursor.claim().is_none());
    }

    #[test]
    fn cursor_empty_input() {
        let cursor = PortionCursor::new(0, 8);
        assert!(cursor.claim().is_none());
    }
}
