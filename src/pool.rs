//! Worker pool: OS threads pinned one-per-core across NUMA nodes.
//!
//! Control flow inside a worker is synchronous; asynchrony comes from the
//! per-thread I/O contexts a task drives. Tasks are addressed to a node
//! and round-robin among that node's workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{BrasaError, Result};
use crate::numa::set_current_node;

pub trait PoolTask: Send {
    fn run(&mut self) -> Result<()>;
}

struct WorkerSlot {
    queue: Mutex<VecDeque<Box<dyn PoolTask>>>,
    wake: Condvar,
}

struct PoolShared {
    slots: Vec<WorkerSlot>,
    outstanding: AtomicUsize,
    done_lock: Mutex<()>,
    done: Condvar,
    shutdown: AtomicBool,
    first_error: Mutex<Option<BrasaError>>,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
    num_nodes: usize,
    next_on_node: Vec<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(num_threads: usize, num_nodes: usize) -> Self {
        assert!(num_threads > 0 && num_nodes > 0 && num_nodes <= num_threads);
        let shared = Arc::new(PoolShared {
            slots: (0..num_threads)
                .map(|_| WorkerSlot {
                    queue: Mutex::new(VecDeque::new()),
                    wake: Condvar::new(),
                })
                .collect(),
            outstanding: AtomicUsize::new(0),
            done_lock: Mutex::new(()),
            done: Condvar::new(),
            shutdown: AtomicBool::new(false),
            first_error: Mutex::new(None),
        });
        let mut handles = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared = Arc::clone(&shared);
            let node = idx % num_nodes;
            let handle = std::thread::Builder::new()
                .name(format!("brasa-worker-{idx}"))
                .spawn(move || {
                    set_current_node(node);
                    pin_to_cpu(idx);
                    worker_loop(&shared, idx);
                })
                .expect("spawn worker thread");
            handles.push(handle);
        }
        debug!(num_threads, num_nodes, "pool.start");
        Self {
            shared,
            handles: Mutex::new(handles),
            num_threads,
            num_nodes,
            next_on_node: (0..num_nodes).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Queues a task on one of `node`'s workers.
    pub fn process_task(&self, node: usize, task: Box<dyn PoolTask>) {
        let node = node % self.num_nodes;
        // Workers are assigned to nodes round-robin, so the workers of
        // `node` are node, node + num_nodes, node + 2*num_nodes, ...
        let per_node = self.num_threads.div_ceil(self.num_nodes);
        let turn = self.next_on_node[node].fetch_add(1, Ordering::Relaxed) % per_node;
        let mut worker = node + turn * self.num_nodes;
        if worker >= self.num_threads {
            worker = node;
        }
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let slot = &self.shared.slots[worker];
        slot.queue.lock().push_back(task);
        slot.wake.notify_one();
    }

    /// Blocks until every queued task has finished; surfaces the first
    /// task error.
    pub fn wait4complete(&self) -> Result<()> {
        let mut guard = self.shared.done_lock.lock();
        while self.shared.outstanding.load(Ordering::Acquire) != 0 {
            self.shared.done.wait(&mut guard);
        }
        drop(guard);
        match self.shared.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for slot in &self.shared.slots {
            slot.wake.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared, idx: usize) {
    let slot = &shared.slots[idx];
    loop {
        let task = {
            let mut queue = slot.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                slot.wake.wait(&mut queue);
            }
        };
        let Some(mut task) = task else {
            return;
        };
        if let Err(err) = task.run() {
            warn!(worker = idx, %err, "pool.task.error");
            let mut first = shared.first_error.lock();
            if first.is_none() {
                *first = Some(err);
            }
        }
        // Task state must be released before completion is observable.
        drop(task);
        let _guard = shared.done_lock.lock();
        if shared.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.done.notify_all();
        }
    }
}

/// Pins the calling thread to one core. Failures are logged, not fatal.
pub(crate) fn pin_to_cpu(cpu: usize) {
    #[cfg(target_os = "linux")]
    affinity::pin(cpu);
    #[cfg(not(target_os = "linux"))]
    let _ = cpu;
}

#[cfg(target_os = "linux")]
mod affinity {
    #![allow(unsafe_code)]

    use tracing::warn;

    pub fn pin(cpu: usize) {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let cpu = cpu % cores;
        // SAFETY: cpu_set_t is a plain bitset initialized by CPU_ZERO.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                warn!(cpu, "pool.pin.failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountTask {
        counter: Arc<AtomicU32>,
    }

    impl PoolTask for CountTask {
        fn run(&mut self) -> Result<()> {
            self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct FailTask;

    impl PoolTask for FailTask {
        fn run(&mut self) -> Result<()> {
            Err(BrasaError::Corruption("boom"))
        }
    }

    #[test]
    fn runs_all_tasks() {
        let pool = WorkerPool::new(4, 2);
        let counter = Arc::new(AtomicU32::new(0));
        for i in 0..32 {
            pool.process_task(
                i % 2,
                Box::new(CountTask {
                    counter: Arc::clone(&counter),
                }),
            );
        }
        pool.wait4complete().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn surfaces_first_error_and_recovers() {
        let pool = WorkerPool::new(2, 1);
        pool.process_task(0, Box::new(FailTask));
        assert!(pool.wait4complete().is_err());

        let counter = Arc::new(AtomicU32::new(0));
        pool.process_task(
            0,
            Box::new(CountTask {
                counter: Arc::clone(&counter),
            }),
        );
        pool.wait4complete().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
