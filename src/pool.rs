//! Shared worker pool executing host kernel launches.
//!
//! Work-stealing deques with a global injector; one pool for the whole
//! process. A launch is split into fixed-size blocks of the iteration space;
//! the returned [`TaskHandle`] completes once every block ran. Launches
//! submitted from one thread state are chained FIFO: a launch's blocks only
//! enter the queues after the previous handle completed, which also gives
//! the allocator a well-defined point to reclaim deferred frees.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Completion state shared between a launch and its waiters.
pub struct JoinState {
    inner: Mutex<JoinInner>,
    condvar: Condvar,
}

struct JoinInner {
    completed: bool,
    callbacks: Vec<Box<dyn FnOnce() + Send + 'static>>,
}

impl JoinState {
    fn new() -> Arc<Self> {
        Arc::new(JoinState {
            inner: Mutex::new(JoinInner {
                completed: false,
                callbacks: Vec::new(),
            }),
            condvar: Condvar::new(),
        })
    }

    fn mark_complete(&self) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            inner.completed = true;
            self.condvar.notify_all();
            std::mem::take(&mut inner.callbacks)
        };
        for cb in callbacks {
            cb();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().completed
    }

    pub fn wait_blocking(&self) {
        let mut inner = self.inner.lock();
        while !inner.completed {
            self.condvar.wait(&mut inner);
        }
    }

    /// Run `cb` once complete; immediately when already complete.
    fn on_complete(&self, cb: Box<dyn FnOnce() + Send + 'static>) {
        {
            let mut inner = self.inner.lock();
            if !inner.completed {
                inner.callbacks.push(cb);
                return;
            }
        }
        cb();
    }
}

#[derive(Clone)]
pub struct TaskHandle {
    join: Arc<JoinState>,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_complete()
    }

    pub fn wait(&self) {
        self.join.wait_blocking();
    }
}

struct PoolCore {
    injector: Injector<WorkItem>,
    stealers: Vec<Stealer<WorkItem>>,
    shutdown: AtomicBool,
}

pub struct TaskPool {
    core: Arc<PoolCore>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    workers: usize,
}

impl TaskPool {
    pub fn new(max_workers: usize) -> Self {
        let workers = max_workers.max(1);
        let mut locals = Vec::with_capacity(workers);
        let mut stealers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let w = Worker::new_fifo();
            stealers.push(w.stealer());
            locals.push(w);
        }

        let core = Arc::new(PoolCore {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(workers);
        for (index, local) in locals.into_iter().enumerate() {
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name(format!("arrayjit-worker-{index}"))
                .spawn(move || worker_loop(core, local, index))
                .expect("failed to spawn pool worker");
            threads.push(handle);
        }

        TaskPool {
            core,
            threads: Mutex::new(threads),
            workers,
        }
    }

    pub fn default_workers() -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Submit the iteration space `[0, size)` in blocks of `block_size`
    /// elements. `after` sequences this launch behind an earlier one; its
    /// blocks are withheld from the queues until the predecessor drained.
    pub fn submit_range(
        &self,
        after: Option<TaskHandle>,
        size: u64,
        block_size: u64,
        func: Arc<dyn Fn(u64, u64) + Send + Sync + 'static>,
    ) -> TaskHandle {
        let block = block_size.max(1);
        let blocks = size.div_ceil(block).max(1);
        let join = JoinState::new();
        let remaining = Arc::new(AtomicUsize::new(blocks as usize));

        let core = Arc::clone(&self.core);
        let join_out = Arc::clone(&join);
        let enqueue = move || {
            for i in 0..blocks {
                let start = i * block;
                let end = (start + block).min(size);
                let func = Arc::clone(&func);
                let remaining = Arc::clone(&remaining);
                let join = Arc::clone(&join);
                core.injector.push(Box::new(move || {
                    func(start, end);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        join.mark_complete();
                    }
                }));
            }
        };

        match after {
            Some(prev) if !prev.is_finished() => prev.join.on_complete(Box::new(enqueue)),
            _ => enqueue(),
        }

        TaskHandle { join: join_out }
    }

    /// Run one closure on the pool.
    pub fn submit(&self, after: Option<TaskHandle>, func: impl FnOnce() + Send + 'static) -> TaskHandle {
        let join = JoinState::new();
        let join_task = Arc::clone(&join);
        let core = Arc::clone(&self.core);
        let enqueue = move || {
            core.injector.push(Box::new(move || {
                func();
                join_task.mark_complete();
            }));
        };
        let handle = TaskHandle { join };
        match after {
            Some(prev) if !prev.is_finished() => prev.join.on_complete(Box::new(enqueue)),
            _ => enqueue(),
        }
        handle
    }

    /// Stop the workers. Queued work is still drained before each worker
    /// observes the flag; callers sync their thread states first.
    pub fn destroy(&self) {
        if self
            .core
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            for handle in self.threads.lock().drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn worker_loop(core: Arc<PoolCore>, local: Worker<WorkItem>, index: usize) {
    let stealers: Vec<_> = core
        .stealers
        .iter()
        .enumerate()
        .filter_map(|(i, s)| if i != index { Some(s.clone()) } else { None })
        .collect();
    let backoff = Backoff::new();

    loop {
        if let Some(task) = local.pop() {
            backoff.reset();
            task();
            continue;
        }

        match core.injector.steal_batch_and_pop(&local) {
            Steal::Success(task) => {
                backoff.reset();
                task();
                continue;
            }
            Steal::Retry => {
                backoff.spin();
                continue;
            }
            Steal::Empty => {}
        }

        let mut stolen = None;
        for stealer in &stealers {
            match stealer.steal() {
                Steal::Success(task) => {
                    stolen = Some(task);
                    break;
                }
                Steal::Retry => break,
                Steal::Empty => continue,
            }
        }
        if let Some(task) = stolen {
            backoff.reset();
            task();
            continue;
        }

        if core.shutdown.load(Ordering::SeqCst) {
            break;
        }

        if backoff.is_completed() {
            thread::sleep(Duration::from_micros(100));
        } else {
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn range_submission_covers_every_element() {
        let pool = TaskPool::new(4);
        let sum = Arc::new(AtomicU64::new(0));
        let sum2 = Arc::clone(&sum);
        let handle = pool.submit_range(
            None,
            1000,
            64,
            Arc::new(move |start, end| {
                for i in start..end {
                    sum2.fetch_add(i, Ordering::Relaxed);
                }
            }),
        );
        handle.wait();
        assert_eq!(sum.load(Ordering::Relaxed), 999 * 1000 / 2);
        pool.destroy();
    }

    #[test]
    fn chained_launches_run_in_order() {
        let pool = TaskPool::new(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let log1 = Arc::clone(&log);
        let first = pool.submit_range(
            None,
            4,
            1,
            Arc::new(move |start, _| {
                thread::sleep(Duration::from_millis(2));
                log1.lock().push((1u32, start));
            }),
        );

        let log2 = Arc::clone(&log);
        let second = pool.submit_range(
            Some(first.clone()),
            2,
            1,
            Arc::new(move |start, _| {
                log2.lock().push((2u32, start));
            }),
        );

        second.wait();
        assert!(first.is_finished());
        let entries = log.lock();
        let first_pos = entries.iter().rposition(|(gen, _)| *gen == 1).unwrap();
        let second_pos = entries.iter().position(|(gen, _)| *gen == 2).unwrap();
        assert!(first_pos < second_pos);
        pool.destroy();
    }
}
