//! Worker Pool (C4): N worker threads, each with its own blocking queue.
//! `crossbeam::channel` supplies the
//! blocking-queue semantics the source gets from per-thread
//! `BlockingConcurrentQueue`s.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    sender: Sender<Option<Task>>,
    handle: Option<JoinHandle<()>>,
}

/// Pins connection-affine work to one worker (the thread-affinity
/// rule) while still offering round-robin enqueue for work with no
/// affine owner.
pub struct WorkerPool {
    workers: Vec<Worker>,
    round_robin_cursor: AtomicUsize,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "worker pool needs at least one thread");
        let workers = (0..num_threads)
            .map(|index| {
                let (tx, rx): (Sender<Option<Task>>, Receiver<Option<Task>>) = unbounded();
                let handle = std::thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || Self::run(index, rx))
                    .expect("failed to spawn worker thread");
                Worker {
                    sender: tx,
                    handle: Some(handle),
                }
            })
            .collect();
        Self {
            workers,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    fn run(index: usize, rx: Receiver<Option<Task>>) {
        if let Some(core_ids) = core_affinity::get_core_ids() {
            if let Some(core) = core_ids.get(index % core_ids.len()) {
                core_affinity::set_for_current(*core);
            }
        }
        while let Ok(Some(task)) = rx.recv() {
            task();
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Every connection chooses its thread index once, at accept time, by
    /// `connFd mod N`; all of its I/O and session callbacks pin here.
    pub fn thread_for_fd(&self, fd: i32) -> usize {
        (fd as usize) % self.workers.len()
    }

    /// Pins `task` to `index`; tasks on the same index run in submission
    /// order without concurrency.
    pub fn enqueue_to(&self, index: usize, task: impl FnOnce() + Send + 'static) {
        let _ = self.workers[index % self.workers.len()].sender.send(Some(Box::new(task)));
    }

    /// Round-robins work with no connection affinity.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let index = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.enqueue_to(index, task);
    }

    /// Sends a sentinel to every queue and joins all threads.
    pub fn shutdown(mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(None);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pinned_tasks_run_in_submission_order() {
        let pool = WorkerPool::new(4);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            pool.enqueue_to(2, move || {
                order.lock().unwrap().push(i);
            });
        }
        std::thread::sleep(Duration::from_millis(100));
        pool.shutdown();
        let result = order.lock().unwrap().clone();
        assert_eq!(result, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn round_robin_spreads_work() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicI64::new(0));
        for _ in 0..40 {
            let counter = counter.clone();
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(100));
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }
}
