//! Bounded work queue and worker pool
//!
//! A fixed number of worker threads drain save-tasks from a
//! capacity-bounded queue. `add_work` is the backpressure point: the
//! producer blocks (on the shared condvar) while the queue is full or a
//! fault is raised. A worker that hits a full disk raises the disk-full
//! signal and retries the same task once it clears; the task is never
//! lost. Any other task failure sets the pool's error flag and the pool
//! keeps going.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::backup::coord::{Coord, FaultKind};

/// Queue capacity; the producer blocks once this many tasks are pending
pub const QUEUE_CAPACITY: usize = 1000;

/// Log the remaining count every this many drained tasks
const REMAINING_LOG_INTERVAL: usize = 10;

/// How one task run ended
#[derive(Debug)]
pub enum TaskError {
    /// Out of disk space; raise the signal and retry the same task
    DiskFull,
    /// This task failed; record it and move on
    Failed(String),
}

/// One queued save-task, re-runnable for the disk-full retry path
pub type Work = Box<dyn FnMut() -> Result<(), TaskError> + Send>;

/// The post-saving worker pool
pub struct ThreadPool {
    coord: Arc<Coord>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Starts `thread_count` workers on the given coordination context
    pub fn new(coord: Arc<Coord>, thread_count: usize) -> Self {
        let threads = (0..thread_count)
            .map(|n| {
                let coord = coord.clone();
                std::thread::Builder::new()
                    .name(format!("saver-{}", n))
                    .spawn(move || worker(&coord))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { coord, threads }
    }

    /// Enqueues one task, blocking while the queue is at capacity or a
    /// fault is raised
    pub fn add_work(&self, work: Work) {
        let mut shared = self.coord.lock();
        while !shared.abort && (shared.queue.len() >= QUEUE_CAPACITY || shared.faulted()) {
            shared = self.coord.wait(shared);
        }
        if shared.abort {
            return; // cancel under way; the queue is being discarded
        }
        shared.queue.push_back(work);
        shared.unfinished += 1;
        self.coord.notify_all();
    }

    /// Graceful shutdown: no more work will be added; block until the
    /// queue drains, then join the workers
    pub fn wait(mut self) -> bool {
        {
            let mut shared = self.coord.lock();
            if shared.unfinished > 0 {
                tracing::info!("{} remaining posts to save", shared.unfinished);
            }
            shared.quit = true;
            self.coord.notify_all();
            while shared.unfinished > 0 && !shared.abort {
                shared = self.coord.wait(shared);
            }
        }
        self.join_workers();
        self.coord.lock().errors
    }

    /// Non-graceful shutdown: wake everyone, join the workers, discard
    /// whatever was still queued
    pub fn cancel(mut self) {
        {
            let mut shared = self.coord.lock();
            shared.abort = true;
            // Release fault waiters too, or blocked threads never exit
            shared.destroyed = true;
            self.coord.notify_all();
        }
        self.join_workers();

        let mut shared = self.coord.lock();
        shared.queue.clear();
        shared.unfinished = 0;
        self.coord.notify_all();
        drop(shared);

        tracing::info!("Backup canceled.");
    }

    /// Whether any task failed so far
    pub fn errors(&self) -> bool {
        self.coord.lock().errors
    }

    fn join_workers(&mut self) {
        let total = self.threads.len();
        for (n, thread) in self.threads.drain(..).enumerate() {
            tracing::debug!("stopping worker threads ({}/{})", n + 1, total);
            let _ = thread.join();
        }
    }
}

fn worker(coord: &Coord) {
    loop {
        let mut work = {
            let mut shared = coord.lock();
            loop {
                if shared.abort {
                    return;
                }
                if let Some(work) = shared.queue.pop_front() {
                    let remaining = shared.queue.len();
                    if shared.quit && remaining % REMAINING_LOG_INTERVAL == 0 {
                        tracing::info!("{} remaining posts to save", remaining);
                    }
                    break work;
                }
                if shared.quit {
                    return;
                }
                shared = coord.wait(shared);
            }
        };

        let mut success = true;
        loop {
            match work() {
                Ok(()) => break,
                Err(TaskError::DiskFull) => {
                    // Blocks until the signal clears, then retry in place
                    coord.raise(FaultKind::DiskFull);
                    if coord.lock().abort {
                        success = false;
                        break;
                    }
                }
                Err(TaskError::Failed(msg)) => {
                    tracing::error!("{}", msg);
                    success = false;
                    break;
                }
            }
        }

        let mut shared = coord.lock();
        if !success {
            shared.errors = true;
        }
        shared.unfinished = shared.unfinished.saturating_sub(1);
        coord.notify_all();
    }
}
