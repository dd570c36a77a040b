//! Bounded work queue and worker pool.
//!
//! Sub-reactors append ready connections (by fd); workers dequeue and run
//! the parse/build step. Two interchangeable queue variants exist, chosen
//! at startup: a single mutex-protected FIFO with a counting semaphore,
//! and an array of per-worker lock-free SPSC rings fed round-robin by a
//! single producing reactor.

pub mod spsc;

use crate::runtime::Shared;
use spsc::SpscRing;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Counting semaphore built from a mutex and a condvar.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.available.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

enum QueueInner {
    Shared {
        queue: Mutex<VecDeque<RawFd>>,
        items: Semaphore,
        max_requests: usize,
    },
    Spsc {
        rings: Vec<SpscRing<RawFd>>,
        items: Vec<Semaphore>,
        /// Producer-side round-robin cursor.
        next: AtomicUsize,
    },
}

/// Bounded FIFO of connections awaiting a worker.
pub struct WorkQueue {
    inner: QueueInner,
    running: AtomicBool,
}

impl WorkQueue {
    /// Single shared FIFO holding at most `max_requests` entries.
    pub fn shared(max_requests: usize) -> WorkQueue {
        WorkQueue {
            inner: QueueInner::Shared {
                queue: Mutex::new(VecDeque::new()),
                items: Semaphore::new(),
                max_requests,
            },
            running: AtomicBool::new(true),
        }
    }

    /// One SPSC ring per worker, each holding `max_requests - 1` entries.
    pub fn spsc(workers: usize, max_requests: usize) -> WorkQueue {
        let len = max_requests.max(2);
        let mut rings = Vec::with_capacity(workers);
        let mut items = Vec::with_capacity(workers);
        for _ in 0..workers {
            rings.push(SpscRing::new(len));
            items.push(Semaphore::new());
        }
        WorkQueue {
            inner: QueueInner::Spsc {
                rings,
                items,
                next: AtomicUsize::new(0),
            },
            running: AtomicBool::new(true),
        }
    }

    /// Enqueue a ready connection. Returns false when the queue is full
    /// (the caller answers 503) or the pool is shutting down.
    pub fn append(&self, fd: RawFd) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        match &self.inner {
            QueueInner::Shared {
                queue,
                items,
                max_requests,
            } => {
                let mut pending = queue.lock().unwrap();
                if pending.len() >= *max_requests {
                    return false;
                }
                pending.push_back(fd);
                drop(pending);
                items.post();
                true
            }
            QueueInner::Spsc { rings, items, next } => {
                let target = next.fetch_add(1, Ordering::Relaxed) % rings.len();
                if rings[target].push(fd) {
                    items[target].post();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Blocking dequeue for worker `id`; None means shutdown.
    fn take(&self, id: usize) -> Option<RawFd> {
        match &self.inner {
            QueueInner::Shared { queue, items, .. } => loop {
                items.wait();
                if !self.running.load(Ordering::Acquire) {
                    return None;
                }
                if let Some(fd) = queue.lock().unwrap().pop_front() {
                    return Some(fd);
                }
            },
            QueueInner::Spsc { rings, items, .. } => loop {
                items[id].wait();
                if !self.running.load(Ordering::Acquire) {
                    return None;
                }
                if let Some(fd) = rings[id].pop() {
                    return Some(fd);
                }
            },
        }
    }

    /// Stop accepting work and wake every worker out of its wait.
    pub fn shutdown(&self, workers: usize) {
        self.running.store(false, Ordering::Release);
        match &self.inner {
            QueueInner::Shared { queue, items, .. } => {
                let abandoned = queue.lock().unwrap().len();
                if abandoned > 0 {
                    debug!(abandoned, "Dropping queued work at shutdown");
                }
                for _ in 0..workers {
                    items.post();
                }
            }
            QueueInner::Spsc { rings, items, .. } => {
                let abandoned: usize = rings.iter().map(SpscRing::len).sum();
                if abandoned > 0 {
                    debug!(abandoned, "Dropping queued work at shutdown");
                }
                for sem in items {
                    sem.post();
                }
            }
        }
    }
}

/// Worker threads draining the queue.
pub struct ThreadPool {
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(
        queue: Arc<WorkQueue>,
        shared: Arc<Shared>,
        count: usize,
    ) -> io::Result<ThreadPool> {
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(id, &queue, &shared))?;
            workers.push(handle);
        }
        Ok(ThreadPool { queue, workers })
    }

    /// Stop and join every worker. Queued-but-unprocessed connections are
    /// abandoned; process exit closes their sockets.
    pub fn shutdown(self) {
        self.queue.shutdown(self.workers.len());
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, queue: &WorkQueue, shared: &Shared) {
    debug!(worker = id, "Worker started");
    while let Some(fd) = queue.take(id) {
        let Some(slot) = shared.slots.get(fd) else {
            continue;
        };
        let mut conn = slot.lock().unwrap();
        if !conn.is_active() {
            continue;
        }
        let poller = &shared.pollers[conn.owner()];
        conn.process(
            poller,
            &shared.doc_root,
            shared.use_sendfile,
            shared.slots.counter(),
        );
    }
    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_semaphore_counts_posts() {
        let sem = Arc::new(Semaphore::new());
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();

        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn test_shared_queue_rejects_at_capacity() {
        let queue = WorkQueue::shared(1);
        assert!(queue.append(7));
        // Full at exactly max_requests entries.
        assert!(!queue.append(8));
        assert_eq!(queue.take(0), Some(7));
        assert!(queue.append(8));
    }

    #[test]
    fn test_shared_queue_is_fifo() {
        let queue = WorkQueue::shared(16);
        for fd in 3..9 {
            assert!(queue.append(fd));
        }
        for fd in 3..9 {
            assert_eq!(queue.take(0), Some(fd));
        }
    }

    #[test]
    fn test_spsc_queue_round_robins_workers() {
        let queue = WorkQueue::spsc(2, 4);
        assert!(queue.append(10));
        assert!(queue.append(11));
        assert!(queue.append(12));
        assert_eq!(queue.take(0), Some(10));
        assert_eq!(queue.take(1), Some(11));
        assert_eq!(queue.take(0), Some(12));
    }

    #[test]
    fn test_spsc_queue_rejects_when_ring_full() {
        // One worker, ring length 3: two usable slots.
        let queue = WorkQueue::spsc(1, 3);
        assert!(queue.append(1));
        assert!(queue.append(2));
        assert!(!queue.append(3));
    }

    #[test]
    fn test_shutdown_wakes_blocked_workers() {
        let queue = Arc::new(WorkQueue::shared(4));
        let workers: Vec<_> = (0..3)
            .map(|id| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.take(id))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        queue.shutdown(3);
        for worker in workers {
            assert_eq!(worker.join().unwrap(), None);
        }
        assert!(!queue.append(1));
    }
}
