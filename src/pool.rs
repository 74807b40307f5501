// src/pool.rs
//
// Fixed-size worker pool over a bounded FIFO queue. Dispatch is
// semaphore-driven: submit posts one permit per enqueued task, workers block
// on the permit and pop in arrival order.

use crate::error::{ServerError, ServerResult};
use crate::sync::Semaphore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Unit of work the pool runs. Connections implement this through their
/// mutex wrapper so the queue can hold shared handles.
pub trait Task: Send + Sync + 'static {
    fn process(&self);
}

struct PoolShared<T> {
    queue: Mutex<VecDeque<Arc<T>>>,
    ready: Semaphore,
    stop: AtomicBool,
    max_depth: usize,
}

pub struct ThreadPool<T: Task> {
    shared: Arc<PoolShared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Task> ThreadPool<T> {
    /// Spawn `workers` named threads, each pinned to a core when the host
    /// exposes core ids. Both dimensions must be positive.
    pub fn new(workers: usize, max_depth: usize) -> ServerResult<Self> {
        if workers == 0 || max_depth == 0 {
            return Err(ServerError::InvalidPoolSize);
        }

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
            stop: AtomicBool::new(false),
            max_depth,
        });

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = shared.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let handle = thread::Builder::new()
                .name(format!("staticd-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, core = id.id, "worker pinned");
                        }
                    }
                    Self::worker_loop(&shared);
                })
                .map_err(ServerError::Io)?;
            handles.push(handle);
        }

        tracing::info!(workers, max_depth, "thread pool started");
        Ok(Self { shared, handles })
    }

    /// Enqueue a task handle. Returns false when the queue is at capacity;
    /// the caller decides how to shed the load.
    pub fn submit(&self, task: Arc<T>) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.shared.max_depth {
            return false;
        }
        queue.push_back(task);
        drop(queue);
        self.shared.ready.post();
        true
    }

    fn worker_loop(shared: &PoolShared<T>) {
        loop {
            shared.ready.wait();
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            let task = shared.queue.lock().unwrap().pop_front();
            let Some(task) = task else { continue };
            task.process();
        }
    }
}

impl<T: Task> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        // One wake-up permit per worker so every loop observes the flag.
        for _ in &self.handles {
            self.shared.ready.post();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct TestTask {
        id: usize,
        gate: Arc<AtomicBool>,
        hits: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl TestTask {
        fn new(
            id: usize,
            gate: &Arc<AtomicBool>,
            hits: &Arc<AtomicUsize>,
            seen: &Arc<Mutex<Vec<usize>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                id,
                gate: gate.clone(),
                hits: hits.clone(),
                seen: seen.clone(),
            })
        }
    }

    impl Task for TestTask {
        fn process(&self) {
            while !self.gate.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            self.seen.lock().unwrap().push(self.id);
            self.hits.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn fixtures() -> (Arc<AtomicBool>, Arc<AtomicUsize>, Arc<Mutex<Vec<usize>>>) {
        (
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    fn wait_for(hits: &AtomicUsize, target: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::Acquire) < target {
            assert!(Instant::now() < deadline, "pool never drained the queue");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(matches!(
            ThreadPool::<TestTask>::new(0, 4),
            Err(ServerError::InvalidPoolSize)
        ));
        assert!(matches!(
            ThreadPool::<TestTask>::new(4, 0),
            Err(ServerError::InvalidPoolSize)
        ));
    }

    #[test]
    fn runs_every_submitted_task() {
        let pool: ThreadPool<TestTask> = ThreadPool::new(4, 64).unwrap();
        let (gate, hits, seen) = fixtures();
        gate.store(true, Ordering::Release);

        for i in 0..32 {
            assert!(pool.submit(TestTask::new(i, &gate, &hits, &seen)));
        }
        wait_for(&hits, 32);
        assert_eq!(seen.lock().unwrap().len(), 32);
    }

    #[test]
    fn single_worker_preserves_arrival_order() {
        let pool: ThreadPool<TestTask> = ThreadPool::new(1, 64).unwrap();
        let (gate, hits, seen) = fixtures();

        for i in 0..8 {
            assert!(pool.submit(TestTask::new(i, &gate, &hits, &seen)));
        }
        gate.store(true, Ordering::Release);
        wait_for(&hits, 8);

        assert_eq!(*seen.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn submit_reports_queue_overflow() {
        let pool: ThreadPool<TestTask> = ThreadPool::new(1, 2).unwrap();
        let (gate, hits, seen) = fixtures();

        // Park the single worker on a gated task so nothing drains.
        assert!(pool.submit(TestTask::new(0, &gate, &hits, &seen)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pool.shared.queue.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "worker never picked up the task");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(pool.submit(TestTask::new(1, &gate, &hits, &seen)));
        assert!(pool.submit(TestTask::new(2, &gate, &hits, &seen)));
        assert!(!pool.submit(TestTask::new(3, &gate, &hits, &seen)));

        gate.store(true, Ordering::Release);
        wait_for(&hits, 3);
    }
}
