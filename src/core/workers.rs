//! Decode thread pool.
//!
//! Uses work-stealing deques:
//! - Tasks are pushed to a global injector
//! - Idle workers steal from the injector, then from each other
//!
//! Seeks of independent video layers run here in parallel while the GL
//! thread stays free; anything touching GL is marshalled back through
//! [`crate::core::queue::ExecutionQueue`].

use crossbeam::deque::{Injector, Stealer, Worker};
use crossbeam_channel::unbounded;
use log::trace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool with work-stealing for background decode jobs.
///
/// Jobs go to a shared injector; each thread keeps a FIFO deque it refills
/// in batches from the injector, and idle threads steal from their peers.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4);
///
/// // One seek per visible video layer, results in layer order
/// let results = workers.map(sources, |source| source.seek_to(t_ms))?;
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,         // Global queue, every job enters here
    // Note: stealers are cloned into each thread, not stored here
    handles: Vec<thread::JoinHandle<()>>, // Joined (with a deadline) on drop
    shutdown: Arc<AtomicBool>,            // Set once by Drop
}

/// Next job for one worker thread.
fn find_job(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>]) -> Option<Job> {
    // 1. Own deque first
    local
        .pop()
        // 2. Global injector, moving a batch into the own deque
        .or_else(|| injector.steal_batch_and_pop(local).success())
        // 3. Other workers, oldest jobs first
        .or_else(|| stealers.iter().find_map(|s| s.steal().success()))
}

impl Workers {
    /// Create a pool of `num_threads` (at least one).
    ///
    /// Recommended: `num_cpus::get() * 3 / 4`, leaving room for the GL thread.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        // Per-worker deques; their stealers are shared with every thread
        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(|w| w.stealer()).collect();
        let mut handles = Vec::with_capacity(num_threads);

        // Spawn worker threads
        for (worker_id, local) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("framecraft-decode-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);

                    // Work-stealing loop
                    loop {
                        if let Some(job) = find_job(&local, &injector, &stealers) {
                            job();
                            continue;
                        }

                        // Shutdown is only honoured once the queues are drained
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        // No work: 1ms sleep instead of spinning
                        thread::sleep(Duration::from_millis(1));
                    }

                    trace!("Worker {} stopped", worker_id);
                })
                .expect("Failed to spawn worker thread");

            handles.push(handle);
        }

        trace!("Workers initialized: {} threads (work-stealing)", num_threads);

        Self {
            injector,
            handles,
            shutdown,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }

    /// Run closure on a worker thread. Fire and forget.
    ///
    /// Use channels or `Arc`ed state to get results back, or [`Workers::map`].
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // All workers poll the injector before stealing from each other
        self.injector.push(Box::new(f));
    }

    /// Apply `f` to every item in parallel and wait for all results, in input order.
    ///
    /// A panicking job yields `WorkerPanicked` after the others have finished.
    pub fn map<I, R, F>(&self, items: Vec<I>, f: F) -> Result<Vec<R>>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(I) -> R + Send + Sync + 'static,
    {
        let count = items.len();
        let f = Arc::new(f);
        let (tx, rx) = unbounded();
        for (index, item) in items.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let tx = tx.clone();
            self.execute(move || {
                // A panic must still report back, or the collector below waits forever
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(item)));
                let _ = tx.send((index, outcome)); // Receiver only goes away on caller unwind
            });
        }
        // Only the job clones remain, so `rx` ends once every job has reported
        drop(tx);

        // Results arrive in completion order; slot them back by index
        let mut slots: Vec<Option<R>> = (0..count).map(|_| None).collect();
        let mut panicked = None;
        for (index, outcome) in rx.iter().take(count) {
            match outcome {
                Ok(r) => slots[index] = Some(r),
                Err(_) => panicked = Some(index),
            }
        }
        if let Some(index) = panicked {
            return Err(Error::WorkerPanicked(format!("job {} of {}", index, count)));
        }
        slots
            .into_iter()
            .collect::<Option<Vec<R>>>()
            .ok_or_else(|| Error::WorkerPanicked("job result lost".into()))
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        // Signal all workers to stop
        self.shutdown.store(true, Ordering::SeqCst);

        // Wait with timeout (500ms total for all threads)
        // A seek stuck in a decoder poll is bounded by its own timeouts.
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            // Poll until the thread finished or the deadline passed
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    // Remaining threads are detached, not joined
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            // Finished, join to clean up the handle
            let _ = handle.join();
        }

        trace!("All {} workers stopped gracefully", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_map_preserves_order() {
        let workers = Workers::new(4);
        let out = workers.map((0..32).collect(), |i: u64| i * i).unwrap();
        assert_eq!(out, (0..32).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_map_runs_off_caller_thread() {
        let workers = Workers::new(2);
        let caller = thread::current().id();
        let ids = workers.map(vec![(); 4], |_| thread::current().id()).unwrap();
        assert!(ids.iter().all(|id| *id != caller));
    }

    #[test]
    fn test_map_reports_panic() {
        let workers = Workers::new(2);
        let result = workers.map(vec![1, 2, 3], |i: i32| {
            if i == 2 {
                panic!("decode failed");
            }
            i
        });
        assert!(matches!(result, Err(Error::WorkerPanicked(_))));
        // Pool still works afterwards
        assert_eq!(workers.map(vec![5], |i: i32| i + 1).unwrap(), vec![6]);
    }

    #[test]
    fn test_execute_runs_all_jobs() {
        let workers = Workers::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            workers.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_zero_threads_clamped() {
        assert_eq!(Workers::new(0).num_threads(), 1);
    }
}
