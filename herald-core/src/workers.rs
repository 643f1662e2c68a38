//! Bounded concurrent dispatch of delivery tasks to listeners.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// A unit of delivery work: invoking a listener or a post callback/errback.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_WORKERS: usize = 5;

/// A fixed number of worker tasks draining a FIFO of delivery jobs.
///
/// The queue itself is unbounded so `enqueue` is non-blocking and never
/// drops a job (§4.7); "bounded" describes the fixed worker count, not the
/// queue depth.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start() -> Self {
        Self::start_with(DEFAULT_WORKERS)
    }

    pub fn start_with(worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let receiver = receiver.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => job(),
                        None => break,
                    }
                }
            }));
        }
        WorkerPool { sender, workers }
    }

    /// Schedules `job`. Never blocks and never drops the job.
    pub fn enqueue(&self, job: Job) {
        // A send error only happens after `stop()`, at which point the job
        // is meant to be abandoned anyway.
        let _ = self.sender.send(job);
    }

    /// Stops the pool. Pending/in-flight jobs are abandoned (aborted), not
    /// drained, matching the engine's shutdown semantics (§5).
    pub fn stop(self) {
        for worker in self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn enqueue_runs_jobs_on_workers() {
        let pool = WorkerPool::start_with(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.stop();
    }

    #[tokio::test]
    async fn enqueue_after_stop_does_not_panic() {
        let pool = WorkerPool::start_with(1);
        pool.stop();
    }
}
