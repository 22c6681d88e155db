//! Per-session sequential executor.
//!
//! A fiber is an unbounded FIFO of jobs consumed by exactly one worker task,
//! so everything submitted to one fiber runs one at a time, in submission
//! order. Handler panics are caught per job and never kill the worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Fiber {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: JoinHandle<()>,
}

impl Fiber {
    pub fn spawn() -> Arc<Fiber> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("fiber job panicked");
                }
            }
        });

        Arc::new(Fiber { tx: Mutex::new(Some(tx)), worker })
    }

    /// Submits a job. Jobs submitted after `shutdown` are dropped.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Stops accepting jobs; the worker finishes everything already queued
    /// and then exits.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap().take();
    }

    /// Stops the worker without running queued jobs.
    pub fn dispose(&self) {
        self.shutdown();
        self.worker.abort();
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    async fn settle(fiber: &Arc<Fiber>) {
        // queue a marker job and wait for it, proving everything before ran
        let done = Arc::new(AtomicUsize::new(0));
        let observed = done.clone();
        fiber.execute(move || {
            observed.store(1, Ordering::SeqCst);
        });
        while done.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jobs_run_in_submission_order() {
        let fiber = Fiber::spawn();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = log.clone();
            fiber.execute(move || log.lock().unwrap().push(i));
        }
        settle(&fiber).await;

        assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panic_does_not_kill_the_worker() {
        let fiber = Fiber::spawn();
        let ran = Arc::new(AtomicUsize::new(0));

        fiber.execute(|| panic!("boom"));
        let observed = ran.clone();
        fiber.execute(move || {
            observed.store(7, Ordering::SeqCst);
        });
        settle(&fiber).await;

        assert_eq!(ran.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_runs_queued_jobs_then_rejects() {
        let fiber = Fiber::spawn();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = count.clone();
            fiber.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        fiber.shutdown();

        // submitted after shutdown, must never run
        let late = count.clone();
        fiber.execute(move || {
            late.fetch_add(100, Ordering::SeqCst);
        });

        while count.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(fiber.is_shutdown());
    }
}
