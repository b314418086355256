use crate::orchestrator::{partition_batch, Orchestrator, Partition};
use crate::{CaptureOutcome, ReferenceItem};
use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, warn};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

enum Job {
    Capture(Partition, oneshot::Sender<Vec<CaptureOutcome>>),
}

/// A pool of capture threads fed with claimed partitions over a channel.
///
/// Each worker thread opens its own render session per partition, so
/// sessions never cross threads and engines need not hand out `Send`
/// sessions. Callers submit partitions from async code and await the
/// outcomes; partitions run in parallel, URLs within a partition run in
/// order.
pub struct CapturePool {
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CapturePool {
    /// Spawn `workers` capture threads (at least one) sharing `orchestrator`.
    pub fn new(orchestrator: Arc<Orchestrator>, workers: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = (0..workers.max(1))
            .map(|n| {
                let orchestrator = Arc::clone(&orchestrator);
                let job_rx = Arc::clone(&job_rx);
                thread::Builder::new()
                    .name(format!("refhub-capture-{}", n))
                    .spawn(move || worker_loop(n, &orchestrator, &job_rx))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Failed to spawn capture thread: {}", e);
                    None
                }
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            workers,
        }
    }

    /// Number of live capture threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue one partition and resolve to its outcomes.
    ///
    /// Resolves to exactly one outcome per target: if the pool is shut down
    /// or the worker dies mid-partition, every target is reported FAILED.
    pub fn submit(&self, partition: Partition) -> BoxFuture<'static, Vec<CaptureOutcome>> {
        let (tx, rx) = oneshot::channel();
        let fallback = partition.clone();

        match &self.job_tx {
            Some(job_tx) => {
                // A failed send drops the job and its reply sender; `rx` then errors.
                let _ = job_tx.send(Job::Capture(partition, tx));
            }
            None => drop(tx),
        }

        async move {
            match rx.await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    warn!("Capture for {} abandoned: {}", fallback.key, e);
                    fallback.fail_all(&format!("capture worker stopped: {}", e))
                }
            }
        }
        .boxed()
    }

    /// Capture a whole batch and return outcomes in batch order.
    pub async fn capture_all(&self, items: &[ReferenceItem]) -> Vec<CaptureOutcome> {
        let pending: Vec<_> = partition_batch(items)
            .into_iter()
            .map(|partition| self.submit(partition))
            .collect();
        let mut outcomes: Vec<CaptureOutcome> =
            future::join_all(pending).await.into_iter().flatten().collect();
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }

    /// Stop accepting work and wait for in-flight partitions to finish.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CapturePool {
    fn drop(&mut self) {
        // Threads exit once the channel closes; do not block on them here.
        self.job_tx.take();
    }
}

fn worker_loop(n: usize, orchestrator: &Orchestrator, job_rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = match job_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        match job {
            Ok(Job::Capture(partition, resp)) => {
                debug!("capture-{} took partition {}", n, partition.key);
                let outcomes = orchestrator.capture_partition(&partition);
                let _ = resp.send(outcomes);
            }
            Err(_) => break,
        }
    }
    debug!("capture-{} stopped", n);
}
