//! Batch worker: sweep stale claims, atomically claim pending items, capture
//! them on the pool and apply each outcome as soon as its partition is done.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{info, warn};
use serde::Serialize;

use crate::orchestrator::{partition_batch, Orchestrator};
use crate::{CapturePool, CaptureConfig, ReferenceStore, RenderEngine, Result};

/// Knobs for one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum items claimed per batch
    pub batch_limit: usize,
    /// Capture threads, i.e. partitions rendered in parallel
    pub concurrency: usize,
    /// PROCESSING items older than this are failed before claiming
    pub stale_after: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            batch_limit: 200,
            concurrency: num_cpus::get().max(1),
            stale_after: None,
        }
    }
}

/// Floor for the stale-claim age used when none is configured.
pub const MIN_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Stale-claim age that never reclaims items a live batch still owns.
///
/// Claimed rows are not re-stamped while a batch runs, so the age must
/// exceed [`CaptureConfig::worst_case_batch`]; it is never below an hour.
pub fn default_stale_after(config: &CaptureConfig, batch_limit: usize) -> Duration {
    config.worst_case_batch(batch_limit).max(MIN_STALE_AFTER)
}

/// Aggregate counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub recovered_stale: usize,
}

/// Claims and captures bounded batches against one store.
pub struct CaptureWorker {
    store: Arc<ReferenceStore>,
    pool: CapturePool,
    options: WorkerOptions,
}

impl CaptureWorker {
    pub fn new(
        store: Arc<ReferenceStore>,
        engine: Arc<dyn RenderEngine>,
        config: CaptureConfig,
        output_root: PathBuf,
        options: WorkerOptions,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(age) = options.stale_after {
            let worst = config.worst_case_batch(options.batch_limit);
            if age < worst {
                warn!(
                    "Stale age {}s is shorter than the worst-case batch time {}s; \
                     a slow batch in another process may lose its claims",
                    age.as_secs(),
                    worst.as_secs()
                );
            }
        }
        let orchestrator = Arc::new(Orchestrator::new(engine, config, output_root));
        let pool = CapturePool::new(orchestrator, options.concurrency);
        Ok(Self {
            store,
            pool,
            options,
        })
    }

    /// Process one batch to completion.
    ///
    /// Every claimed item ends SUCCESS or FAILED unless a store write fails,
    /// which aborts the batch with the persistence error; items not yet
    /// applied stay PROCESSING until a stale sweep recovers them.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        if let Some(age) = self.options.stale_after {
            report.recovered_stale = self.store.recover_stale(age)?;
        }

        let claimed = self.store.claim_pending(self.options.batch_limit)?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            info!("No pending items to capture");
            return Ok(report);
        }

        let mut in_flight: FuturesUnordered<_> = partition_batch(&claimed)
            .into_iter()
            .map(|partition| self.pool.submit(partition))
            .collect();

        while let Some(outcomes) = in_flight.next().await {
            for outcome in outcomes {
                self.store.apply_result(&outcome.item_id, &outcome.result)?;
                if outcome.is_success() {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                }
            }
        }

        info!(
            "Batch done: claimed={} success={} failed={}",
            report.claimed, report.succeeded, report.failed
        );
        Ok(report)
    }

    /// Run batches until the queue is empty or `max_batches` have run.
    pub async fn drain(&self, max_batches: usize) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        for _ in 0..max_batches {
            let report = self.run_batch().await?;
            total.claimed += report.claimed;
            total.succeeded += report.succeeded;
            total.failed += report.failed;
            total.recovered_stale += report.recovered_stale;
            if report.claimed == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Stop the capture threads after in-flight partitions finish.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}
