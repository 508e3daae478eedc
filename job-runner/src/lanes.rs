//! Lane executors.
//!
//! The parallel lane runs a batch on a bounded worker pool and returns only
//! once every job has finished. The serial lane runs its batch one job at a
//! time while holding the store mutex for each job's entire processing.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::domain::Job;
use crate::processor::{JobOutcome, JobProcessor, StoreAccess};
use crate::{Error, Result};

/// Default width of the parallel lane.
pub const DEFAULT_PARALLEL_WIDTH: usize = 5;

/// Counts of a lane run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneReport {
    pub completed: usize,
    pub failed: usize,
}

impl LaneReport {
    pub(crate) fn record(&mut self, outcome: &JobOutcome) {
        if outcome.is_completed() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Bounded worker pool with a full barrier.
pub struct ParallelLane {
    width: usize,
    processor: Arc<JobProcessor>,
}

impl ParallelLane {
    pub fn new(processor: Arc<JobProcessor>, width: usize) -> Self {
        Self {
            width: width.clamp(1, Semaphore::MAX_PERMITS),
            processor,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Process `jobs` with at most `width` running at once.
    ///
    /// Returns after every job has reached a terminal state. A worker task
    /// that panics is reported as a cycle-level error once the barrier is
    /// reached.
    pub async fn run(&self, jobs: Vec<Job>) -> Result<LaneReport> {
        let mut report = LaneReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }
        info!(count = jobs.len(), width = self.width, "Running parallel lane");

        let semaphore = Arc::new(Semaphore::new(self.width));
        let mut workers = JoinSet::new();
        for job in jobs {
            let semaphore = semaphore.clone();
            let processor = self.processor.clone();
            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Other("Parallel lane semaphore closed".to_string()))?;
                debug!(job_id = %job.id, "Worker acquired slot");
                Ok::<_, Error>(processor.process(&job, StoreAccess::Shared).await)
            });
        }

        let mut fault = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(&outcome),
                Ok(Err(e)) => {
                    error!(error = %e, "Parallel worker could not run");
                    fault.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Parallel worker task failed");
                    fault.get_or_insert(Error::Other(format!("Parallel worker task failed: {}", e)));
                }
            }
        }

        match fault {
            Some(e) => Err(e),
            None => {
                info!(completed = report.completed, failed = report.failed, "Parallel lane finished");
                Ok(report)
            }
        }
    }
}

/// One job at a time under the store mutex.
pub struct SerialLane {
    lock: Arc<Mutex<()>>,
    processor: Arc<JobProcessor>,
}

impl SerialLane {
    pub fn new(processor: Arc<JobProcessor>) -> Self {
        Self {
            lock: processor.store_lock(),
            processor,
        }
    }

    pub async fn run(&self, jobs: Vec<Job>) -> Result<LaneReport> {
        let mut report = LaneReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }
        info!(count = jobs.len(), "Running serial lane");

        for job in jobs {
            let _guard = self.lock.lock().await;
            let outcome = self.processor.process(&job, StoreAccess::Held).await;
            report.record(&outcome);
        }

        info!(completed = report.completed, failed = report.failed, "Serial lane finished");
        Ok(report)
    }
}
