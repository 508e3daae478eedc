//! Dispatch loop.
//!
//! The [`Dispatcher`] owns the process-wide state shared by the loop and the
//! notify listener: the wake signal and the cycle mutex. One cycle fetches the
//! parallel batch and runs it to completion, then does the same for the serial
//! batch.

mod signal;

pub use signal::WakeSignal;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::domain::{Job, Lane};
use crate::lanes::{DEFAULT_PARALLEL_WIDTH, LaneReport, ParallelLane, SerialLane};
use crate::notification::{Alert, AlertChannel};
use crate::processor::{JOB_EXCEPTION_EVENT, JobProcessor, StoreAccess};
use crate::store::{JobSource, JobStore};

/// Dispatch loop timing and sizing.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Longest idle wait for the wake signal.
    pub wait_timeout: Duration,
    /// Pause after every cycle.
    pub cycle_delay: Duration,
    /// Parallel lane width.
    pub parallel_width: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(60),
            cycle_delay: Duration::from_secs(5),
            parallel_width: DEFAULT_PARALLEL_WIDTH,
        }
    }
}

/// Answer to a new-job notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The wake signal was set.
    Accepted,
    /// A cycle is in flight; the job is left to a later cycle.
    Busy,
}

/// Counts of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub parallel: LaneReport,
    pub serial: LaneReport,
}

pub struct Dispatcher {
    signal: WakeSignal,
    cycle_lock: Mutex<()>,
    source: Arc<dyn JobSource>,
    store: Arc<dyn JobStore>,
    processor: Arc<JobProcessor>,
    parallel: ParallelLane,
    serial: SerialLane,
    alerts: Arc<dyn AlertChannel>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn JobSource>,
        store: Arc<dyn JobStore>,
        processor: Arc<JobProcessor>,
        alerts: Arc<dyn AlertChannel>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            signal: WakeSignal::new(),
            cycle_lock: Mutex::new(()),
            parallel: ParallelLane::new(processor.clone(), config.parallel_width),
            serial: SerialLane::new(processor.clone()),
            source,
            store,
            processor,
            alerts,
            config,
        }
    }

    pub fn signal(&self) -> &WakeSignal {
        &self.signal
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Whether a cycle currently holds the cycle mutex.
    pub fn is_busy(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// Handle a new-job notification.
    ///
    /// The busy check and the signal are not atomic; a job announced while a
    /// cycle finishes is picked up by the loop's own polling.
    pub fn try_notify(&self) -> NotifyOutcome {
        if self.is_busy() {
            debug!("Cycle in flight; job notification queued");
            return NotifyOutcome::Busy;
        }
        self.signal.set();
        NotifyOutcome::Accepted
    }

    /// Run dispatch cycles until `cancel` fires.
    ///
    /// Cancellation is observed between cycles; a running cycle always
    /// finishes.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            width = self.parallel.width(),
            wait_timeout = ?self.config.wait_timeout,
            "Dispatch loop started"
        );

        while !cancel.is_cancelled() {
            if !self.wait_for_work(&cancel).await && cancel.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) => {
                    if report.parallel.total() + report.serial.total() > 0 {
                        info!(
                            parallel = report.parallel.total(),
                            serial = report.serial.total(),
                            "Dispatch cycle finished"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "An error occurred while processing jobs");
                    self.alerts
                        .push(Alert::error(
                            JOB_EXCEPTION_EVENT,
                            format!("[ERROR] - An error occurred while processing jobs\n{}", e),
                        ))
                        .await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.cycle_delay) => {}
            }
        }

        info!("Dispatch loop stopped");
    }

    /// Skip the wait when the store reports pending jobs, otherwise wait for
    /// the wake signal or the timeout. Returns `true` when woken early.
    async fn wait_for_work(&self, cancel: &CancellationToken) -> bool {
        match self.store.has_pending().await {
            Ok(true) => {
                info!("New jobs available in the store, processing immediately");
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Pending job check failed"),
        }

        tokio::select! {
            woke = self.signal.wait(self.config.wait_timeout) => woke,
            _ = cancel.cancelled() => false,
        }
    }

    /// One full cycle under the cycle mutex: the parallel batch to
    /// completion, then the serial batch. Clears the wake signal on success.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let report = {
            let _cycle = self.cycle_lock.lock().await;

            let jobs = self.fetch(Lane::Parallel).await;
            let parallel = self.parallel.run(jobs).await?;

            let jobs = self.fetch(Lane::Serial).await;
            let serial = self.serial.run(jobs).await?;

            CycleReport { parallel, serial }
        };
        self.signal.clear();
        Ok(report)
    }

    /// Claim a batch. Gateway faults are logged and read as "no work".
    async fn fetch(&self, lane: Lane) -> Vec<Job> {
        match self.source.fetch_batch(lane).await {
            Ok(jobs) => {
                debug!(%lane, count = jobs.len(), "Batch claimed");
                jobs
            }
            Err(e) => {
                warn!(%lane, error = %e, "Failed to fetch job batch");
                Vec::new()
            }
        }
    }

    /// Claim both batches once and process every job serially with the
    /// streaming processor, forwarding all events to `events`.
    ///
    /// Jobs past their expiration time are reported and left untouched.
    pub async fn drain(&self, events: mpsc::Sender<String>) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;
        let _ = events
            .send("Fetching number of available jobs to be processed".to_string())
            .await;

        let parallel = self.fetch(Lane::Parallel).await;
        let serial = self.fetch(Lane::Serial).await;

        let now = Utc::now();
        let mut expired = Vec::new();
        let batches: Vec<(Lane, Vec<Job>)> = [(Lane::Parallel, parallel), (Lane::Serial, serial)]
            .into_iter()
            .map(|(lane, jobs)| {
                let (live, stale): (Vec<Job>, Vec<Job>) =
                    jobs.into_iter().partition(|job| !job.is_expired_at(now));
                expired.extend(stale);
                (lane, live)
            })
            .collect();
        for job in &expired {
            warn!(job_id = %job.id, tool = %job.tool, "Skipping expired job");
            let _ = events
                .send(format!("Job {} for tool {} has expired, skipping", job.id, job.tool))
                .await;
        }

        let count: usize = batches.iter().map(|(_, jobs)| jobs.len()).sum();
        if count == 0 {
            let _ = events.send("No pending jobs available".to_string()).await;
            return CycleReport::default();
        }
        let _ = events
            .send(format!("Number of jobs to be processed: {}", count))
            .await;

        let lock = self.processor.store_lock();
        let mut report = CycleReport::default();
        for (lane, jobs) in batches {
            for job in jobs {
                let _guard = lock.lock().await;
                let outcome = self
                    .processor
                    .process_streaming(&job, StoreAccess::Held, events.clone())
                    .await;
                match lane {
                    Lane::Parallel => report.parallel.record(&outcome),
                    Lane::Serial => report.serial.record(&outcome),
                }
            }
        }

        let _ = events
            .send("All jobs processed and executed successfully".to_string())
            .await;
        report
    }
}
