//! Job processor: drives one job from acceptance to a terminal status.
//!
//! Every fault raised while handling a job (unknown tool, task failure,
//! bad payload, store error) is contained here: the job is marked `failed`
//! with the error text, its owner is notified and an alert is pushed.
//! Nothing escapes to the lane that called us.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::domain::Job;
use crate::notification::{Alert, AlertChannel, JobNotification, UserNotifier};
use crate::progress::{ProgressSink, StoreProgressSink};
use crate::registry::{TaskHandler, TaskRegistry};
use crate::runner::{ProcessRunner, ProgressHook};
use crate::store::JobStore;
use crate::{Error, Result};

/// Event name of alerts raised for failed jobs.
pub const JOB_EXCEPTION_EVENT: &str = "Job Exception";

/// How progress writes coordinate with the store mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAccess {
    /// Take the store mutex for each progress write.
    Shared,
    /// The caller already holds the store mutex for the whole job.
    Held,
}

/// Terminal result of processing one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { result: Option<Value> },
    Failed { message: String },
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Optional feed of human-readable progress events.
struct Events(Option<mpsc::Sender<String>>);

impl Events {
    async fn emit(&self, event: String) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event).await;
        }
    }
}

/// Runs jobs through their lifecycle.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    runner: ProcessRunner,
    notifier: Arc<dyn UserNotifier>,
    alerts: Arc<dyn AlertChannel>,
    store_lock: Arc<Mutex<()>>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
        runner: ProcessRunner,
        notifier: Arc<dyn UserNotifier>,
        alerts: Arc<dyn AlertChannel>,
        store_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            registry,
            runner,
            notifier,
            alerts,
            store_lock,
        }
    }

    /// The mutex guarding serial execution and progress writes.
    pub fn store_lock(&self) -> Arc<Mutex<()>> {
        self.store_lock.clone()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Process `job` silently.
    pub async fn process(&self, job: &Job, access: StoreAccess) -> JobOutcome {
        self.drive(job, access, Events(None)).await
    }

    /// Process `job`, emitting progress events and the task's output lines
    /// to `events` as they happen.
    pub async fn process_streaming(
        &self,
        job: &Job,
        access: StoreAccess,
        events: mpsc::Sender<String>,
    ) -> JobOutcome {
        self.drive(job, access, Events(Some(events))).await
    }

    async fn drive(&self, job: &Job, access: StoreAccess, events: Events) -> JobOutcome {
        info!(job_id = %job.id, tool = %job.tool, "Processing job");
        events
            .emit(format!("Job with id {} for tool {} in execution", job.id, job.tool))
            .await;

        let result = match self.execute(job, access, &events).await {
            Ok(result) => result,
            Err(e) => return self.fail(job, e, &events).await,
        };

        if let Err(e) = self.store.complete(&job.id, result.as_ref()).await {
            error!(job_id = %job.id, error = %e, "Failed to record job completion");
            return self.fail(job, e, &events).await;
        }
        info!(job_id = %job.id, tool = %job.tool, "Job completed");

        if let Some(notification) = JobNotification::succeeded(job) {
            events.emit("Sending notification to the user".to_string()).await;
            self.notify(&notification).await;
        }
        events
            .emit(format!("Job {} progress information: Job completed", job.id))
            .await;

        JobOutcome::Completed { result }
    }

    async fn execute(&self, job: &Job, access: StoreAccess, events: &Events) -> Result<Option<Value>> {
        self.store.mark_processing(&job.id).await?;

        let handler = self.registry.resolve(&job.tool)?.clone();
        let sink = self.progress_sink(job, access);

        match handler {
            TaskHandler::Script(task) => {
                let argument = job.script_argument()?;
                let progress = task
                    .progress
                    .as_ref()
                    .and_then(|rule| rule.parser_for(job))
                    .map(|parser| ProgressHook::new(parser, sink));

                let program = task.program.display().to_string();
                events
                    .emit(format!(
                        "Opening script {} for job {} and tool {}",
                        program, job.id, job.tool
                    ))
                    .await;

                let output = match &events.0 {
                    Some(lines) => {
                        self.runner
                            .run_streaming(&job.id, &task, &argument, progress, lines.clone())
                            .await?
                    }
                    None => self.runner.run(&job.id, &task, &argument, progress).await?,
                };

                events.emit(format!("Closing script {}", program)).await;
                if output.result.is_none() {
                    debug!(job_id = %job.id, "Task produced no JSON result");
                }
                Ok(output.result)
            }
            TaskHandler::Native(task) => {
                events
                    .emit(format!("Running {} for job {}", task.name(), job.id))
                    .await;
                task.run(job.task_input()?, sink).await
            }
        }
    }

    fn progress_sink(&self, job: &Job, access: StoreAccess) -> Arc<dyn ProgressSink> {
        match access {
            StoreAccess::Shared => Arc::new(StoreProgressSink::locked(
                job.id.clone(),
                self.store.clone(),
                self.store_lock.clone(),
            )),
            StoreAccess::Held => Arc::new(StoreProgressSink::held(job.id.clone(), self.store.clone())),
        }
    }

    async fn fail(&self, job: &Job, err: Error, events: &Events) -> JobOutcome {
        let message = err.job_message();
        warn!(job_id = %job.id, tool = %job.tool, error = %err, "Job failed");

        if let Err(e) = self.store.fail(&job.id, &message).await {
            error!(job_id = %job.id, error = %e, "Failed to record job failure");
        }

        if let Some(notification) = JobNotification::failed(job) {
            events.emit("Sending notification to the user".to_string()).await;
            self.notify(&notification).await;
        }

        self.alerts
            .push(Alert::error(
                JOB_EXCEPTION_EVENT,
                format!(
                    "[ERROR] - An error occurred while processing job {}\n{}",
                    job.id, message
                ),
            ))
            .await;

        events
            .emit(format!("Job with {} for tool {} failed", job.id, job.tool))
            .await;
        events
            .emit(format!("An exception occurred: {}", message))
            .await;

        JobOutcome::Failed { message }
    }

    async fn notify(&self, notification: &JobNotification) {
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(user_id = %notification.user_id, error = %e, "Failed to notify job owner");
        }
    }
}
