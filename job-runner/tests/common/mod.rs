//! Shared test doubles for the job-runner integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use job_runner::dispatcher::{Dispatcher, DispatcherConfig};
use job_runner::domain::{Job, JobStatus, Lane};
use job_runner::notification::{Alert, AlertChannel, JobNotification, UserNotifier};
use job_runner::processor::JobProcessor;
use job_runner::progress::{ProgressSink, ProgressUpdate};
use job_runner::registry::{NativeTask, TaskRegistry, TaskRegistryBuilder};
use job_runner::runner::{ProcessRunner, ProcessRunnerConfig};
use job_runner::store::{JobSource, JobStore};
use job_runner::{Error, Result};

/// Stored state of one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub progress_history: Vec<u8>,
    pub status_message: Option<String>,
    pub result: Option<Value>,
}

/// In-memory job store enforcing forward-only status changes.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn insert(&self, job: &Job) {
        self.jobs.lock().unwrap().insert(
            job.id.clone(),
            JobRecord {
                status: job.status,
                progress: None,
                progress_history: Vec::new(),
                status_message: None,
                result: None,
            },
        );
    }

    pub fn get(&self, id: &str) -> JobRecord {
        self.jobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("job {} not in store", id))
    }

    pub fn status(&self, id: &str) -> JobStatus {
        self.get(id).status
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn update<F>(&self, id: &str, next: JobStatus, apply: F) -> Result<()>
    where
        F: FnOnce(&mut JobRecord),
    {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Other("store unavailable".to_string()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| Error::Other(format!("job {} not in store", id)))?;
        record.status = record.status.transition(next)?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn has_pending(&self) -> Result<bool> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .any(|r| r.status == JobStatus::Pending))
    }

    async fn mark_processing(&self, job_id: &str) -> Result<()> {
        self.update(job_id, JobStatus::Processing, |_| {})
    }

    async fn record_progress(&self, job_id: &str, percent: u8, message: Option<&str>) -> Result<()> {
        self.update(job_id, JobStatus::Progress, |r| {
            r.progress = Some(percent);
            r.progress_history.push(percent);
            if let Some(message) = message {
                r.status_message = Some(message.to_string());
            }
        })
    }

    async fn complete(&self, job_id: &str, result: Option<&Value>) -> Result<()> {
        self.update(job_id, JobStatus::Completed, |r| {
            r.result = result.cloned();
            r.status_message = Some("Job completed successfully".to_string());
        })
    }

    async fn fail(&self, job_id: &str, message: &str) -> Result<()> {
        self.update(job_id, JobStatus::Failed, |r| {
            r.status_message = Some(message.to_string());
        })
    }
}

/// Job source returning pre-loaded batches, one per fetch, per lane.
///
/// Claimed jobs are inserted into the store as `processing`, the way the
/// real gateway marks them.
pub struct ScriptedSource {
    store: Arc<MemoryStore>,
    parallel: Mutex<VecDeque<Vec<Job>>>,
    serial: Mutex<VecDeque<Vec<Job>>>,
    fetches: Mutex<Vec<(Lane, usize)>>,
    fail: AtomicBool,
}

impl ScriptedSource {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            parallel: Mutex::new(VecDeque::new()),
            serial: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn push(&self, lane: Lane, jobs: Vec<Job>) {
        match lane {
            Lane::Parallel => self.parallel.lock().unwrap().push_back(jobs),
            Lane::Serial => self.serial.lock().unwrap().push_back(jobs),
        }
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every fetch so far with the number of jobs it returned.
    pub fn fetches(&self) -> Vec<(Lane, usize)> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSource for ScriptedSource {
    async fn fetch_batch(&self, lane: Lane) -> Result<Vec<Job>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Gateway("503 Service Unavailable".to_string()));
        }
        let batch = match lane {
            Lane::Parallel => self.parallel.lock().unwrap().pop_front(),
            Lane::Serial => self.serial.lock().unwrap().pop_front(),
        }
        .unwrap_or_default();

        let claimed: Vec<Job> = batch
            .into_iter()
            .map(|mut job| {
                job.status = JobStatus::Processing;
                self.store.insert(&job);
                job
            })
            .collect();
        self.fetches.lock().unwrap().push((lane, claimed.len()));
        Ok(claimed)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<JobNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<JobNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserNotifier for RecordingNotifier {
    async fn notify(&self, notification: &JobNotification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Alert channel that records alerts and can be told to fail delivery.
#[derive(Default)]
pub struct RecordingAlerts {
    pub sent: Mutex<Vec<Alert>>,
    fail: AtomicBool,
}

impl RecordingAlerts {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(true),
        }
    }

    pub fn sent(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertChannel for RecordingAlerts {
    fn channel_type(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        self.sent.lock().unwrap().push(alert.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Other("alert endpoint down".to_string()));
        }
        Ok(())
    }
}

/// Progress sink collecting every update.
#[derive(Default)]
pub struct CollectingSink {
    pub updates: Mutex<Vec<ProgressUpdate>>,
}

impl CollectingSink {
    pub fn percents(&self) -> Vec<u8> {
        self.updates.lock().unwrap().iter().map(|u| u.percent).collect()
    }
}

#[async_trait]
impl ProgressSink for CollectingSink {
    async fn report(&self, update: ProgressUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// Execution span of one job.
#[derive(Debug, Clone)]
pub struct Span {
    pub job_id: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Tracks how many tracked tasks run at once and when each ran.
#[derive(Default)]
pub struct Tracker {
    running: AtomicUsize,
    max_running: AtomicUsize,
    spans: Mutex<Vec<Span>>,
    started: AtomicUsize,
}

impl Tracker {
    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self, span: Span) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().unwrap().push(span);
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    pub fn span(&self, job_id: &str) -> Span {
        self.spans()
            .into_iter()
            .find(|s| s.job_id == job_id)
            .unwrap_or_else(|| panic!("no span for {}", job_id))
    }
}

/// In-process task sleeping for `payload.millis` and echoing the payload.
pub struct SleepTask {
    pub tracker: Arc<Tracker>,
}

#[async_trait]
impl NativeTask for SleepTask {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn run(&self, input: Value, progress: Arc<dyn ProgressSink>) -> Result<Option<Value>> {
        let job_id = input["job_id"].as_str().unwrap_or_default().to_string();
        let millis = input["millis"].as_u64().unwrap_or(0);

        self.tracker.enter();
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(millis)).await;
        progress.report(ProgressUpdate::new(100, None)).await;
        let finished = Instant::now();
        self.tracker.exit(Span {
            job_id,
            started,
            finished,
        });

        if input["panic"].as_bool().unwrap_or(false) {
            panic!("task blew up");
        }
        Ok(Some(input))
    }
}

/// Write a `sh` task script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    path
}

pub fn sh() -> Vec<String> {
    vec!["sh".to_string()]
}

pub fn test_runner() -> ProcessRunner {
    ProcessRunner::new(ProcessRunnerConfig {
        search_path_var: "JOB_RUNNER_TEST_PATH".to_string(),
        search_path: vec![PathBuf::from("/srv/app")],
        poll_interval: Duration::from_millis(10),
    })
}

/// Registry builder with `sh` as interpreter and a native `Sleep` tool.
pub fn registry_builder(dir: &Path, tracker: Arc<Tracker>) -> TaskRegistryBuilder {
    TaskRegistry::builder(dir)
        .interpreter(sh())
        .native("Sleep", Arc::new(SleepTask { tracker }))
}

pub fn sleep_job(id: &str, millis: u64) -> Job {
    Job::new(id, "Sleep", serde_json::json!({ "millis": millis }))
}

/// Every collaborator wired together.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub source: Arc<ScriptedSource>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: Arc<RecordingAlerts>,
    pub processor: Arc<JobProcessor>,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<Tracker>,
}

impl Harness {
    pub fn new(registry: TaskRegistry, tracker: Arc<Tracker>, config: DispatcherConfig) -> Self {
        Self::with_alerts(registry, tracker, config, RecordingAlerts::default())
    }

    pub fn with_alerts(
        registry: TaskRegistry,
        tracker: Arc<Tracker>,
        config: DispatcherConfig,
        alerts: RecordingAlerts,
    ) -> Self {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(ScriptedSource::new(store.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let alerts = Arc::new(alerts);
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            Arc::new(registry),
            test_runner(),
            notifier.clone(),
            alerts.clone(),
            Arc::new(tokio::sync::Mutex::new(())),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            source.clone(),
            store.clone(),
            processor.clone(),
            alerts.clone(),
            config,
        ));
        Self {
            store,
            source,
            notifier,
            alerts,
            processor,
            dispatcher,
            tracker,
        }
    }

    /// Harness over a registry holding only the native `Sleep` tool.
    pub fn sleeping(config: DispatcherConfig) -> Self {
        let tracker = Arc::new(Tracker::default());
        let registry = registry_builder(Path::new("/nonexistent"), tracker.clone()).build();
        Self::new(registry, tracker, config)
    }
}

pub fn fast_config(width: usize) -> DispatcherConfig {
    DispatcherConfig {
        wait_timeout: Duration::from_millis(200),
        cycle_delay: Duration::from_millis(10),
        parallel_width: width,
    }
}
