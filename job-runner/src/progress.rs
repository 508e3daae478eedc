//! Output-based progress tracking.
//!
//! A [`ProgressParser`] turns output lines of a running task into
//! [`ProgressUpdate`]s; a [`ProgressSink`] persists them. Parsers are chosen
//! per task family through a [`ProgressRule`] in the task registry, so the
//! process runner never needs to know what a progress line looks like.
//!
//! Lines are consumed on a dedicated reader task ([`ProgressTap`]). Callers
//! always await [`ProgressTap::finish`] after the process has exited, so a
//! reader never outlives the process it reads from.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use process_utils::OutputRecordReader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::domain::Job;
use crate::store::JobStore;
use crate::{Error, Result};

/// Marker written by encoders (`-progress pipe:1`) once they are done.
pub const END_MARKER: &str = "progress=end";

const TAP_CHANNEL_CAPACITY: usize = 256;

static TIME_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=(\d{2}):(\d{2}):(\d{2})\.(\d{2})").expect("valid time marker regex")
});

static REPORTED_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[progress\]\s*(\d{1,3})%?(?:\s+(.+))?$").expect("valid progress regex")
});

/// One progress observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Completion percentage in `0..=100`.
    pub percent: u8,
    /// Optional human-readable note.
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(percent: u8, message: Option<String>) -> Self {
        Self {
            percent: percent.min(100),
            message,
        }
    }
}

/// Extracts progress from task output lines.
pub trait ProgressParser: Send + Sync {
    /// Progress carried by `line`, if any.
    fn parse(&self, line: &str) -> Option<ProgressUpdate>;

    /// Whether `line` marks the end of progress output.
    fn is_end(&self, _line: &str) -> bool {
        false
    }
}

/// Convert an `HH:MM:SS.CS` timestamp into milliseconds.
pub fn timestamp_to_ms(timestamp: &str) -> Option<i64> {
    let marker = format!("time={}", timestamp.trim());
    let caps = TIME_MARKER.captures(&marker)?;
    marker_ms(&caps)
}

fn marker_ms(caps: &regex::Captures<'_>) -> Option<i64> {
    let field = |i: usize| caps.get(i)?.as_str().parse::<i64>().ok();
    let (hours, minutes, seconds, centis) = (field(1)?, field(2)?, field(3)?, field(4)?);
    Some(((hours * 60 + minutes) * 60 + seconds) * 1000 + centis * 10)
}

/// `floor(elapsed * 100 / total)` clamped to `0..=100`.
///
/// Returns `None` for a non-positive total.
pub fn percent_of(elapsed_ms: i64, total_ms: i64) -> Option<u8> {
    if total_ms <= 0 {
        return None;
    }
    let raw = (elapsed_ms as i128 * 100).div_euclid(total_ms as i128);
    Some(raw.clamp(0, 100) as u8)
}

/// Encoder progress: `time=HH:MM:SS.CS` markers against a known total duration.
#[derive(Debug, Clone)]
pub struct TimestampProgress {
    total_ms: i64,
    message: Option<String>,
}

impl TimestampProgress {
    pub fn new(total_ms: i64) -> Self {
        Self {
            total_ms,
            message: None,
        }
    }

    /// Build from a duration in seconds.
    pub fn from_secs(total_secs: f64) -> Self {
        Self::new((total_secs * 1000.0).round() as i64)
    }

    /// Message attached to every update.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn total_ms(&self) -> i64 {
        self.total_ms
    }
}

impl ProgressParser for TimestampProgress {
    fn parse(&self, line: &str) -> Option<ProgressUpdate> {
        if self.total_ms <= 0 {
            return None;
        }
        let caps = TIME_MARKER.captures(line)?;
        let elapsed = marker_ms(&caps)?;
        let percent = percent_of(elapsed, self.total_ms)?;
        Some(ProgressUpdate::new(percent, self.message.clone()))
    }

    fn is_end(&self, line: &str) -> bool {
        line.contains(END_MARKER)
    }
}

/// Script-reported progress: `[progress] 40% Rendering scenes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportedProgress;

impl ProgressParser for ReportedProgress {
    fn parse(&self, line: &str) -> Option<ProgressUpdate> {
        let caps = REPORTED_MARKER.captures(line.trim())?;
        let percent = caps.get(1)?.as_str().parse::<u32>().ok()?.min(100) as u8;
        let message = caps.get(2).map(|m| m.as_str().trim().to_string());
        Some(ProgressUpdate::new(percent, message))
    }
}

/// Progress extraction rule attached to a registered task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProgressRule {
    /// Encoder timing markers; the total duration (seconds) is read from the
    /// job payload field `duration_field`.
    Timestamp {
        #[serde(default = "default_duration_field")]
        duration_field: String,
    },
    /// `[progress] N%` lines written by the task itself.
    Reported,
}

fn default_duration_field() -> String {
    "duration".to_string()
}

impl ProgressRule {
    pub fn timestamp() -> Self {
        Self::Timestamp {
            duration_field: default_duration_field(),
        }
    }

    /// Build the parser for one job, or `None` when the job lacks what the
    /// rule needs.
    pub fn parser_for(&self, job: &Job) -> Option<Box<dyn ProgressParser>> {
        match self {
            Self::Timestamp { duration_field } => {
                let total_secs = job.payload.get(duration_field).and_then(|v| {
                    v.as_f64()
                        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                });
                match total_secs {
                    Some(secs) if secs > 0.0 => Some(Box::new(
                        TimestampProgress::from_secs(secs).with_message("Encoding"),
                    )),
                    _ => {
                        warn!(
                            job_id = %job.id,
                            field = %duration_field,
                            "No usable total duration in payload; progress tracking disabled"
                        );
                        None
                    }
                }
            }
            Self::Reported => Some(Box::new(ReportedProgress)),
        }
    }
}

/// Destination for progress updates.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, update: ProgressUpdate);
}

/// Persists progress to the job store.
///
/// With a lock, every write takes the store mutex. Without one, the caller
/// already holds it for the whole job (serial lane).
pub struct StoreProgressSink {
    job_id: String,
    store: Arc<dyn JobStore>,
    lock: Option<Arc<Mutex<()>>>,
}

impl StoreProgressSink {
    pub fn locked(job_id: impl Into<String>, store: Arc<dyn JobStore>, lock: Arc<Mutex<()>>) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            lock: Some(lock),
        }
    }

    pub fn held(job_id: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            lock: None,
        }
    }
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn report(&self, update: ProgressUpdate) {
        let _guard = match &self.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if let Err(e) = self
            .store
            .record_progress(&self.job_id, update.percent, update.message.as_deref())
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to record progress");
        } else {
            debug!(job_id = %self.job_id, percent = update.percent, "Progress recorded");
        }
    }
}

/// A running progress reader fed with output lines.
pub struct ProgressTap {
    tx: Option<mpsc::Sender<String>>,
    reader: JoinHandle<()>,
}

impl ProgressTap {
    /// Spawn the reader task.
    pub fn start(parser: Box<dyn ProgressParser>, sink: Arc<dyn ProgressSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(TAP_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Some(update) = parser.parse(&line) {
                    sink.report(update).await;
                }
                if parser.is_end(&line) {
                    trace!("Progress end marker seen");
                    break;
                }
            }
        });
        Self {
            tx: Some(tx),
            reader,
        }
    }

    /// A handle for feeding lines. Sends fail once the reader has stopped.
    pub fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx.clone()
    }

    /// Close the feed and wait for the reader to drain.
    pub async fn finish(mut self) {
        drop(self.tx.take());
        if let Err(e) = self.reader.await {
            warn!(error = %e, "Progress reader task failed");
        }
    }
}

/// Forward every record of `stream` into `tx`, ignoring a closed receiver.
pub(crate) async fn pump_records<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = OutputRecordReader::new(BufReader::new(stream));
    loop {
        match reader.next_record().await {
            Ok(Some(record)) => {
                let _ = tx.send(record).await;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}

/// Run a known command, scanning its merged stdout and stderr for progress.
///
/// Returns once both the process and the reader have finished.
pub async fn run_with_progress(
    mut command: Command,
    parser: Box<dyn ProgressParser>,
    sink: Arc<dyn ProgressSink>,
) -> Result<ExitStatus> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| Error::Other(format!("Failed to spawn command: {}", e)))?;

    let tap = ProgressTap::start(parser, sink);
    let mut pumps = Vec::new();
    if let (Some(stdout), Some(tx)) = (child.stdout.take(), tap.sender()) {
        pumps.push(tokio::spawn(pump_records(stdout, tx)));
    }
    if let (Some(stderr), Some(tx)) = (child.stderr.take(), tap.sender()) {
        pumps.push(tokio::spawn(pump_records(stderr, tx)));
    }

    let status = child.wait().await;
    for pump in pumps {
        let _ = pump.await;
    }
    tap.finish().await;

    Ok(status?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_timestamps() {
        assert_eq!(timestamp_to_ms("00:00:30.00"), Some(30_000));
        assert_eq!(timestamp_to_ms("01:02:03.45"), Some(3_723_450));
        assert_eq!(timestamp_to_ms("1:02:03"), None);
        assert_eq!(timestamp_to_ms("garbage"), None);
    }

    #[test]
    fn half_way_through_a_minute_is_fifty_percent() {
        let parser = TimestampProgress::from_secs(60.0);
        let update = parser
            .parse("frame=  750 fps=25 q=28.0 size=1024kB time=00:00:30.00 bitrate=279.6kbits/s speed=1x")
            .unwrap();
        assert_eq!(update.percent, 50);
    }

    #[test]
    fn percent_is_floored_and_clamped() {
        assert_eq!(percent_of(29_999, 60_000), Some(49));
        assert_eq!(percent_of(90_000, 60_000), Some(100));
        assert_eq!(percent_of(-5, 60_000), Some(0));
        assert_eq!(percent_of(10, 0), None);
        assert_eq!(percent_of(10, -1), None);
    }

    #[test]
    fn zero_duration_parser_is_a_no_op() {
        let parser = TimestampProgress::new(0);
        assert!(parser.parse("time=00:00:30.00").is_none());
    }

    #[test]
    fn timestamp_parser_detects_end_marker() {
        let parser = TimestampProgress::new(1000);
        assert!(parser.is_end("progress=end"));
        assert!(!parser.is_end("progress=continue"));
        assert!(parser.parse("out_time_ms=1000").is_none());
    }

    #[test]
    fn reported_progress_lines() {
        let parser = ReportedProgress;
        assert_eq!(
            parser.parse("[progress] 40% Rendering scenes"),
            Some(ProgressUpdate::new(40, Some("Rendering scenes".to_string())))
        );
        assert_eq!(parser.parse("[progress] 250"), Some(ProgressUpdate::new(100, None)));
        assert!(parser.parse("progress 40%").is_none());
    }

    #[test]
    fn rule_reads_duration_from_payload() {
        let rule = ProgressRule::timestamp();
        let job = Job::new("j", "Video Compressor", json!({"duration": "120.5"}));
        let parser = rule.parser_for(&job).unwrap();
        assert_eq!(parser.parse("time=00:01:00.00").unwrap().percent, 49);

        let missing = Job::new("j", "Video Compressor", json!({}));
        assert!(rule.parser_for(&missing).is_none());

        let negative = Job::new("j", "Video Compressor", json!({"duration": -3}));
        assert!(rule.parser_for(&negative).is_none());
    }

    #[test]
    fn rule_deserializes_from_registry_json() {
        let rule: ProgressRule = serde_json::from_value(json!({"kind": "timestamp"})).unwrap();
        assert_eq!(rule, ProgressRule::timestamp());
        let rule: ProgressRule =
            serde_json::from_value(json!({"kind": "timestamp", "duration_field": "length"}))
                .unwrap();
        assert_eq!(
            rule,
            ProgressRule::Timestamp {
                duration_field: "length".to_string()
            }
        );
        let rule: ProgressRule = serde_json::from_value(json!({"kind": "reported"})).unwrap();
        assert_eq!(rule, ProgressRule::Reported);
    }

    struct Collect(Mutex<Vec<u8>>);

    #[async_trait]
    impl ProgressSink for Collect {
        async fn report(&self, update: ProgressUpdate) {
            self.0.lock().await.push(update.percent);
        }
    }

    #[tokio::test]
    async fn tap_stops_at_end_marker() {
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let tap = ProgressTap::start(Box::new(TimestampProgress::new(10_000)), sink.clone());
        let tx = tap.sender().unwrap();
        tx.send("time=00:00:01.00".into()).await.unwrap();
        tx.send("progress=end".into()).await.unwrap();
        tap.finish().await;
        // Reader is gone, later lines are dropped.
        assert!(tx.send("time=00:00:09.00".into()).await.is_err());
        assert_eq!(*sink.0.lock().await, vec![10]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merged_output_of_a_command_drives_progress() {
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            "printf 'time=00:00:15.00\\r' 1>&2; echo 'time=00:00:30.00'; \
             printf 'time=00:00:45.00\\n' 1>&2; sleep 0.1; echo 'progress=end'; exit 0",
        );
        let status = run_with_progress(cmd, Box::new(TimestampProgress::from_secs(60.0)), sink.clone())
            .await
            .unwrap();
        assert!(status.success());

        // Arrival order across the two pipes is not fixed.
        let mut seen = sink.0.lock().await.clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![25, 50, 75]);
    }
}
