//! Job records as seen by the dispatcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Field injected into every task payload.
pub const JOB_ID_FIELD: &str = "job_id";

/// Job status.
///
/// Statuses only move forward: `pending → processing → progress → completed | failed`.
/// `progress` may repeat; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created by the job store, not yet claimed.
    Pending,
    /// Claimed by a dispatch cycle.
    Processing,
    /// Task running, progress reported at least once.
    Progress,
    /// Task finished successfully.
    Completed,
    /// Task failed.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is reachable from `self` without moving backwards.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next >= *self
    }

    /// Validate a transition, returning the new status.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "progress" | "in_progress" => Ok(Self::Progress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Other(format!("Unknown job status: {}", other))),
        }
    }
}

/// Concurrency lane a job was claimed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Bounded worker pool.
    Parallel,
    /// One job at a time under the serial mutex.
    Serial,
}

impl Lane {
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Parallel)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Parallel => write!(f, "parallel"),
            Lane::Serial => write!(f, "serial"),
        }
    }
}

/// A unit of requested work, owned by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Tool identifier used to look up the task.
    #[serde(alias = "tool_name")]
    pub tool: String,
    /// Opaque task input.
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    /// Last reported completion percentage.
    #[serde(default, deserialize_with = "deserialize_percent")]
    pub progress: Option<u8>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub expiration_time: Option<DateTime<Utc>>,
}

fn default_status() -> JobStatus {
    JobStatus::Pending
}

impl Job {
    /// Create a pending job. Mostly useful for callers building jobs by hand.
    pub fn new(id: impl Into<String>, tool: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            payload,
            status: JobStatus::Pending,
            progress: None,
            status_message: None,
            result: None,
            is_premium: false,
            user_id: None,
            expiration_time: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Whether the job's expiration time lies before `now`. Jobs without one
    /// never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|expires| expires < now)
    }

    /// The payload object with the job id injected, as passed to a task.
    ///
    /// A `null` payload becomes an object holding only the id; any other
    /// non-object payload is rejected.
    pub fn task_input(&self) -> Result<Value> {
        let mut object = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(Error::Other(format!(
                    "Payload for job {} must be a JSON object, got {}",
                    self.id,
                    json_kind(other)
                )));
            }
        };
        object.insert(JOB_ID_FIELD.to_string(), Value::String(self.id.clone()));
        Ok(Value::Object(object))
    }

    /// [`Job::task_input`] encoded as the single argument of a task program.
    pub fn script_argument(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.task_input()?)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Accepts `40`, `40.0`, `"40"` or `"40% complete"`.
fn deserialize_percent<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_f64().map(|f| f.clamp(0.0, 100.0) as u8),
        Value::String(s) => s
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|digits| digits.parse::<u32>().ok())
            .map(|n| n.min(100) as u8),
        _ => None,
    }))
}

/// Accepts RFC 3339 timestamps and naive `YYYY-MM-DDTHH:MM:SS[.f]` values (read as UTC).
fn deserialize_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }))
}
