//! Task registry: tool identifier → task handler.
//!
//! Built once at startup and immutable afterwards. Looking up an unknown tool
//! yields [`Error::ToolNotFound`], which the job processor turns into a failed
//! job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::progress::{ProgressRule, ProgressSink};
use crate::{Error, Result};

/// Directory (under the tasks root) holding AI tool scripts.
pub const AI_TOOLS_DIR: &str = "ai_tools";
/// Directory (under the tasks root) holding encoding tool scripts.
pub const FFMPEG_TOOLS_DIR: &str = "ffmpeg_tools";

const AI_TOOLS: &[(&str, &str)] = &[
    ("Podcast Summarizer", "podcast_summarizer.py"),
    ("YouTube Video Summarizer", "youtube_video_summarizer.py"),
    ("PDF Summarizer", "pdf_summarizer.py"),
    ("Article Translator", "article_translator.py"),
    ("Audio Summarizer", "audio_summarizer.py"),
    ("Talking Avatar", "talking_avatar.py"),
    ("Script to Video", "script_to_video.py"),
    ("Image to Video", "image_to_video.py"),
    ("Tweet to TikTok", "tweet_to_tiktok.py"),
];

const FFMPEG_TOOLS: &[(&str, &str)] = &[
    ("Audio Extractor", "audio_extractor.py"),
    ("Resize Video", "resize_video.py"),
    ("Video Compressor", "video_compressor.py"),
    ("GIF Creator", "gif_creator.py"),
    ("Video Watermarker", "video_watermarker.py"),
];

/// Debugging task.
pub const TEST_JOB_TOOL: &str = "Test Job";

/// A task run as an isolated external program.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptTask {
    /// Script or executable path.
    pub program: PathBuf,
    /// Launcher prefix, e.g. `["python3", "-u"]`. Empty runs `program` directly.
    pub interpreter: Vec<String>,
    /// How to read progress from the task's output.
    pub progress: Option<ProgressRule>,
}

impl ScriptTask {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            interpreter: Vec::new(),
            progress: None,
        }
    }

    pub fn with_interpreter(mut self, interpreter: Vec<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn with_progress(mut self, rule: ProgressRule) -> Self {
        self.progress = Some(rule);
        self
    }
}

/// A task run in-process, for tools that do not need isolation.
#[async_trait]
pub trait NativeTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run with the job input (payload plus `job_id`). The returned value
    /// becomes the job result.
    async fn run(&self, input: Value, progress: Arc<dyn ProgressSink>) -> Result<Option<Value>>;
}

/// How a tool is executed.
#[derive(Clone)]
pub enum TaskHandler {
    Script(Arc<ScriptTask>),
    Native(Arc<dyn NativeTask>),
}

impl TaskHandler {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Script(task) => task.program.display().to_string(),
            Self::Native(task) => format!("native:{}", task.name()),
        }
    }
}

impl std::fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script(task) => f.debug_tuple("Script").field(task).finish(),
            Self::Native(task) => f.debug_tuple("Native").field(&task.name()).finish(),
        }
    }
}

/// Immutable tool → handler table.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn builder(tasks_dir: impl Into<PathBuf>) -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            tasks_dir: tasks_dir.into(),
            interpreter: Vec::new(),
            tasks: HashMap::new(),
        }
    }

    /// The standard tool set, with scripts laid out under `tasks_dir`.
    pub fn builtin(tasks_dir: impl Into<PathBuf>, interpreter: Vec<String>) -> Self {
        let mut builder = Self::builder(tasks_dir).interpreter(interpreter);
        for (tool, script) in AI_TOOLS {
            builder = builder.script(*tool, Path::new(AI_TOOLS_DIR).join(script), None);
        }
        for (tool, script) in FFMPEG_TOOLS {
            builder = builder.script(
                *tool,
                Path::new(FFMPEG_TOOLS_DIR).join(script),
                Some(ProgressRule::timestamp()),
            );
        }
        builder
            .script(TEST_JOB_TOOL, "test_job.py", Some(ProgressRule::Reported))
            .build()
    }

    /// Load a registry from a JSON file.
    ///
    /// ```json
    /// { "tasks": [ { "tool": "Video Compressor",
    ///                "script": "ffmpeg_tools/video_compressor.py",
    ///                "progress": { "kind": "timestamp" } } ] }
    /// ```
    ///
    /// Entries without an `interpreter` use `default_interpreter`.
    pub fn from_file(
        path: &Path,
        tasks_dir: impl Into<PathBuf>,
        default_interpreter: Vec<String>,
    ) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Cannot read registry file {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw, tasks_dir, default_interpreter)
    }

    pub fn from_json(
        raw: &str,
        tasks_dir: impl Into<PathBuf>,
        default_interpreter: Vec<String>,
    ) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(raw)?;
        let mut builder = Self::builder(tasks_dir).interpreter(default_interpreter);
        for entry in file.tasks {
            if builder.tasks.contains_key(&entry.tool) {
                return Err(Error::config(format!(
                    "Tool registered twice: {}",
                    entry.tool
                )));
            }
            builder = match entry.interpreter {
                Some(interpreter) => {
                    let program = builder.resolve_path(&entry.script);
                    let mut task = ScriptTask::new(program).with_interpreter(interpreter);
                    task.progress = entry.progress;
                    builder.handler(entry.tool, TaskHandler::Script(Arc::new(task)))
                }
                None => builder.script(entry.tool, entry.script, entry.progress),
            };
        }
        Ok(builder.build())
    }

    /// Handler for `tool`.
    pub fn resolve(&self, tool: &str) -> Result<&TaskHandler> {
        self.tasks.get(tool).ok_or_else(|| Error::tool_not_found(tool))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered tools in name order.
    pub fn tools(&self) -> Vec<&str> {
        let mut tools: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        tools.sort_unstable();
        tools
    }

    /// Log every registration.
    pub fn log_registered(&self) {
        for tool in self.tools() {
            if let Some(handler) = self.tasks.get(tool) {
                info!("`{}` task registered ----> `{}`", tool, handler.describe());
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    tasks: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    tool: String,
    script: PathBuf,
    #[serde(default)]
    interpreter: Option<Vec<String>>,
    #[serde(default)]
    progress: Option<ProgressRule>,
}

/// Builder for [`TaskRegistry`].
pub struct TaskRegistryBuilder {
    tasks_dir: PathBuf,
    interpreter: Vec<String>,
    tasks: HashMap<String, TaskHandler>,
}

impl TaskRegistryBuilder {
    /// Interpreter used by scripts registered after this call.
    pub fn interpreter(mut self, interpreter: Vec<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Register an external script. Relative paths resolve against the tasks directory.
    pub fn script(
        self,
        tool: impl Into<String>,
        script: impl AsRef<Path>,
        progress: Option<ProgressRule>,
    ) -> Self {
        let program = self.resolve_path(script.as_ref());
        let mut task = ScriptTask::new(program).with_interpreter(self.interpreter.clone());
        task.progress = progress;
        self.handler(tool, TaskHandler::Script(Arc::new(task)))
    }

    /// Register an in-process task.
    pub fn native(self, tool: impl Into<String>, task: Arc<dyn NativeTask>) -> Self {
        self.handler(tool, TaskHandler::Native(task))
    }

    /// Register any handler, replacing an earlier one for the same tool.
    pub fn handler(mut self, tool: impl Into<String>, handler: TaskHandler) -> Self {
        self.tasks.insert(tool.into(), handler);
        self
    }

    fn resolve_path(&self, script: &Path) -> PathBuf {
        if script.is_absolute() {
            script.to_path_buf()
        } else {
            self.tasks_dir.join(script)
        }
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry { tasks: self.tasks }
    }
}
