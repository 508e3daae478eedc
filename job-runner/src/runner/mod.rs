//! Execution of task programs.

mod process;

pub use process::{
    NO_OUTPUT_MESSAGE, ProcessRunner, ProcessRunnerConfig, ProgressHook, RunOutput,
    TASK_OUTPUT_TARGET,
};
