//! Access to the external job store.
//!
//! The store is one logical database reached through two paths:
//! - [`JobSource`]: the job service's claim endpoint, which returns a batch and
//!   marks it `processing` in the same call.
//! - [`JobStore`]: direct writes of status, progress and result.

mod gateway;
mod postgres;

pub use gateway::{HttpJobSource, JobSource};
pub use postgres::{PgJobStore, init_pool};

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// Message stored when a job is accepted by a lane.
pub const ACCEPTED_MESSAGE: &str = "Job accepted for processing";
/// Message stored when a job completes.
pub const COMPLETED_MESSAGE: &str = "Job completed successfully";

/// Mutation and lookup interface of the job store.
///
/// Writes never move a job backwards; an implementation ignores or rejects
/// writes to jobs already in a terminal state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Whether any job is waiting in `pending`.
    async fn has_pending(&self) -> Result<bool>;

    /// Persist `processing` for a job accepted by a lane.
    async fn mark_processing(&self, job_id: &str) -> Result<()>;

    /// Persist a progress observation and move the job to `progress`.
    async fn record_progress(&self, job_id: &str, percent: u8, message: Option<&str>) -> Result<()>;

    /// Persist `completed` with the task result (`None` stores null).
    async fn complete(&self, job_id: &str, result: Option<&Value>) -> Result<()>;

    /// Persist `failed` with the failure text.
    async fn fail(&self, job_id: &str, message: &str) -> Result<()>;
}
