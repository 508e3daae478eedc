//! Postgres-backed [`JobStore`].
//!
//! Expects the job service's `jobs` table:
//! `id TEXT`, `status TEXT`, `progress TEXT`, `status_message TEXT`,
//! `result JSONB`, `updated_at TIMESTAMPTZ`.
//!
//! Progress is stored as text in the job service's `"<n>% complete"` form.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use super::{ACCEPTED_MESSAGE, COMPLETED_MESSAGE, JobStore};
use crate::domain::JobStatus;
use crate::{Error, Result};

/// Connect to the job store database.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;
    info!(max_connections, "Connected to job store");
    Ok(pool)
}

/// Stored form of a progress percentage.
fn progress_label(percent: u8) -> String {
    format!("{}% complete", percent)
}

/// Job store over a Postgres pool. Each call checks out its own connection.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn expect_row(job_id: &str, rows: u64, to: JobStatus) -> Result<()> {
        if rows == 0 {
            return Err(Error::InvalidStateTransition {
                from: format!("job {} (missing or terminal)", job_id),
                to: to.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn has_pending(&self) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM jobs WHERE status = $1)")
            .bind(JobStatus::Pending.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn mark_processing(&self, job_id: &str) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE jobs SET status = $2, status_message = $3, updated_at = NOW()
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(job_id)
        .bind(JobStatus::Processing.as_str())
        .bind(ACCEPTED_MESSAGE)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Self::expect_row(job_id, rows, JobStatus::Processing)
    }

    async fn record_progress(&self, job_id: &str, percent: u8, message: Option<&str>) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE jobs SET status = $2, progress = $3,
                 status_message = COALESCE($4, status_message), updated_at = NOW()
             WHERE id = $1 AND status IN ('processing', 'progress')",
        )
        .bind(job_id)
        .bind(JobStatus::Progress.as_str())
        .bind(progress_label(percent))
        .bind(message)
        .execute(&self.pool)
        .await?
        .rows_affected();
        debug!(job_id, percent, rows, "Progress write");
        Self::expect_row(job_id, rows, JobStatus::Progress)
    }

    async fn complete(&self, job_id: &str, result: Option<&Value>) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE jobs SET status = $2, result = $3, status_message = $4, updated_at = NOW()
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(job_id)
        .bind(JobStatus::Completed.as_str())
        .bind(result.cloned())
        .bind(COMPLETED_MESSAGE)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Self::expect_row(job_id, rows, JobStatus::Completed)
    }

    async fn fail(&self, job_id: &str, message: &str) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE jobs SET status = $2, status_message = $3, updated_at = NOW()
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(job_id)
        .bind(JobStatus::Failed.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Self::expect_row(job_id, rows, JobStatus::Failed)
    }
}
