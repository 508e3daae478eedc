//! User-facing job notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

use crate::Result;
use crate::domain::Job;

/// Notification flavour shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Warning,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
        }
    }
}

/// A notification addressed to a job's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
}

impl JobNotification {
    /// Success variant, or `None` when the job has no owner.
    pub fn succeeded(job: &Job) -> Option<Self> {
        let user_id = job.user_id.clone()?;
        Some(Self {
            user_id,
            title: "Job successful".to_string(),
            message: format!("The job for '{}' was successful", job.tool),
            kind: NotificationKind::Success,
        })
    }

    /// Failure variant, or `None` when the job has no owner.
    pub fn failed(job: &Job) -> Option<Self> {
        let user_id = job.user_id.clone()?;
        Some(Self {
            user_id,
            title: "Job failed".to_string(),
            message: format!("The job '{}' was unsuccessful", job.tool),
            kind: NotificationKind::Warning,
        })
    }
}

/// Delivers notifications to job owners.
#[async_trait]
pub trait UserNotifier: Send + Sync {
    async fn notify(&self, notification: &JobNotification) -> Result<()>;
}

/// Writes notifications into the store's `notifications` table, where the
/// job service picks them up for delivery.
pub struct PgUserNotifier {
    pool: PgPool,
}

impl PgUserNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserNotifier for PgUserNotifier {
    async fn notify(&self, notification: &JobNotification) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (user_id, title, message, type, created_at)
             VALUES ($1, $2, $3, $4, NOW())",
        )
        .bind(&notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.kind.as_str())
        .execute(&self.pool)
        .await?;
        debug!(user_id = %notification.user_id, title = %notification.title, "User notified");
        Ok(())
    }
}
