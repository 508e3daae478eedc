//! Job owner notifications and operational alerting.
//!
//! Both are side effects of a job reaching a terminal state and are
//! best-effort: the job status is committed first and a delivery failure
//! never changes it.

mod alert;
mod user;

pub use alert::{Alert, AlertChannel, AlertSeverity, NoopAlertChannel, WebhookAlertChannel, WebhookAlertConfig};
pub use user::{JobNotification, NotificationKind, PgUserNotifier, UserNotifier};
