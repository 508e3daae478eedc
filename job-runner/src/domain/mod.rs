//! Domain types shared by the dispatcher components.

pub mod job;

pub use job::{JOB_ID_FIELD, Job, JobStatus, Lane};
