//! Background job dispatcher.
//!
//! Drains a remote job queue in dispatch cycles, runs each job's task as an
//! isolated program on a parallel or serial lane, tracks progress and reports
//! outcomes to the job owner and an alerting channel.

pub mod api;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod lanes;
pub mod logging;
pub mod notification;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod store;

pub use error::{Error, Result};
