//! Notify listener: liveness and new-job signalling over HTTP.

pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
