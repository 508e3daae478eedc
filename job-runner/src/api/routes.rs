//! Listener routes.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::server::AppState;
use crate::dispatcher::NotifyOutcome;

pub const ACTIVE_MESSAGE: &str = "Job server is active";
pub const ACCEPTED_MESSAGE: &str = "Job notification received, processing jobs";
pub const QUEUED_MESSAGE: &str = "Jobs already running. Job queued";

/// Body of every listener response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: &str) -> Json<Self> {
        Json(Self {
            message: message.to_string(),
        })
    }
}

/// Body of the liveness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub message: String,
    pub uptime_secs: u64,
}

/// Create the listener router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/notify-job", get(notify_job))
        .with_state(state)
}

async fn liveness(State(state): State<AppState>) -> (StatusCode, Json<LivenessResponse>) {
    (
        StatusCode::OK,
        Json(LivenessResponse {
            message: ACTIVE_MESSAGE.to_string(),
            uptime_secs: state.start_time.elapsed().as_secs(),
        }),
    )
}

/// 200 with the wake signal set, or 202 while a cycle is in flight.
async fn notify_job(State(state): State<AppState>) -> (StatusCode, Json<MessageResponse>) {
    match state.dispatcher.try_notify() {
        NotifyOutcome::Accepted => (StatusCode::OK, MessageResponse::new(ACCEPTED_MESSAGE)),
        NotifyOutcome::Busy => (StatusCode::ACCEPTED, MessageResponse::new(QUEUED_MESSAGE)),
    }
}
