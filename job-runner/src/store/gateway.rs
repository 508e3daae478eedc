//! Job Source Gateway client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::domain::{Job, Lane};
use crate::{Error, Result};

/// Claims batches of jobs for a lane.
///
/// Every returned job has already been marked `processing` by the store.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_batch(&self, lane: Lane) -> Result<Vec<Job>>;
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    data: Vec<Job>,
}

/// [`JobSource`] backed by the job service HTTP API.
pub struct HttpJobSource {
    client: Client,
    base_url: String,
}

impl HttpJobSource {
    /// `base_url` is the job service API root, e.g. `https://api.example.com/api/v1`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn batch_url(&self, lane: Lane) -> String {
        format!(
            "{}/jobs/retrieve-and-mark-as-processing?is_parallel={}",
            self.base_url,
            lane.is_parallel()
        )
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn fetch_batch(&self, lane: Lane) -> Result<Vec<Job>> {
        let url = self.batch_url(lane);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Gateway(format!("{} - {} - {}", status, body, url)));
        }

        let batch: BatchResponse = response.json().await?;
        debug!(%lane, count = batch.data.len(), "Fetched job batch");
        Ok(batch.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_url_encodes_lane() {
        let source = HttpJobSource::with_client(Client::new(), "http://jobs.local/api/v1/");
        assert_eq!(
            source.batch_url(Lane::Parallel),
            "http://jobs.local/api/v1/jobs/retrieve-and-mark-as-processing?is_parallel=true"
        );
        assert_eq!(
            source.batch_url(Lane::Serial),
            "http://jobs.local/api/v1/jobs/retrieve-and-mark-as-processing?is_parallel=false"
        );
    }

    #[test]
    fn batch_response_parses_data_envelope() {
        let batch: BatchResponse = serde_json::from_str(
            r#"{"status":"success","data":[{"id":"a","tool_name":"Test Job","payload":{}}]}"#,
        )
        .unwrap();
        assert_eq!(batch.data.len(), 1);
        assert_eq!(batch.data[0].tool, "Test Job");

        let empty: BatchResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(empty.data.is_empty());
    }
}
