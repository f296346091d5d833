//! HTTP collector sink

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{BatchSink, UploadEnvelope, UploadError};

/// Body of `POST {sink}/{recordId}/end`
#[derive(Debug, Serialize)]
struct FinishRequest<'a> {
    description: &'a str,
}

/// Delivers batches to `{endpoint}/{recordId}/upload`
#[derive(Clone)]
pub struct HttpSink {
    client: Client,
    request_timeout: Duration,
}

impl HttpSink {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            request_timeout,
        }
    }

    /// Finalize a recording's metadata once it has stopped
    pub async fn finish_session(
        &self,
        endpoint: &str,
        record_id: &str,
        description: &str,
    ) -> Result<serde_json::Value, UploadError> {
        let url = session_url(endpoint, record_id, "end");
        info!("Finalizing recording {}", record_id);

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&FinishRequest { description })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl BatchSink for HttpSink {
    async fn deliver(&self, endpoint: &str, envelope: &UploadEnvelope) -> Result<(), UploadError> {
        let url = session_url(endpoint, &envelope.record_id, "upload");

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }

        debug!(
            "Delivered batch {}/{} for recording {}",
            envelope.batch_info.current, envelope.batch_info.total, envelope.record_id
        );
        Ok(())
    }
}

fn session_url(endpoint: &str, record_id: &str, action: &str) -> String {
    format!("{}/{}/{}", endpoint.trim_end_matches('/'), record_id, action)
}
