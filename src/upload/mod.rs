//! Batched upload of captured events to the remote collector

mod batch;
mod http;
mod pipeline;

pub use batch::{plan_batches, BatchInfo, UploadBatch, UploadEnvelope};
pub use http::HttpSink;
pub use pipeline::{FlushReport, Uploader};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("batch delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("collector returned HTTP {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Remote destination for upload batches
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Deliver one batch. Any error counts as a failed batch.
    async fn deliver(&self, endpoint: &str, envelope: &UploadEnvelope) -> Result<(), UploadError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SinkMode {
        Accept,
        Fail(u16),
        Hang,
    }

    type Observer = Box<dyn Fn() -> String + Send + Sync>;

    /// In-memory sink recording every accepted envelope
    pub struct FakeSink {
        mode: Mutex<SinkMode>,
        failing_batches: Mutex<HashSet<usize>>,
        received: Mutex<Vec<(String, UploadEnvelope)>>,
        attempts: Mutex<usize>,
        observer: Mutex<Option<Observer>>,
        observed: Mutex<Vec<String>>,
    }

    impl FakeSink {
        pub fn new() -> Self {
            Self::with_mode(SinkMode::Accept)
        }

        pub fn with_mode(mode: SinkMode) -> Self {
            Self {
                mode: Mutex::new(mode),
                failing_batches: Mutex::new(HashSet::new()),
                received: Mutex::new(Vec::new()),
                attempts: Mutex::new(0),
                observer: Mutex::new(None),
                observed: Mutex::new(Vec::new()),
            }
        }

        /// Sample outside state on every delivery attempt
        pub fn observe(&self, observer: impl Fn() -> String + Send + Sync + 'static) {
            *self.observer.lock().unwrap() = Some(Box::new(observer));
        }

        pub fn observed(&self) -> Vec<String> {
            self.observed.lock().unwrap().clone()
        }

        pub fn set_mode(&self, mode: SinkMode) {
            *self.mode.lock().unwrap() = mode;
        }

        /// Reject every batch at this 1-based position
        pub fn fail_batch(&self, current: usize) {
            self.failing_batches.lock().unwrap().insert(current);
        }

        pub fn received(&self) -> Vec<UploadEnvelope> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|(_, envelope)| envelope.clone())
                .collect()
        }

        pub fn endpoints(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|(endpoint, _)| endpoint.clone())
                .collect()
        }

        /// Every event delivered so far, in delivery order
        pub fn delivered_events(&self) -> Vec<serde_json::Value> {
            self.received()
                .iter()
                .flat_map(|envelope| {
                    serde_json::from_str::<Vec<serde_json::Value>>(&envelope.events).unwrap()
                })
                .collect()
        }

        pub fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }
    }

    #[async_trait]
    impl BatchSink for FakeSink {
        async fn deliver(&self, endpoint: &str, envelope: &UploadEnvelope) -> Result<(), UploadError> {
            *self.attempts.lock().unwrap() += 1;
            if let Some(observer) = self.observer.lock().unwrap().as_ref() {
                self.observed.lock().unwrap().push(observer());
            }
            let mode = *self.mode.lock().unwrap();
            match mode {
                SinkMode::Hang => std::future::pending::<()>().await,
                SinkMode::Fail(status) => return Err(UploadError::Status(status)),
                SinkMode::Accept => {}
            }
            if self
                .failing_batches
                .lock()
                .unwrap()
                .contains(&envelope.batch_info.current)
            {
                return Err(UploadError::Status(503));
            }
            self.received
                .lock()
                .unwrap()
                .push((endpoint.to_string(), envelope.clone()));
            Ok(())
        }
    }
}
