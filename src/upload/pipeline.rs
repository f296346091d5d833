//! Batched delivery of buffer snapshots

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{plan_batches, BatchSink, UploadBatch, UploadError};
use crate::config::{PageConfig, RecordingConfig};
use crate::data::SequencedEvent;
use crate::ids::PeerId;

/// Result of one flush. Failures are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub failed_batches: usize,
    /// Sequence numbers of delivered events
    pub delivered: Vec<u64>,
}

impl FlushReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_batches == 0
    }
}

/// Splits snapshots into batches and delivers them one after another
///
/// Each batch gets a hard timeout and is independent of the others: a failed
/// batch is logged and skipped, its events stay in the caller's buffer for
/// the next flush.
#[derive(Clone)]
pub struct Uploader {
    sink: Arc<dyn BatchSink>,
    batch_size: usize,
    request_timeout: Duration,
    batch_yield: Duration,
    page: PageConfig,
}

impl Uploader {
    pub fn new(sink: Arc<dyn BatchSink>, recording: &RecordingConfig, page: PageConfig) -> Self {
        Self {
            sink,
            batch_size: recording.batch_size,
            request_timeout: recording.upload_timeout(),
            batch_yield: recording.batch_yield(),
            page,
        }
    }

    pub fn page(&self) -> &PageConfig {
        &self.page
    }

    /// Deliver a snapshot to `endpoint` under `session_id`
    pub async fn flush(
        &self,
        endpoint: &str,
        session_id: &str,
        peer_id: &PeerId,
        snapshot: Vec<SequencedEvent>,
    ) -> FlushReport {
        let event_count = snapshot.len();
        let batches = plan_batches(snapshot, self.batch_size, session_id, peer_id);
        let mut report = FlushReport {
            batches: batches.len(),
            ..FlushReport::default()
        };
        if batches.is_empty() {
            return report;
        }

        debug!(
            "Flushing {} events in {} batches for recording {}",
            event_count,
            batches.len(),
            session_id
        );

        for (index, batch) in batches.iter().enumerate() {
            // Give capture a turn between batches
            if index > 0 {
                tokio::time::sleep(self.batch_yield).await;
            }

            match self.deliver(endpoint, batch).await {
                Ok(()) => report.delivered.extend(batch.seqs()),
                Err(e) => {
                    error!(
                        "Failed to upload batch {}/{} for recording {}: {}",
                        batch.current(),
                        batch.total(),
                        session_id,
                        e
                    );
                    report.failed_batches += 1;
                }
            }
        }

        if report.is_complete() {
            info!(
                "Uploaded {} events for recording {}",
                report.delivered_count(),
                session_id
            );
        } else {
            info!(
                "Uploaded {} of {} events for recording {} ({} batches failed)",
                report.delivered_count(),
                event_count,
                session_id,
                report.failed_batches
            );
        }
        report
    }

    async fn deliver(&self, endpoint: &str, batch: &UploadBatch) -> Result<(), UploadError> {
        let envelope = batch.envelope(&self.page)?;
        tokio::time::timeout(self.request_timeout, self.sink.deliver(endpoint, &envelope))
            .await
            .map_err(|_| UploadError::Timeout(self.request_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::testing::{FakeSink, SinkMode};
    use serde_json::json;

    fn snapshot(n: u64) -> Vec<SequencedEvent> {
        (0..n)
            .map(|seq| SequencedEvent {
                seq,
                event: json!({ "i": seq }),
            })
            .collect()
    }

    fn uploader(sink: Arc<FakeSink>) -> Uploader {
        Uploader::new(sink, &RecordingConfig::default(), PageConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_all_batches_in_order() {
        let sink = Arc::new(FakeSink::new());
        let report = uploader(sink.clone())
            .flush("http://sink", "s1", &PeerId::from("peer-a"), snapshot(250))
            .await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.delivered, (0..250).collect::<Vec<_>>());
        let received = sink.received();
        assert_eq!(received.len(), 3);
        let positions: Vec<(usize, usize)> = received
            .iter()
            .map(|e| (e.batch_info.current, e.batch_info.total))
            .collect();
        assert_eq!(positions, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_sink_delivers_nothing() {
        let sink = Arc::new(FakeSink::with_mode(SinkMode::Fail(500)));
        let report = uploader(sink.clone())
            .flush("http://sink", "s1", &PeerId::from("peer-a"), snapshot(250))
            .await;

        assert_eq!(report.failed_batches, 3);
        assert!(report.delivered.is_empty());
        assert_eq!(sink.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_sink_times_out_per_batch() {
        let sink = Arc::new(FakeSink::with_mode(SinkMode::Hang));
        let started = tokio::time::Instant::now();
        let report = uploader(sink)
            .flush("http://sink", "s1", &PeerId::from("peer-a"), snapshot(150))
            .await;

        assert_eq!(report.failed_batches, 2);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_batch_does_not_block_others() {
        let sink = Arc::new(FakeSink::new());
        sink.fail_batch(2);
        let report = uploader(sink)
            .flush("http://sink", "s1", &PeerId::from("peer-a"), snapshot(250))
            .await;

        assert_eq!(report.failed_batches, 1);
        let expected: Vec<u64> = (0..100).chain(200..250).collect();
        assert_eq!(report.delivered, expected);
    }
}
