//! Splitting buffer snapshots into upload batches

use serde::{Deserialize, Serialize};

use crate::config::PageConfig;
use crate::data::SequencedEvent;
use crate::ids::{now_millis, PeerId};

/// Contiguous, immutable slice of a snapshot delivered as one request
#[derive(Debug, Clone)]
pub struct UploadBatch {
    events: Vec<SequencedEvent>,
    current: usize,
    total: usize,
    session_id: String,
    peer_id: PeerId,
}

impl UploadBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 1-based position within its flush
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Sequence numbers of the events in this batch
    pub fn seqs(&self) -> Vec<u64> {
        self.events.iter().map(|e| e.seq).collect()
    }

    /// Build the request body. The event array travels as a JSON string.
    pub fn envelope(&self, page: &PageConfig) -> Result<UploadEnvelope, serde_json::Error> {
        let events: Vec<&serde_json::Value> = self.events.iter().map(|e| &e.event).collect();
        Ok(UploadEnvelope {
            events: serde_json::to_string(&events)?,
            timestamp: now_millis(),
            url: page.url.clone(),
            record_id: self.session_id.clone(),
            batch_info: BatchInfo {
                current: self.current,
                total: self.total,
            },
            ua_info: page.user_agent.clone(),
            page_id: self.peer_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub current: usize,
    pub total: usize,
}

/// JSON body of `POST {sink}/{recordId}/upload`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEnvelope {
    pub events: String,
    pub timestamp: u64,
    pub url: String,
    pub record_id: String,
    pub batch_info: BatchInfo,
    pub ua_info: String,
    /// Peer that captured the batch
    pub page_id: String,
}

/// Split a snapshot into ordered batches of at most `batch_size` events
pub fn plan_batches(
    snapshot: Vec<SequencedEvent>,
    batch_size: usize,
    session_id: &str,
    peer_id: &PeerId,
) -> Vec<UploadBatch> {
    let batch_size = batch_size.max(1);
    let total = snapshot.len().div_ceil(batch_size);

    let mut batches = Vec::with_capacity(total);
    let mut events = snapshot.into_iter().peekable();
    while events.peek().is_some() {
        let chunk: Vec<SequencedEvent> = events.by_ref().take(batch_size).collect();
        batches.push(UploadBatch {
            events: chunk,
            current: batches.len() + 1,
            total,
            session_id: session_id.to_string(),
            peer_id: peer_id.clone(),
        });
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(n: u64) -> Vec<SequencedEvent> {
        (0..n)
            .map(|seq| SequencedEvent {
                seq,
                event: json!({ "i": seq }),
            })
            .collect()
    }

    #[test]
    fn test_batch_numbering() {
        let peer = PeerId::from("peer-a");
        for n in [1u64, 99, 100, 101, 250, 1000] {
            let batches = plan_batches(snapshot(n), 100, "s1", &peer);
            assert_eq!(batches.len() as u64, n.div_ceil(100), "n = {}", n);
            for (i, batch) in batches.iter().enumerate() {
                assert_eq!(batch.current(), i + 1);
                assert_eq!(batch.total(), batches.len());
                assert!(batch.len() <= 100);
            }
            let seqs: Vec<u64> = batches.iter().flat_map(|b| b.seqs()).collect();
            assert_eq!(seqs, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_empty_snapshot_has_no_batches() {
        assert!(plan_batches(Vec::new(), 100, "s1", &PeerId::from("p")).is_empty());
    }

    #[test]
    fn test_envelope_wire_format() {
        let page = PageConfig {
            url: "https://app.example/cart".to_string(),
            user_agent: "agent/1".to_string(),
        };
        let batches = plan_batches(snapshot(3), 2, "s1", &PeerId::from("peer-a"));
        let envelope = batches[1].envelope(&page).unwrap();
        let body = serde_json::to_value(&envelope).unwrap();

        assert_eq!(body["recordId"], "s1");
        assert_eq!(body["url"], "https://app.example/cart");
        assert_eq!(body["uaInfo"], "agent/1");
        assert_eq!(body["batchInfo"], json!({ "current": 2, "total": 2 }));
        let events: Vec<serde_json::Value> =
            serde_json::from_str(body["events"].as_str().unwrap()).unwrap();
        assert_eq!(events, vec![json!({ "i": 2 })]);
    }
}
