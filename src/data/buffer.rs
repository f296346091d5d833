//! Bounded event buffer

use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Opaque captured event record
pub type RecordedEvent = Value;

/// A buffered event tagged with its per-peer sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: RecordedEvent,
}

/// Ordered, capacity-bounded event buffer owned by one peer
///
/// When a push takes the length past `max_events`, only the newest
/// `floor(0.8 * max_events)` events are kept. Sequence numbers let an upload
/// acknowledge exactly the events it delivered, even if capture appended or
/// evicted while the upload was in flight.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<SequencedEvent>,
    max_events: usize,
    next_seq: u64,
}

impl EventBuffer {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_events: max_events.max(1),
            next_seq: 0,
        }
    }

    /// Append an event, evicting the oldest on overflow
    pub fn push(&mut self, event: RecordedEvent) {
        self.events.push_back(SequencedEvent {
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;

        if self.events.len() > self.max_events {
            let keep = self.retained_after_overflow();
            let evict = self.events.len() - keep;
            self.events.drain(..evict);
        }
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = RecordedEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Number of events kept after an overflow
    pub fn retained_after_overflow(&self) -> usize {
        self.max_events * 4 / 5
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Immutable copy of the buffer for uploading
    pub fn snapshot(&self) -> Vec<SequencedEvent> {
        self.events.iter().cloned().collect()
    }

    /// Copy of the bare event records
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.iter().map(|e| e.event.clone()).collect()
    }

    /// Drop delivered events; unknown sequence numbers are ignored
    pub fn acknowledge(&mut self, delivered: &[u64]) -> usize {
        if delivered.is_empty() {
            return 0;
        }
        let delivered: HashSet<u64> = delivered.iter().copied().collect();
        let before = self.events.len();
        self.events.retain(|e| !delivered.contains(&e.seq));
        before - self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Take all events out, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<RecordedEvent> {
        self.events.drain(..).map(|e| e.event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn indices(buffer: &EventBuffer) -> Vec<u64> {
        buffer
            .events()
            .iter()
            .map(|e| e["i"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_overflow_keeps_newest_eighty_percent_in_order() {
        let mut buffer = EventBuffer::new(10);
        for i in 0..11 {
            buffer.push(json!({ "i": i }));
        }
        assert_eq!(buffer.len(), 8);
        assert_eq!(indices(&buffer), vec![3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_length_never_exceeds_cap() {
        let mut buffer = EventBuffer::new(100);
        for i in 0..1_000u64 {
            buffer.push(json!({ "i": i }));
            assert!(buffer.len() <= 100);
        }
        let kept = indices(&buffer);
        assert!(kept.windows(2).all(|w| w[0] + 1 == w[1]));
        assert_eq!(*kept.last().unwrap(), 999);
    }

    #[test]
    fn test_acknowledge_only_removes_delivered() {
        let mut buffer = EventBuffer::new(100);
        buffer.extend((0..5).map(|i| json!({ "i": i })));
        let snapshot = buffer.snapshot();
        buffer.push(json!({ "i": 5 }));

        let delivered: Vec<u64> = snapshot[..3].iter().map(|e| e.seq).collect();
        assert_eq!(buffer.acknowledge(&delivered), 3);
        assert_eq!(indices(&buffer), vec![3, 4, 5]);

        // Re-acknowledging is a no-op
        assert_eq!(buffer.acknowledge(&delivered), 0);
    }

    #[test]
    fn test_acknowledge_after_eviction() {
        let mut buffer = EventBuffer::new(5);
        buffer.extend((0..5).map(|i| json!({ "i": i })));
        let delivered: Vec<u64> = buffer.snapshot().iter().map(|e| e.seq).collect();
        // Overflow evicts 0..=1 while the upload is in flight
        buffer.push(json!({ "i": 5 }));
        assert_eq!(buffer.acknowledge(&delivered), 3);
        assert_eq!(indices(&buffer), vec![5]);
    }

    #[test]
    fn test_drain_empties() {
        let mut buffer = EventBuffer::new(10);
        buffer.push(json!(1));
        buffer.push(json!(2));
        assert_eq!(buffer.drain(), vec![json!(1), json!(2)]);
        assert!(buffer.is_empty());
    }
}
