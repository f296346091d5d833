//! Recording session state machine
//!
//! `Idle -> Active -> Stopping -> Stopped`, where `Stopped` behaves like
//! `Idle`. The session owns the peer's event buffer and its timers; every
//! path out of `Active` goes through [`RecordingSession::stop`] or
//! [`RecordingSession::force_cleanup`], both of which cancel all timers.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Scheduler, SessionTimer};
use crate::config::RecordingConfig;
use crate::data::{network_event, EventBuffer, NetworkRecord, RecordedEvent};
use crate::ids::{generate_record_id, PeerId};
use crate::registry::{Registry, RegistryKey};
use crate::upload::{FlushReport, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Active,
    Stopping,
    Stopped,
}

/// Why a session left the Active state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A human pressed stop on this peer
    User,
    /// The maximum recording duration elapsed
    MaxDuration,
    /// Another peer announced the stop
    Remote,
    /// This peer went to the background
    Hidden,
    /// This peer is being torn down
    Unload,
}

impl StopReason {
    /// Whether the recording ends for every peer (persisted keys are removed)
    pub fn ends_session(self) -> bool {
        matches!(self, StopReason::User | StopReason::MaxDuration)
    }
}

/// What a stop did, for the UI collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    pub record_id: Option<String>,
    pub reason: StopReason,
    /// Whether this peer shows the page the recording started on
    pub is_origin_page: bool,
    /// The final flush
    pub flush: FlushReport,
    /// Events dropped because the final flush could not deliver them
    pub discarded: usize,
}

impl StopOutcome {
    fn noop(reason: StopReason) -> Self {
        Self {
            record_id: None,
            reason,
            is_origin_page: false,
            flush: FlushReport::default(),
            discarded: 0,
        }
    }

    /// Only a stop a human asked for, on this peer, gets a completion prompt
    pub fn should_prompt(&self) -> bool {
        self.reason == StopReason::User && self.record_id.is_some()
    }
}

/// One peer's share of a recording
pub struct RecordingSession {
    /// Owning peer, stamped on every upload
    peer_id: PeerId,
    /// Where the recording id and start time persist
    registry: Registry,
    /// Delivers buffered events to the collector
    uploader: Uploader,
    /// Hard cap on a recording, measured from its persisted start
    max_duration: Duration,
    /// Period between background flushes
    upload_interval: Duration,
    /// Current lifecycle state
    status: SessionStatus,
    /// Recording id, shared by every peer in the recording
    record_id: Option<String>,
    /// When the recording started, on any peer
    started_at: Option<DateTime<Utc>>,
    /// Set when the recording was minted on this peer
    origin_peer: Option<PeerId>,
    /// Collector endpoint; no sink means events stay local
    sink: Option<String>,
    /// Captured events awaiting delivery
    buffer: EventBuffer,
    /// Deadline, upload interval and the in-flight flush
    scheduler: Scheduler,
}

impl RecordingSession {
    pub fn new(peer_id: PeerId, registry: Registry, uploader: Uploader, settings: &RecordingConfig) -> Self {
        Self {
            peer_id,
            registry,
            uploader,
            max_duration: settings.max_duration(),
            upload_interval: settings.upload_interval(),
            status: SessionStatus::Idle,
            record_id: None,
            started_at: None,
            origin_peer: None,
            sink: None,
            buffer: EventBuffer::new(settings.max_events),
            scheduler: Scheduler::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_recording(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Peer that minted the current recording, when it was this one
    pub fn origin_peer(&self) -> Option<&PeerId> {
        self.origin_peer.as_ref()
    }

    pub fn sink(&self) -> Option<&str> {
        self.sink.as_deref()
    }

    pub fn set_sink(&mut self, sink: Option<String>) {
        if sink.is_some() {
            self.sink = sink;
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attach to a recording another peer created, without touching the registry
    pub fn adopt_session_id(&mut self, record_id: impl Into<String>) {
        self.record_id = Some(record_id.into());
    }

    /// Begin capturing under whatever recording id is currently attached
    pub fn start_recording(&mut self, sink: Option<String>) {
        if !self.is_recording() {
            self.buffer.clear();
        }
        self.set_sink(sink);
        self.status = SessionStatus::Active;

        self.scheduler.cancel_upload();
        if self.sink.is_some() {
            self.scheduler.arm_upload(self.upload_interval);
        }

        info!(
            "Recording started: record_id={}, sink={}",
            self.record_id.as_deref().unwrap_or("<none>"),
            self.sink.as_deref().unwrap_or("<none>")
        );
    }

    /// Resume the persisted recording if there is one, else mint a new one;
    /// then arm the duration timer and start capturing
    pub fn start_recording_with_id(&mut self, sink: Option<String>) -> String {
        let now = Utc::now();
        let (record_id, started_at) = match self.registry.session_id() {
            Some(existing) => {
                info!("Resuming recording {}", existing);
                if self.registry.origin_page().is_none() {
                    self.registry
                        .set(RegistryKey::OriginPage, &self.uploader.page().url);
                }
                let started_at = match self.registry.session_started_at() {
                    Some(started_at) => started_at,
                    None => {
                        self.write_start_time(now);
                        now
                    }
                };
                (existing, started_at)
            }
            None => {
                let record_id = match (&self.record_id, self.is_recording()) {
                    // Degraded storage: keep the recording already running here
                    (Some(current), true) => current.clone(),
                    _ => generate_record_id(),
                };
                info!("Creating recording {}", record_id);
                self.registry.set(RegistryKey::SessionId, &record_id);
                self.registry
                    .set(RegistryKey::OriginPage, &self.uploader.page().url);
                self.write_start_time(now);
                self.origin_peer = Some(self.peer_id.clone());
                (record_id, now)
            }
        };

        self.record_id = Some(record_id.clone());
        self.started_at = Some(started_at);

        let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
        let remaining = self.max_duration.saturating_sub(elapsed);
        debug!("Recording {} auto-stops in {:?}", record_id, remaining);
        self.scheduler.arm_deadline(remaining);

        self.start_recording(sink);
        record_id
    }

    fn write_start_time(&self, at: DateTime<Utc>) {
        self.registry.set(
            RegistryKey::SessionStartTime,
            &at.timestamp_millis().to_string(),
        );
    }

    /// Buffer a captured event. Dropped unless recording.
    pub fn emit(&mut self, event: RecordedEvent) -> bool {
        if !self.is_recording() {
            debug!("Dropping event captured while not recording");
            return false;
        }
        self.buffer.push(event);
        true
    }

    /// Buffer an intercepted network call. No-op unless recording.
    pub fn push_network_event(&mut self, record: &NetworkRecord) -> bool {
        if !self.is_recording() {
            return false;
        }
        let page = self.uploader.page();
        match network_event(record, &page.url, &page.user_agent) {
            Some(event) => {
                self.buffer.push(event);
                true
            }
            None => false,
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.buffer.events()
    }

    pub fn clear_events(&mut self) {
        self.buffer.clear();
    }

    /// Hand every buffered event to the caller
    pub fn take_events(&mut self) -> Vec<RecordedEvent> {
        self.buffer.drain()
    }

    /// Take in events another peer handed over. Dropped unless recording.
    pub fn absorb_events(&mut self, events: Vec<RecordedEvent>) -> usize {
        if !self.is_recording() {
            return 0;
        }
        let count = events.len();
        self.buffer.extend(events);
        count
    }

    /// Wait for the next session timer
    pub async fn next_timer(&mut self) -> SessionTimer {
        self.scheduler.next().await
    }

    /// Start a background flush of the current buffer contents
    ///
    /// Events stay buffered until [`finish_flush`](Self::finish_flush)
    /// acknowledges what was delivered.
    pub fn begin_periodic_flush(&mut self) -> bool {
        if !self.is_recording() || self.buffer.is_empty() || self.scheduler.flush_in_flight() {
            return false;
        }
        let (Some(sink), Some(record_id)) = (self.sink.clone(), self.record_id.clone()) else {
            return false;
        };

        let snapshot = self.buffer.snapshot();
        let uploader = self.uploader.clone();
        let peer_id = self.peer_id.clone();
        let handle = tokio::spawn(async move {
            uploader.flush(&sink, &record_id, &peer_id, snapshot).await
        });
        self.scheduler.track_flush(handle);
        true
    }

    pub fn finish_flush(&mut self, report: &FlushReport) {
        let removed = self.buffer.acknowledge(&report.delivered);
        if report.failed_batches > 0 {
            warn!(
                "{} upload batches failed, {} events kept for the next attempt",
                report.failed_batches,
                self.buffer.len()
            );
        } else {
            debug!("Periodic flush delivered {} events", removed);
        }
    }

    /// Leave the Active state: cancel timers, flush, clear local state
    ///
    /// Persisted session keys are removed only when `reason` ends the
    /// recording for every peer. Stopping a session that is not Active is a
    /// no-op.
    pub async fn stop(&mut self, reason: StopReason) -> StopOutcome {
        if !self.is_recording() {
            return StopOutcome::noop(reason);
        }

        info!("Stopping recording ({:?})", reason);
        self.status = SessionStatus::Stopping;
        self.scheduler.cancel_all();

        let snapshot = self.buffer.snapshot();
        let flush = match (&self.sink, &self.record_id) {
            (Some(sink), Some(record_id)) if !snapshot.is_empty() => {
                self.uploader
                    .flush(sink, record_id, &self.peer_id, snapshot)
                    .await
            }
            _ => FlushReport::default(),
        };
        self.buffer.acknowledge(&flush.delivered);
        let discarded = self.buffer.len();
        if discarded > 0 {
            warn!("Discarding {} events that could not be delivered", discarded);
        }

        let is_origin_page = match self.registry.origin_page() {
            Some(origin) => origin == self.uploader.page().url,
            None => true,
        };

        self.buffer.clear();
        self.status = SessionStatus::Stopped;
        if reason.ends_session() {
            self.registry.clear_session();
        }

        let record_id = self.record_id.take();
        self.started_at = None;
        self.origin_peer = None;
        self.sink = None;

        info!(
            "Recording stopped: record_id={}, reason={:?}",
            record_id.as_deref().unwrap_or("<none>"),
            reason
        );

        StopOutcome {
            record_id,
            reason,
            is_origin_page,
            flush,
            discarded,
        }
    }

    /// Reset every in-memory field without touching the registry
    pub fn force_cleanup(&mut self) {
        self.scheduler.cancel_all();
        self.buffer.clear();
        self.status = SessionStatus::Idle;
        self.record_id = None;
        self.started_at = None;
        self.origin_peer = None;
        self.sink = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageConfig;
    use crate::registry::MemoryRegistryHub;
    use crate::upload::testing::{FakeSink, SinkMode};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    const SINK: &str = "http://collector.test/record";

    struct Fixture {
        hub: MemoryRegistryHub,
        sink: Arc<FakeSink>,
        session: RecordingSession,
    }

    fn fixture() -> Fixture {
        let hub = MemoryRegistryHub::new();
        let sink = Arc::new(FakeSink::new());
        let session = session_on(&hub, sink.clone(), "https://app.example/start");
        Fixture { hub, sink, session }
    }

    fn session_on(hub: &MemoryRegistryHub, sink: Arc<FakeSink>, url: &str) -> RecordingSession {
        let registry = Registry::new(Arc::new(hub.connect()));
        let page = PageConfig {
            url: url.to_string(),
            user_agent: "agent/1".to_string(),
        };
        let settings = RecordingConfig::default();
        let uploader = Uploader::new(sink, &settings, page);
        RecordingSession::new(PeerId::from("peer-a"), registry, uploader, &settings)
    }

    async fn next_flush(session: &mut RecordingSession) -> FlushReport {
        loop {
            if let SessionTimer::FlushFinished(report) = session.next_timer().await {
                return report;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_recording_is_minted_and_persisted() {
        let mut f = fixture();
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let id = f.session.start_recording_with_id(Some(SINK.into()));
            assert!(!id.is_empty());
            assert!(seen.insert(id.clone()), "record id reused: {}", id);
            assert_eq!(f.hub.snapshot()["recordId"], id);
            assert_eq!(f.hub.snapshot()["recording-original-page"], "https://app.example/start");
            assert_eq!(f.session.origin_peer(), Some(&PeerId::from("peer-a")));
            f.session.stop(StopReason::User).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_recording_is_reused() {
        let mut f = fixture();
        let writer = f.hub.connect();
        use crate::registry::RegistryBackend;
        writer.set("recordId", "s1").unwrap();
        writer.set("recording-original-page", "https://app.example/other").unwrap();

        let id = f.session.start_recording_with_id(None);
        assert_eq!(id, "s1");
        assert_eq!(f.session.record_id(), Some("s1"));
        assert!(f.session.origin_peer().is_none());
        // Origin marker is left alone on resume
        assert_eq!(
            f.hub.snapshot()["recording-original-page"],
            "https://app.example/other"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_events_only_while_recording() {
        let mut f = fixture();
        let record = NetworkRecord {
            method: "GET".into(),
            url: "https://api.example/items".into(),
            ..Default::default()
        };

        assert!(!f.session.push_network_event(&record));
        assert_eq!(f.session.buffered(), 0);

        f.session.start_recording_with_id(None);
        assert!(f.session.push_network_event(&record));
        assert_eq!(f.session.buffered(), 1);

        f.session.stop(StopReason::User).await;
        assert!(!f.session.push_network_event(&record));
        assert!(!f.session.emit(json!({ "late": true })));
        assert_eq!(f.session.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_clears_and_cancels_timers() {
        let mut f = fixture();
        f.session.start_recording_with_id(Some(SINK.into()));
        for i in 0..5 {
            f.session.emit(json!({ "i": i }));
        }
        assert!(f.session.scheduler().has_deadline());
        assert!(f.session.scheduler().has_upload());

        let outcome = f.session.stop(StopReason::User).await;
        assert_eq!(outcome.flush.delivered_count(), 5);
        assert!(outcome.is_origin_page);
        assert!(outcome.should_prompt());
        assert_eq!(f.session.status(), SessionStatus::Stopped);
        assert_eq!(f.session.buffered(), 0);
        assert!(f.session.scheduler().is_idle());
        assert!(f.hub.snapshot().is_empty());

        let fired = tokio::time::timeout(Duration::from_secs(3600), f.session.next_timer()).await;
        assert!(fired.is_err(), "a timer fired after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_stop_keeps_persisted_session() {
        let mut f = fixture();
        let id = f.session.start_recording_with_id(Some(SINK.into()));
        let outcome = f.session.stop(StopReason::Hidden).await;

        assert_eq!(outcome.record_id.as_deref(), Some(id.as_str()));
        assert!(!outcome.should_prompt());
        assert!(f.session.record_id().is_none());
        assert_eq!(f.hub.snapshot()["recordId"], id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_other_page_is_not_origin() {
        let hub = MemoryRegistryHub::new();
        let sink = Arc::new(FakeSink::new());
        let mut origin = session_on(&hub, sink.clone(), "https://app.example/start");
        let mut other = session_on(&hub, sink, "https://app.example/checkout");

        origin.start_recording_with_id(None);
        origin.stop(StopReason::Hidden).await;
        other.start_recording_with_id(None);
        let outcome = other.stop(StopReason::User).await;
        assert!(!outcome.is_origin_page);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_keeps_every_event_until_next_attempt() {
        let mut f = fixture();
        f.session.start_recording_with_id(Some(SINK.into()));
        for i in 0..250 {
            f.session.emit(json!({ "i": i }));
        }

        f.sink.set_mode(SinkMode::Fail(500));
        assert!(f.session.begin_periodic_flush());
        let report = next_flush(&mut f.session).await;
        f.session.finish_flush(&report);
        assert_eq!(report.failed_batches, 3);
        assert_eq!(f.session.buffered(), 250);

        f.sink.set_mode(SinkMode::Accept);
        assert!(f.session.begin_periodic_flush());
        let report = next_flush(&mut f.session).await;
        f.session.finish_flush(&report);
        assert_eq!(f.session.buffered(), 0);

        let received = f.sink.received();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|e| e.batch_info.total == 3));
        let delivered = f.sink.delivered_events();
        assert_eq!(delivered.len(), 250);
        assert_eq!(delivered[249], json!({ "i": 249 }));
        assert!(f.sink.endpoints().iter().all(|e| e == SINK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_captured_during_flush_survive() {
        let mut f = fixture();
        f.session.start_recording_with_id(Some(SINK.into()));
        f.session.emit(json!({ "i": 0 }));
        assert!(f.session.begin_periodic_flush());
        // Only one periodic flush at a time
        assert!(!f.session.begin_periodic_flush());
        f.session.emit(json!({ "i": 1 }));

        let report = next_flush(&mut f.session).await;
        f.session.finish_flush(&report);
        assert_eq!(f.session.events(), vec![json!({ "i": 1 })]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_fires() {
        let mut f = fixture();
        f.session.start_recording_with_id(None);
        let started = tokio::time::Instant::now();
        assert!(matches!(f.session.next_timer().await, SessionTimer::MaxDuration));
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_recording_auto_stops_on_resume() {
        let mut f = fixture();
        let writer = f.hub.connect();
        use crate::registry::RegistryBackend;
        let long_ago = Utc::now().timestamp_millis() - 60_000;
        writer.set("recordId", "s1").unwrap();
        writer.set("recordingStartTime", &long_ago.to_string()).unwrap();

        f.session.start_recording_with_id(None);
        let fired = tokio::time::timeout(Duration::from_millis(1), f.session.next_timer()).await;
        assert!(matches!(fired, Ok(SessionTimer::MaxDuration)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_cleanup_leaves_registry_alone() {
        let mut f = fixture();
        let id = f.session.start_recording_with_id(Some(SINK.into()));
        f.session.emit(json!({ "i": 0 }));

        f.session.force_cleanup();
        assert_eq!(f.session.status(), SessionStatus::Idle);
        assert!(f.session.record_id().is_none());
        assert_eq!(f.session.buffered(), 0);
        assert!(f.session.scheduler().is_idle());
        assert_eq!(f.hub.snapshot()["recordId"], id);
        assert!(f.sink.received().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_storage_still_records() {
        let mut f = fixture();
        f.hub.set_unavailable(true);
        let id = f.session.start_recording_with_id(Some(SINK.into()));
        assert!(f.session.is_recording());
        f.session.emit(json!({ "i": 0 }));

        let outcome = f.session.stop(StopReason::User).await;
        assert_eq!(outcome.record_id.as_deref(), Some(id.as_str()));
        assert_eq!(outcome.flush.delivered_count(), 1);
    }
}
