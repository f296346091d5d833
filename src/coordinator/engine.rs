//! Coordinator engine
//!
//! Owns the peer's recording session and reacts to four kinds of input:
//! commands from the UI and capture side, change notifications from other
//! peers, the last-active heartbeat, and the session's own timers. All of
//! them are handled one at a time on a single task.
//!
//! Leadership is last-writer-wins. A peer claims primacy by writing its id
//! to the primary key; a brief window with two primaries is tolerated
//! because every peer that records flushes under the same recording id.

use chrono::Utc;
use std::future::pending;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::data::{NetworkRecord, RecordedEvent};
use crate::ids::PeerId;
use crate::recording::{RecordingSession, SessionTimer, StopOutcome, StopReason};
use crate::registry::{
    Registry, RegistryChange, RegistryChanges, RegistryKey, StopNotice, UploadRequest,
    UploadResponse,
};
use crate::upload::Uploader;

use super::router::{NotificationRouter, PeerNotification, Topic};
use super::{PeerState, RecorderCommand, RecorderStatus, Resumed, Visibility};

/// The per-peer coordinator
pub struct Coordinator {
    /// This peer's id, as written to the registry
    peer_id: PeerId,
    /// Shared key-value store all peers coordinate through
    registry: Registry,
    /// The local recording and its timers
    session: RecordingSession,
    /// Topics this peer reacts to
    router: NotificationRouter,
    /// Changes written by other peers; `None` when storage is unusable
    changes: Option<RegistryChanges>,
    /// Commands from the UI and capture side
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    /// Status updates for the UI
    status_tx: broadcast::Sender<RecorderStatus>,
    /// How often a recording peer rewrites last-active
    heartbeat_period: Duration,
    /// Sink used when a start command does not name one
    default_sink: Option<String>,
    /// Whether the peer is in front of the user
    visibility: Visibility,
    /// Whether this peer believes it is primary
    is_primary: bool,
    /// Drawing overlay flag, only ever set while recording
    drawing_mode: bool,
    /// Most recent other peer that announced itself
    last_seen_peer: Option<PeerId>,
    /// Set by `request_peer_events` until the recording stops
    awaiting_events: bool,
}

impl Coordinator {
    pub fn new(
        peer_id: PeerId,
        registry: Registry,
        uploader: Uploader,
        config: &Config,
        cmd_rx: mpsc::Receiver<RecorderCommand>,
        status_tx: broadcast::Sender<RecorderStatus>,
    ) -> Self {
        let mut router = NotificationRouter::new();
        for topic in Topic::ALL {
            router.subscribe(topic);
        }
        let changes = registry.subscribe();
        let session = RecordingSession::new(
            peer_id.clone(),
            registry.clone(),
            uploader,
            &config.recording,
        );

        Self {
            peer_id,
            registry,
            session,
            router,
            changes,
            cmd_rx,
            status_tx,
            heartbeat_period: config.recording.heartbeat_interval(),
            default_sink: config.upload.sink_url.clone(),
            visibility: Visibility::Visible,
            is_primary: false,
            drawing_mode: false,
            last_seen_peer: None,
            awaiting_events: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_recording()
    }

    pub fn record_id(&self) -> Option<&str> {
        self.session.record_id()
    }

    pub fn drawing_mode(&self) -> bool {
        self.drawing_mode
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn last_seen_peer(&self) -> Option<&PeerId> {
        self.last_seen_peer.as_ref()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<RecorderStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> PeerState {
        PeerState {
            peer_id: self.peer_id.clone(),
            status: self.session.status(),
            record_id: self.session.record_id().map(str::to_string),
            buffered: self.session.buffered(),
            is_primary: self.is_primary,
            drawing_mode: self.drawing_mode,
            visibility: self.visibility,
        }
    }

    fn publish(&self, status: RecorderStatus) {
        let _ = self.status_tx.send(status);
    }

    fn publish_session_state(&self) {
        match (self.session.is_recording(), self.session.record_id()) {
            (true, Some(record_id)) => self.publish(RecorderStatus::Recording {
                record_id: record_id.to_string(),
                is_primary: self.is_primary,
            }),
            _ => self.publish(RecorderStatus::Idle),
        }
    }

    fn sink_or_default(&self, sink: Option<String>) -> Option<String> {
        sink.or_else(|| self.default_sink.clone())
    }

    // --- capture side ---

    pub fn emit(&mut self, event: RecordedEvent) -> bool {
        self.session.emit(event)
    }

    pub fn push_network_event(&mut self, record: &NetworkRecord) -> bool {
        self.session.push_network_event(record)
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.session.events()
    }

    pub fn clear_events(&mut self) {
        self.session.clear_events();
    }

    // --- UI side ---

    /// Start capturing under the recording id already known to this peer.
    /// With no id known anywhere this mints one like `start_recording_with_id`.
    pub fn start_recording(&mut self, sink: Option<String>) {
        if self.session.record_id().is_none() {
            match self.registry.session_id() {
                Some(record_id) => self.session.adopt_session_id(record_id),
                None => {
                    self.start_recording_with_id(sink);
                    return;
                }
            }
        }
        let sink = self.sink_or_default(sink);
        self.session.start_recording(sink);
        self.publish_session_state();
    }

    /// Start or resume the persisted recording and take over as primary
    pub fn start_recording_with_id(&mut self, sink: Option<String>) -> String {
        let sink = self.sink_or_default(sink);
        let record_id = self.session.start_recording_with_id(sink);
        self.claim_primary();
        self.publish_session_state();
        record_id
    }

    /// End the recording for every peer
    pub async fn stop_recording(&mut self, sink: Option<String>) -> StopOutcome {
        self.session.set_sink(sink);
        self.finish_session(StopReason::User).await
    }

    /// Drop all local recording state without telling anyone
    pub fn force_cleanup(&mut self) {
        self.session.force_cleanup();
        self.awaiting_events = false;
        if self.is_primary {
            self.is_primary = false;
            self.publish(RecorderStatus::PrimaryChanged { is_primary: false });
        }
        if self.drawing_mode {
            self.drawing_mode = false;
            self.publish(RecorderStatus::DrawingMode(false));
        }
        self.publish(RecorderStatus::Idle);
    }

    /// Set the drawing overlay flag. Enabling needs an active recording, and
    /// the flag is only persisted while recording.
    pub fn set_drawing_mode(&mut self, enabled: bool) -> bool {
        let recording = self.session.is_recording();
        if enabled && !recording {
            return false;
        }
        if recording {
            self.registry.set_drawing_mode(enabled);
        }
        if self.drawing_mode != enabled {
            self.drawing_mode = enabled;
            self.publish(RecorderStatus::DrawingMode(enabled));
        }
        true
    }

    /// Ask every other peer to hand over its buffered events
    pub fn request_peer_events(&mut self) -> bool {
        if !self.session.is_recording() {
            return false;
        }
        self.awaiting_events = true;
        // Identical values produce no notification
        self.registry.remove(RegistryKey::UploadRequest);
        self.registry.write_json(
            RegistryKey::UploadRequest,
            &UploadRequest {
                requester_page_id: Some(self.peer_id.to_string()),
            },
        );
        info!("Requested buffered events from other peers");
        true
    }

    // --- stopping ---

    /// Stop that ends the recording for everyone and tells the other peers
    async fn finish_session(&mut self, reason: StopReason) -> StopOutcome {
        let outcome = self.session.stop(reason).await;
        if let Some(record_id) = &outcome.record_id {
            self.registry.write_json(
                RegistryKey::StopNotification,
                &StopNotice {
                    page_id: Some(self.peer_id.to_string()),
                    timestamp: Some(Utc::now().timestamp_millis()),
                    record_id: Some(record_id.clone()),
                },
            );
        }
        self.after_stop(&outcome);
        outcome
    }

    /// Local stop that leaves the persisted recording for other peers
    async fn stop_silently(&mut self, reason: StopReason) -> StopOutcome {
        let outcome = self.session.stop(reason).await;
        self.after_stop(&outcome);
        outcome
    }

    fn after_stop(&mut self, outcome: &StopOutcome) {
        self.is_primary = false;
        self.drawing_mode = false;
        self.awaiting_events = false;
        if outcome.record_id.is_some() {
            self.publish(RecorderStatus::Stopped {
                record_id: outcome.record_id.clone(),
                reason: outcome.reason,
                prompt: outcome.should_prompt(),
                is_origin_page: outcome.is_origin_page,
            });
        }
    }

    // --- leadership ---

    /// Write this peer's id to the last-active key
    pub fn announce(&self) {
        self.registry
            .set(RegistryKey::LastActivePeer, self.peer_id.as_str());
    }

    /// Periodic liveness signal, only while recording
    pub fn heartbeat(&self) {
        if self.session.is_recording() {
            self.announce();
        }
    }

    fn claim_primary(&mut self) {
        self.registry
            .set(RegistryKey::PrimaryPeer, self.peer_id.as_str());
        self.announce();
        if !self.is_primary {
            info!("Peer {} is now primary", self.peer_id);
            self.is_primary = true;
            self.publish(RecorderStatus::PrimaryChanged { is_primary: true });
        }
    }

    /// Whether the recorded primary is missing or stale
    fn should_claim(&self) -> bool {
        match (self.registry.primary_peer(), self.registry.last_active_peer()) {
            (Some(primary), Some(last_active)) => {
                primary == self.peer_id || primary != last_active
            }
            _ => true,
        }
    }

    /// Whether this peer is primary, by the registry if it can tell
    fn holds_primary(&self) -> bool {
        match self.registry.primary_peer() {
            Some(primary) => primary == self.peer_id,
            None => self.is_primary,
        }
    }

    /// Pick up a recording that is live in the registry. `claim` must be
    /// decided before this peer announces itself.
    fn resume_if_live(&mut self, claim: bool) -> Option<Resumed> {
        let record_id = self.registry.session_id()?;

        let claimed_primary = claim;
        if claimed_primary {
            self.claim_primary();
        }

        if !self.session.is_recording() {
            self.session.adopt_session_id(record_id.clone());
            let sink = self.default_sink.clone();
            self.session.start_recording_with_id(sink);
        }

        let drawing_mode = self.registry.drawing_mode() && self.session.is_recording();
        if drawing_mode != self.drawing_mode {
            self.drawing_mode = drawing_mode;
            self.publish(RecorderStatus::DrawingMode(drawing_mode));
        }
        self.publish_session_state();

        let record_id = self
            .session
            .record_id()
            .map(str::to_string)
            .unwrap_or(record_id);
        info!(
            "Resumed recording {} (primary claimed: {})",
            record_id, claimed_primary
        );
        Some(Resumed {
            record_id,
            claimed_primary,
            drawing_mode,
        })
    }

    // --- lifecycle ---

    /// Start-up: resume a live recording, then announce this peer
    pub fn on_load(&mut self) -> Option<Resumed> {
        let claim = self.should_claim();
        let resumed = self.resume_if_live(claim);
        self.announce();
        resumed
    }

    pub async fn on_visibility(&mut self, visibility: Visibility) -> Option<Resumed> {
        self.visibility = visibility;
        match visibility {
            Visibility::Hidden => {
                if self.session.is_recording() {
                    debug!("Peer hidden while recording, stopping locally");
                    self.announce();
                    self.stop_silently(StopReason::Hidden).await;
                }
                None
            }
            Visibility::Visible => {
                self.registry.session_id()?;
                let claim = self.should_claim();
                self.announce();
                self.resume_if_live(claim)
            }
        }
    }

    /// Teardown: flush and stop locally, then hand primacy to another peer
    pub async fn on_unload(&mut self) -> StopOutcome {
        let hand_off = self.session.is_recording() && self.holds_primary();
        let successor = self
            .registry
            .last_active_peer()
            .filter(|peer| *peer != self.peer_id)
            .or_else(|| self.last_seen_peer.clone());

        let outcome = self.stop_silently(StopReason::Unload).await;

        if hand_off {
            match successor {
                Some(next) => {
                    info!("Handing primary over to peer {}", next);
                    self.registry.set(RegistryKey::PrimaryPeer, next.as_str());
                }
                None => {
                    info!("No other peer seen, releasing primary");
                    self.registry.remove(RegistryKey::PrimaryPeer);
                }
            }
        }
        outcome
    }

    // --- notifications ---

    pub async fn handle_change(&mut self, change: RegistryChange) {
        if let Some(notification) = self.router.route(&change) {
            debug!("Notification on {}: {:?}", change.key, notification);
            self.handle_notification(notification).await;
        }
    }

    pub async fn handle_notification(&mut self, notification: PeerNotification) {
        match notification {
            PeerNotification::Stopped(notice) => self.on_stop_notice(notice).await,
            PeerNotification::EventsRequested(request) => self.on_events_requested(request),
            PeerNotification::EventsOffered(response) => self.on_events_offered(response),
            PeerNotification::PrimaryChanged(primary) => self.on_primary_changed(primary),
            PeerNotification::PeerActive(peer) => {
                if peer != self.peer_id {
                    self.last_seen_peer = Some(peer);
                }
            }
        }
    }

    async fn on_stop_notice(&mut self, notice: StopNotice) {
        if self.drawing_mode {
            self.drawing_mode = false;
            self.publish(RecorderStatus::DrawingMode(false));
        }
        if !self.session.is_recording() {
            return;
        }
        if notice.page_id.as_deref() == Some(self.peer_id.as_str()) {
            return;
        }
        if let (Some(theirs), Some(ours)) = (notice.record_id.as_deref(), self.session.record_id()) {
            if theirs != ours {
                debug!("Ignoring stop of recording {}, recording {}", theirs, ours);
                return;
            }
        }
        info!(
            "Recording stopped by peer {}",
            notice.page_id.as_deref().unwrap_or("<unknown>")
        );
        self.stop_silently(StopReason::Remote).await;
    }

    fn on_events_requested(&mut self, request: UploadRequest) {
        if request.requester_page_id.as_deref() == Some(self.peer_id.as_str()) {
            return;
        }
        let events = self.session.take_events();
        if events.is_empty() {
            return;
        }
        info!(
            "Handing {} buffered events to peer {}",
            events.len(),
            request.requester_page_id.as_deref().unwrap_or("<unknown>")
        );
        self.registry.write_json(
            RegistryKey::UploadResponse,
            &UploadResponse {
                events,
                sender_page_id: Some(self.peer_id.to_string()),
                timestamp: Some(Utc::now().timestamp_millis()),
            },
        );
    }

    fn on_events_offered(&mut self, response: UploadResponse) {
        if !self.awaiting_events {
            debug!("Ignoring unsolicited events from another peer");
            return;
        }
        if response.sender_page_id.as_deref() == Some(self.peer_id.as_str()) {
            return;
        }
        let absorbed = self.session.absorb_events(response.events);
        info!(
            "Absorbed {} events from peer {}",
            absorbed,
            response.sender_page_id.as_deref().unwrap_or("<unknown>")
        );
    }

    fn on_primary_changed(&mut self, primary: Option<PeerId>) {
        let Some(primary) = primary else {
            debug!("Primary peer cleared");
            return;
        };
        let is_primary = primary == self.peer_id;
        if is_primary != self.is_primary {
            info!(
                "Primary changed to {} (this peer {})",
                primary,
                if is_primary { "promoted" } else { "demoted" }
            );
            self.is_primary = is_primary;
            self.publish(RecorderStatus::PrimaryChanged { is_primary });
        }
    }

    /// Handle every change already queued by other peers
    pub async fn process_pending_changes(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let change = match self.changes.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(change)) => change,
                _ => break,
            };
            self.handle_change(change).await;
            handled += 1;
        }
        handled
    }

    // --- timers ---

    pub async fn on_timer(&mut self, timer: SessionTimer) {
        match timer {
            SessionTimer::MaxDuration => {
                info!("Maximum recording duration reached");
                self.finish_session(StopReason::MaxDuration).await;
            }
            SessionTimer::Upload => {
                self.session.begin_periodic_flush();
            }
            SessionTimer::FlushFinished(report) => self.session.finish_flush(&report),
        }
    }

    // --- main loop ---

    /// Returns false when the task should exit
    async fn handle_command(&mut self, command: RecorderCommand) -> bool {
        match command {
            RecorderCommand::Emit(event) => {
                self.emit(event);
            }
            RecorderCommand::NetworkEvent(record) => {
                self.push_network_event(&record);
            }
            RecorderCommand::StartRecording { sink, reply } => {
                self.start_recording(sink);
                let _ = reply.send(());
            }
            RecorderCommand::StartRecordingWithId { sink, reply } => {
                let _ = reply.send(self.start_recording_with_id(sink));
            }
            RecorderCommand::StopRecording { sink, reply } => {
                let _ = reply.send(self.stop_recording(sink).await);
            }
            RecorderCommand::ForceCleanup => self.force_cleanup(),
            RecorderCommand::SetVisibility { visibility, reply } => {
                self.on_visibility(visibility).await;
                let _ = reply.send(());
            }
            RecorderCommand::SetDrawingMode { enabled, reply } => {
                let _ = reply.send(self.set_drawing_mode(enabled));
            }
            RecorderCommand::RequestPeerEvents { reply } => {
                let _ = reply.send(self.request_peer_events());
            }
            RecorderCommand::Events { reply } => {
                let _ = reply.send(self.events());
            }
            RecorderCommand::ClearEvents => self.clear_events(),
            RecorderCommand::State { reply } => {
                let _ = reply.send(self.state());
            }
            RecorderCommand::Unload { reply } => {
                info!("Unload requested");
                let _ = reply.send(self.on_unload().await);
                return false;
            }
        }
        true
    }

    /// Run the coordinator until unloaded or every handle is dropped
    pub async fn run(&mut self) {
        info!("Coordinator starting for peer {}", self.peer_id);
        if self.changes.is_none() {
            warn!("Running without registry notifications");
        }

        self.on_load();
        self.publish_session_state();

        // First heartbeat a full period from now
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_period, self.heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            info!("All recorder handles dropped");
                            break;
                        }
                    }
                }

                change = recv_opt(self.changes.as_mut()) => {
                    match change {
                        Some(change) => self.handle_change(change).await,
                        None => {
                            warn!("Registry notifications ended, continuing standalone");
                            self.changes = None;
                        }
                    }
                }

                _ = heartbeat.tick() => self.heartbeat(),

                timer = self.session.next_timer() => self.on_timer(timer).await,
            }
        }

        info!("Coordinator stopped");
    }
}

async fn recv_opt(changes: Option<&mut RegistryChanges>) -> Option<RegistryChange> {
    match changes {
        Some(changes) => changes.recv().await,
        None => pending().await,
    }
}

/// Create command and status channels for a coordinator
pub fn create_recorder_channels() -> (
    mpsc::Sender<RecorderCommand>,
    mpsc::Receiver<RecorderCommand>,
    broadcast::Sender<RecorderStatus>,
    broadcast::Receiver<RecorderStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(64);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}
