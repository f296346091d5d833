//! Cross-peer coordinator - one per peer, driving its recording session
//!
//! The [`Coordinator`] owns all peer state and runs as a single task. UI and
//! capture code talk to it through a cloneable [`RecorderHandle`]; it talks
//! to other peers only through the shared registry.

mod engine;
mod router;

pub use engine::{create_recorder_channels, Coordinator};
pub use router::{NotificationRouter, PeerNotification, Topic};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::data::{NetworkRecord, RecordedEvent};
use crate::ids::PeerId;
use crate::recording::{SessionStatus, StopOutcome, StopReason};

/// Whether this peer is in front of the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Result of picking up a recording that was live in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumed {
    pub record_id: String,
    /// Whether this peer took over as primary
    pub claimed_primary: bool,
    /// Whether the drawing overlay should be shown again
    pub drawing_mode: bool,
}

/// Point-in-time view of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub peer_id: PeerId,
    pub status: SessionStatus,
    pub record_id: Option<String>,
    pub buffered: usize,
    pub is_primary: bool,
    pub drawing_mode: bool,
    pub visibility: Visibility,
}

/// Commands accepted by the coordinator task
#[derive(Debug)]
pub enum RecorderCommand {
    Emit(RecordedEvent),
    NetworkEvent(NetworkRecord),
    StartRecording {
        sink: Option<String>,
        reply: oneshot::Sender<()>,
    },
    StartRecordingWithId {
        sink: Option<String>,
        reply: oneshot::Sender<String>,
    },
    StopRecording {
        sink: Option<String>,
        reply: oneshot::Sender<StopOutcome>,
    },
    ForceCleanup,
    SetVisibility {
        visibility: Visibility,
        reply: oneshot::Sender<()>,
    },
    SetDrawingMode {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    RequestPeerEvents {
        reply: oneshot::Sender<bool>,
    },
    Events {
        reply: oneshot::Sender<Vec<RecordedEvent>>,
    },
    ClearEvents,
    State {
        reply: oneshot::Sender<PeerState>,
    },
    /// Hand off and exit the task
    Unload {
        reply: oneshot::Sender<StopOutcome>,
    },
}

/// Status updates from the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderStatus {
    Idle,
    Recording {
        record_id: String,
        is_primary: bool,
    },
    Stopped {
        record_id: Option<String>,
        reason: StopReason,
        /// Whether the UI should show its completion prompt
        prompt: bool,
        is_origin_page: bool,
    },
    PrimaryChanged {
        is_primary: bool,
    },
    DrawingMode(bool),
}

#[derive(Debug, Error)]
#[error("recorder task has exited")]
pub struct RecorderClosed;

/// Cloneable front end for a running [`Coordinator`]
#[derive(Debug, Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
}

impl RecorderHandle {
    pub fn new(tx: mpsc::Sender<RecorderCommand>) -> Self {
        Self { tx }
    }

    async fn send(&self, command: RecorderCommand) -> Result<(), RecorderClosed> {
        self.tx.send(command).await.map_err(|_| RecorderClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand,
    ) -> Result<T, RecorderClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| RecorderClosed)
    }

    pub async fn emit(&self, event: RecordedEvent) -> Result<(), RecorderClosed> {
        self.send(RecorderCommand::Emit(event)).await
    }

    pub async fn push_network_event(&self, record: NetworkRecord) -> Result<(), RecorderClosed> {
        self.send(RecorderCommand::NetworkEvent(record)).await
    }

    pub async fn start_recording(&self, sink: Option<String>) -> Result<(), RecorderClosed> {
        self.request(|reply| RecorderCommand::StartRecording { sink, reply })
            .await
    }

    pub async fn start_recording_with_id(&self, sink: Option<String>) -> Result<String, RecorderClosed> {
        self.request(|reply| RecorderCommand::StartRecordingWithId { sink, reply })
            .await
    }

    pub async fn stop_recording(&self, sink: Option<String>) -> Result<StopOutcome, RecorderClosed> {
        self.request(|reply| RecorderCommand::StopRecording { sink, reply })
            .await
    }

    pub async fn force_cleanup(&self) -> Result<(), RecorderClosed> {
        self.send(RecorderCommand::ForceCleanup).await
    }

    pub async fn set_visibility(&self, visibility: Visibility) -> Result<(), RecorderClosed> {
        self.request(|reply| RecorderCommand::SetVisibility { visibility, reply })
            .await
    }

    pub async fn set_drawing_mode(&self, enabled: bool) -> Result<bool, RecorderClosed> {
        self.request(|reply| RecorderCommand::SetDrawingMode { enabled, reply })
            .await
    }

    pub async fn request_peer_events(&self) -> Result<bool, RecorderClosed> {
        self.request(|reply| RecorderCommand::RequestPeerEvents { reply })
            .await
    }

    pub async fn events(&self) -> Result<Vec<RecordedEvent>, RecorderClosed> {
        self.request(|reply| RecorderCommand::Events { reply }).await
    }

    pub async fn clear_events(&self) -> Result<(), RecorderClosed> {
        self.send(RecorderCommand::ClearEvents).await
    }

    pub async fn state(&self) -> Result<PeerState, RecorderClosed> {
        self.request(|reply| RecorderCommand::State { reply }).await
    }

    pub async fn is_recording(&self) -> Result<bool, RecorderClosed> {
        Ok(self.state().await?.status == SessionStatus::Active)
    }

    pub async fn record_id(&self) -> Result<Option<String>, RecorderClosed> {
        Ok(self.state().await?.record_id)
    }

    /// Hand the session off and stop the coordinator task
    pub async fn unload(&self) -> Result<StopOutcome, RecorderClosed> {
        self.request(|reply| RecorderCommand::Unload { reply }).await
    }
}
