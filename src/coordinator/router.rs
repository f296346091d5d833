//! Topic routing for registry change notifications
//!
//! Raw `(key, old, new)` changes are turned into typed [`PeerNotification`]s
//! for the topics a coordinator subscribed to. Everything else is dropped
//! here, so handlers only ever see well-formed, actually-changed values.

use std::collections::HashSet;
use tracing::debug;

use crate::ids::PeerId;
use crate::registry::{
    is_unset, parse_payload, RegistryChange, RegistryKey, StopNotice, UploadRequest,
    UploadResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Stop,
    UploadRequest,
    UploadResponse,
    PrimaryChange,
    PeerActivity,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Stop,
        Topic::UploadRequest,
        Topic::UploadResponse,
        Topic::PrimaryChange,
        Topic::PeerActivity,
    ];

    pub fn for_key(key: RegistryKey) -> Option<Self> {
        match key {
            RegistryKey::StopNotification => Some(Topic::Stop),
            RegistryKey::UploadRequest => Some(Topic::UploadRequest),
            RegistryKey::UploadResponse => Some(Topic::UploadResponse),
            RegistryKey::PrimaryPeer => Some(Topic::PrimaryChange),
            RegistryKey::LastActivePeer => Some(Topic::PeerActivity),
            _ => None,
        }
    }
}

/// A typed notification from another peer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerNotification {
    /// Some peer ended the recording
    Stopped(StopNotice),
    /// Some peer wants everyone's buffered events
    EventsRequested(UploadRequest),
    /// Some peer handed over its buffered events
    EventsOffered(UploadResponse),
    /// The primary peer changed; `None` when the key was removed
    PrimaryChanged(Option<PeerId>),
    /// A peer announced it is alive and in front
    PeerActive(PeerId),
}

#[derive(Debug, Default)]
pub struct NotificationRouter {
    topics: HashSet<Topic>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: Topic) -> &mut Self {
        self.topics.insert(topic);
        self
    }

    pub fn unsubscribe(&mut self, topic: Topic) -> &mut Self {
        self.topics.remove(&topic);
        self
    }

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.topics.contains(&topic)
    }

    pub fn route(&self, change: &RegistryChange) -> Option<PeerNotification> {
        let key = RegistryKey::parse(&change.key)?;
        let topic = Topic::for_key(key)?;
        if !self.is_subscribed(topic) {
            return None;
        }
        if change.old_value == change.new_value {
            debug!("Ignoring unchanged {} notification", change.key);
            return None;
        }

        let new_value = change.new_value.as_deref().filter(|value| !is_unset(value));
        let notification = match topic {
            Topic::PrimaryChange => PeerNotification::PrimaryChanged(new_value.map(PeerId::from)),
            // Removing a notification key carries no message
            Topic::Stop => PeerNotification::Stopped(parse_payload(new_value?)),
            Topic::UploadRequest => PeerNotification::EventsRequested(parse_payload(new_value?)),
            Topic::UploadResponse => PeerNotification::EventsOffered(parse_payload(new_value?)),
            Topic::PeerActivity => PeerNotification::PeerActive(PeerId::from(new_value?)),
        };
        Some(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> NotificationRouter {
        let mut router = NotificationRouter::new();
        for topic in Topic::ALL {
            router.subscribe(topic);
        }
        router
    }

    fn change(key: RegistryKey, old: Option<&str>, new: Option<&str>) -> RegistryChange {
        RegistryChange::new(key, old, new)
    }

    #[test]
    fn test_stop_notice_is_decoded() {
        let routed = router().route(&change(
            RegistryKey::StopNotification,
            None,
            Some(r#"{"pageId":"peer-b","timestamp":5,"recordId":"s1"}"#),
        ));
        match routed {
            Some(PeerNotification::Stopped(notice)) => {
                assert_eq!(notice.page_id.as_deref(), Some("peer-b"));
                assert_eq!(notice.record_id.as_deref(), Some("s1"));
            }
            other => panic!("unexpected routing {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload_routes_as_empty() {
        let routed = router().route(&change(RegistryKey::UploadRequest, None, Some("{oops")));
        assert_eq!(
            routed,
            Some(PeerNotification::EventsRequested(UploadRequest::default()))
        );
    }

    #[test]
    fn test_unchanged_and_removed_values_are_dropped() {
        let router = router();
        assert!(router
            .route(&change(RegistryKey::StopNotification, Some("{}"), Some("{}")))
            .is_none());
        assert!(router
            .route(&change(RegistryKey::UploadResponse, Some("{}"), None))
            .is_none());
        assert!(router
            .route(&change(RegistryKey::LastActivePeer, Some("peer-a"), Some("null")))
            .is_none());
    }

    #[test]
    fn test_primary_removal_is_reported() {
        let router = router();
        assert_eq!(
            router.route(&change(RegistryKey::PrimaryPeer, Some("peer-a"), None)),
            Some(PeerNotification::PrimaryChanged(None))
        );
        assert_eq!(
            router.route(&change(RegistryKey::PrimaryPeer, None, Some("peer-b"))),
            Some(PeerNotification::PrimaryChanged(Some(PeerId::from("peer-b"))))
        );
    }

    #[test]
    fn test_session_keys_and_unknown_keys_are_not_routed() {
        let router = router();
        assert!(router
            .route(&change(RegistryKey::SessionId, None, Some("s1")))
            .is_none());
        let unknown = RegistryChange {
            key: "theme".into(),
            old_value: None,
            new_value: Some("dark".into()),
        };
        assert!(router.route(&unknown).is_none());
    }

    #[test]
    fn test_unsubscribed_topic_is_dropped() {
        let mut router = router();
        router.unsubscribe(Topic::PeerActivity);
        assert!(router
            .route(&change(RegistryKey::LastActivePeer, None, Some("peer-b")))
            .is_none());
        assert!(router
            .route(&change(RegistryKey::PrimaryPeer, None, Some("peer-b")))
            .is_some());
    }
}
