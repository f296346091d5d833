//! JSON payloads carried on the notification keys

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Written to the stop-notification key when a peer ends the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopNotice {
    pub page_id: Option<String>,
    pub timestamp: Option<i64>,
    pub record_id: Option<String>,
}

/// Asks every other peer to hand over its buffered events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadRequest {
    pub requester_page_id: Option<String>,
}

/// A peer's buffered events, handed to whoever asked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadResponse {
    pub events: Vec<Value>,
    pub sender_page_id: Option<String>,
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::parse_payload;

    #[test]
    fn test_stop_notice_wire_names() {
        let notice = StopNotice {
            page_id: Some("peer-a".into()),
            timestamp: Some(1),
            record_id: Some("s1".into()),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["pageId"], "peer-a");
        assert_eq!(json["recordId"], "s1");
    }

    #[test]
    fn test_partial_payloads_fill_defaults() {
        let request: UploadRequest = parse_payload(r#"{"requesterPageId":"peer-b"}"#);
        assert_eq!(request.requester_page_id.as_deref(), Some("peer-b"));

        let response: UploadResponse = parse_payload(r#"{"senderPageId":"peer-a"}"#);
        assert!(response.events.is_empty());

        let junk: UploadResponse = parse_payload("[1,2,3]");
        assert_eq!(junk, UploadResponse::default());
    }
}
