//! Network call records produced by request interception

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::RecordedEvent;
use crate::ids::now_millis;

/// Custom event type used by replayers for plugin payloads
const CUSTOM_EVENT_TYPE: u64 = 5;

/// URL schemes that never leave the page
const INTERNAL_SCHEMES: [&str; 3] = ["data:", "blob:", "chrome-extension:"];

/// One intercepted request/response pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl NetworkRecord {
    /// Whether this call should be left out of the recording
    ///
    /// The recorder's own upload/finalize calls and in-page resources are
    /// never recorded.
    pub fn is_ignored(&self) -> bool {
        let url = self.url.as_str();
        let own_traffic = url.contains("/record/") && (url.contains("/upload") || url.contains("/end"));
        own_traffic || INTERNAL_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
    }
}

/// Wrap a network record as a custom replay event
///
/// Returns `None` for calls that must not be recorded.
pub fn network_event(record: &NetworkRecord, page_url: &str, user_agent: &str) -> Option<RecordedEvent> {
    if record.is_ignored() {
        return None;
    }

    let timestamp = now_millis();
    let mut payload = serde_json::to_value(record).ok()?;
    if let Value::Object(ref mut fields) = payload {
        fields.insert("tag".to_string(), json!("network"));
        fields.insert("timestamp".to_string(), json!(timestamp));
        fields.insert("pageUrl".to_string(), json!(page_url));
        fields.insert("userAgent".to_string(), json!(user_agent));
    }

    Some(json!({
        "type": CUSTOM_EVENT_TYPE,
        "timestamp": timestamp,
        "data": {
            "tag": "network",
            "payload": payload,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str) -> NetworkRecord {
        NetworkRecord {
            method: "GET".to_string(),
            url: url.to_string(),
            status: Some(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_own_traffic_is_ignored() {
        assert!(record("https://c.example/record/abc/upload").is_ignored());
        assert!(record("https://c.example/record/abc/end").is_ignored());
        assert!(!record("https://c.example/record/abc").is_ignored());
        assert!(record("data:image/png;base64,AAAA").is_ignored());
        assert!(record("blob:https://app.example/1234").is_ignored());
        assert!(!record("https://api.example/users").is_ignored());
    }

    #[test]
    fn test_network_event_shape() {
        let event = network_event(&record("https://api.example/users"), "https://app.example/", "agent/1").unwrap();
        assert_eq!(event["type"], 5);
        assert_eq!(event["data"]["tag"], "network");
        let payload = &event["data"]["payload"];
        assert_eq!(payload["method"], "GET");
        assert_eq!(payload["status"], 200);
        assert_eq!(payload["pageUrl"], "https://app.example/");
        assert_eq!(payload["userAgent"], "agent/1");
    }

    #[test]
    fn test_ignored_record_yields_nothing() {
        assert!(network_event(&record("chrome-extension://x/y.js"), "p", "u").is_none());
    }
}
