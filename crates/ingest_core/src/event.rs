//! Object-creation events emitted by the object store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const OBJECT_CREATED_PUT: &str = "ObjectCreated:Put";
pub const EVENT_SOURCE: &str = "aws:s3";
pub const NOTIFICATION_EVENT_VERSION: &str = "2.1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectCreatedEvent {
    pub bucket: String,
    pub key: String,
    /// Absent when the source store has versioning disabled.
    pub version_id: Option<String>,
    pub event_name: String,
    /// Monotonic per store; distinguishes overwrites of unversioned keys.
    pub sequencer: u64,
    pub size: u64,
    pub content_hash: String,
    pub event_time: DateTime<Utc>,
}

/// Identity a consumer deduplicates on. Delivery is at-least-once, so the same
/// key can arrive more than once and must be processed idempotently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    pub version: String,
}

impl ObjectCreatedEvent {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            key: self.key.clone(),
            version: self
                .version_id
                .clone()
                .unwrap_or_else(|| format_sequencer(self.sequencer)),
        }
    }

    /// Renders the event as a single-record storage notification, the wire
    /// shape the receiver function decodes.
    pub fn to_notification(&self, configuration_id: &str) -> Value {
        let mut object = json!({
            "key": encode_key(&self.key),
            "size": self.size,
            "eTag": self.content_hash,
            "sequencer": format_sequencer(self.sequencer),
        });
        if let Some(version_id) = &self.version_id {
            object["versionId"] = Value::from(version_id.clone());
        }

        json!({
            "Records": [{
                "eventVersion": NOTIFICATION_EVENT_VERSION,
                "eventSource": EVENT_SOURCE,
                "eventTime": self.event_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                "eventName": self.event_name,
                "s3": {
                    "s3SchemaVersion": "1.0",
                    "configurationId": configuration_id,
                    "bucket": {
                        "name": self.bucket,
                        "arn": format!("arn:aws:s3:::{}", self.bucket),
                    },
                    "object": object,
                }
            }]
        })
    }
}

pub fn format_sequencer(sequencer: u64) -> String {
    format!("{sequencer:016X}")
}

/// Keys travel form-encoded in notifications: space as `+`, anything outside
/// the unreserved set and `/` as `%XX`.
pub fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(char::from(byte))
            }
            b' ' => encoded.push('+'),
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

/// Receives every event a store emits. The router is the production sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ObjectCreatedEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(version_id: Option<&str>) -> ObjectCreatedEvent {
        ObjectCreatedEvent {
            bucket: "insurance-emails-dev".to_string(),
            key: "incoming/claim123.pdf".to_string(),
            version_id: version_id.map(str::to_string),
            event_name: OBJECT_CREATED_PUT.to_string(),
            sequencer: 42,
            size: 10_245,
            content_hash: "abc123".to_string(),
            event_time: DateTime::parse_from_rfc3339("2024-02-04T10:00:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn idempotency_key_prefers_version_id() {
        let key = sample_event(Some("v-7")).idempotency_key();
        assert_eq!(key.version, "v-7");
    }

    #[test]
    fn idempotency_key_falls_back_to_sequencer_without_versioning() {
        let key = sample_event(None).idempotency_key();
        assert_eq!(key.version, "000000000000002A");
    }

    #[test]
    fn notification_carries_bucket_key_and_event_name() {
        let notification = sample_event(None).to_notification("EmailProcessor");
        let record = &notification["Records"][0];
        assert_eq!(record["eventSource"], "aws:s3");
        assert_eq!(record["eventName"], "ObjectCreated:Put");
        assert_eq!(record["eventTime"], "2024-02-04T10:00:00.000Z");
        assert_eq!(record["s3"]["bucket"]["name"], "insurance-emails-dev");
        assert_eq!(record["s3"]["object"]["key"], "incoming/claim123.pdf");
        assert_eq!(record["s3"]["configurationId"], "EmailProcessor");
        assert!(record["s3"]["object"].get("versionId").is_none());
    }

    #[test]
    fn notification_keys_are_form_encoded() {
        assert_eq!(encode_key("incoming/claim 1 (a).pdf"), "incoming/claim+1+%28a%29.pdf");
        assert_eq!(encode_key("incoming/caf\u{e9}.eml"), "incoming/caf%C3%A9.eml");
    }
}
