//! Decoding of storage notifications delivered to the receiver.
//!
//! Object keys arrive URL-encoded (`+` for space, `%XX` escapes) and are
//! decoded before anything else sees them.

use ingest_core::event::{IdempotencyKey, EVENT_SOURCE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}

impl ObjectRef {
    /// `(key, version)`, falling back to the sequencer and then the eTag when
    /// the source store is unversioned.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            key: self.key.clone(),
            version: self
                .version_id
                .clone()
                .or_else(|| self.sequencer.clone())
                .or_else(|| self.etag.clone())
                .unwrap_or_default(),
        }
    }

    pub fn extension(&self) -> Option<&str> {
        let file_name = self.key.rsplit('/').next().unwrap_or_default();
        file_name
            .rsplit_once('.')
            .map(|(_, extension)| extension)
            .filter(|extension| !extension.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationError {
    #[error("event has no Records array")]
    MissingRecords,
    #[error("record {index} is malformed: {reason}")]
    Malformed { index: usize, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawS3 {
    bucket: RawBucket,
    object: RawObject,
}

#[derive(Debug, Deserialize)]
struct RawBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(default, rename = "eTag")]
    etag: Option<String>,
    #[serde(default, rename = "versionId")]
    version_id: Option<String>,
    #[serde(default)]
    sequencer: Option<String>,
}

/// Extracts the storage records of a notification. Records from other event
/// sources are logged and skipped; an S3 record without bucket or key is an
/// error.
pub fn decode_records(event: &Value) -> Result<Vec<ObjectRef>, NotificationError> {
    let records = event
        .get("Records")
        .and_then(Value::as_array)
        .ok_or(NotificationError::MissingRecords)?;

    let mut objects = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let source = record.get("eventSource").and_then(Value::as_str);
        if source != Some(EVENT_SOURCE) {
            warn!(
                component = "email_receiver",
                event = "record_skipped",
                index,
                event_source = source.unwrap_or("<missing>"),
            );
            continue;
        }

        let s3 = record
            .get("s3")
            .cloned()
            .ok_or_else(|| NotificationError::Malformed {
                index,
                reason: "missing s3 section".to_string(),
            })?;
        let raw: RawS3 =
            serde_json::from_value(s3).map_err(|error| NotificationError::Malformed {
                index,
                reason: error.to_string(),
            })?;

        objects.push(ObjectRef {
            bucket: raw.bucket.name,
            key: decode_key(&raw.object.key),
            version_id: raw.object.version_id,
            size: raw.object.size,
            etag: raw.object.etag,
            sequencer: raw.object.sequencer,
            event_name: record
                .get("eventName")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    Ok(objects)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Form-style URL decoding. Malformed escapes are kept verbatim.
pub fn decode_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' if index + 2 < bytes.len() => {
                match (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                    (Some(high), Some(low)) => {
                        decoded.push((high << 4) | low);
                        index += 3;
                    }
                    _ => {
                        decoded.push(b'%');
                        index += 1;
                    }
                }
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8(decoded).unwrap_or_else(|_| raw.to_string())
}
