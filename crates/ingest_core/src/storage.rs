//! Durable object store model: the event source of the pipeline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::event::{format_sequencer, EventSink, ObjectCreatedEvent, OBJECT_CREATED_PUT};

pub const MAX_KEY_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Encryption {
    Aes256,
    Kms { key_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAccessBlock {
    pub block_public_acls: bool,
    pub ignore_public_acls: bool,
    pub block_public_policy: bool,
    pub restrict_public_buckets: bool,
}

impl PublicAccessBlock {
    pub fn all_blocked() -> Self {
        Self {
            block_public_acls: true,
            ignore_public_acls: true,
            block_public_policy: true,
            restrict_public_buckets: true,
        }
    }

    pub fn is_fully_blocked(&self) -> bool {
        self.block_public_acls
            && self.ignore_public_acls
            && self.block_public_policy
            && self.restrict_public_buckets
    }
}

impl Default for PublicAccessBlock {
    fn default() -> Self {
        Self::all_blocked()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub versioning: bool,
    pub encryption: Encryption,
    #[serde(default)]
    pub public_access: PublicAccessBlock,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            versioning: false,
            encryption: Encryption::Aes256,
            public_access: PublicAccessBlock::all_blocked(),
        }
    }
}

impl StoreSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.public_access.is_fully_blocked() {
            return Err(Error::validation(
                "object store must block all public ACLs and policies",
            ));
        }
        if let Encryption::Kms { key_id } = &self.encryption {
            if key_id.trim().is_empty() {
                return Err(Error::validation("KMS encryption requires a key id"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub version_id: Option<String>,
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub sequencer: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub version_id: Option<String>,
    pub sequencer: u64,
    pub content_hash: String,
}

pub trait ObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<PutReceipt>;
    fn get(&self, key: &str, version_id: Option<&str>) -> Result<Vec<u8>>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Default)]
struct StoreState {
    settings: StoreSettings,
    /// Versions per key, oldest first. Unversioned keys hold exactly one.
    objects: BTreeMap<String, Vec<StoredObject>>,
    next_sequencer: u64,
}

/// In-memory store. Concurrent writers need no external locking; each `put`
/// is applied atomically and emits its own event after the write commits.
pub struct InMemoryObjectStore {
    name: String,
    state: Mutex<StoreState>,
    sink: Arc<dyn EventSink>,
}

impl InMemoryObjectStore {
    pub fn new(name: impl Into<String>, settings: StoreSettings, sink: Arc<dyn EventSink>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(StoreState {
                settings,
                ..StoreState::default()
            }),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> StoreSettings {
        self.lock().settings.clone()
    }

    /// Existing objects keep their version ids when versioning is toggled.
    pub fn update_settings(&self, settings: StoreSettings) {
        self.lock().settings = settings;
    }

    pub fn versions(&self, key: &str) -> Vec<StoredObject> {
        self.lock().objects.get(key).cloned().unwrap_or_default()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<PutReceipt> {
        if key.is_empty() {
            return Err(Error::validation("object key cannot be empty"));
        }
        if key.len() > MAX_KEY_BYTES {
            return Err(Error::validation(format!(
                "object key exceeds {MAX_KEY_BYTES} bytes"
            )));
        }

        let now = Utc::now();
        let content_hash = content_hash(bytes);
        let object = {
            let mut state = self.lock();
            state.next_sequencer += 1;
            let sequencer = state.next_sequencer;
            let version_id = state
                .settings
                .versioning
                .then(|| format_sequencer(sequencer));

            let object = StoredObject {
                key: key.to_string(),
                version_id,
                bytes: bytes.to_vec(),
                content_hash: content_hash.clone(),
                created_at: now,
                sequencer,
            };
            let versioning = state.settings.versioning;
            let versions = state.objects.entry(key.to_string()).or_default();
            if !versioning {
                versions.clear();
            }
            versions.push(object.clone());
            object
        };

        self.sink.emit(ObjectCreatedEvent {
            bucket: self.name.clone(),
            key: object.key.clone(),
            version_id: object.version_id.clone(),
            event_name: OBJECT_CREATED_PUT.to_string(),
            sequencer: object.sequencer,
            size: object.bytes.len() as u64,
            content_hash: object.content_hash.clone(),
            event_time: now,
        });

        Ok(PutReceipt {
            key: object.key,
            version_id: object.version_id,
            sequencer: object.sequencer,
            content_hash,
        })
    }

    fn get(&self, key: &str, version_id: Option<&str>) -> Result<Vec<u8>> {
        let state = self.lock();
        let versions = state.objects.get(key).ok_or_else(|| Error::NotFound {
            kind: "object",
            name: format!("{}/{key}", self.name),
        })?;

        let found = match version_id {
            None => versions.last(),
            Some(requested) => versions
                .iter()
                .find(|object| object.version_id.as_deref() == Some(requested)),
        };

        found
            .map(|object| object.bytes.clone())
            .ok_or_else(|| Error::NotFound {
                kind: "object version",
                name: format!("{}/{key}@{}", self.name, version_id.unwrap_or("latest")),
            })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.lock();
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CapturingSink {
        events: Mutex<Vec<ObjectCreatedEvent>>,
    }

    impl CapturingSink {
        fn events(&self) -> Vec<ObjectCreatedEvent> {
            self.events.lock().expect("poisoned mutex").clone()
        }
    }

    impl EventSink for CapturingSink {
        fn emit(&self, event: ObjectCreatedEvent) {
            self.events.lock().expect("poisoned mutex").push(event);
        }
    }

    fn store(versioning: bool) -> (InMemoryObjectStore, Arc<CapturingSink>) {
        let sink = Arc::new(CapturingSink::default());
        let store = InMemoryObjectStore::new(
            "insurance-emails",
            StoreSettings {
                versioning,
                ..StoreSettings::default()
            },
            sink.clone(),
        );
        (store, sink)
    }

    #[test]
    fn default_settings_block_public_access_and_encrypt() {
        let settings = StoreSettings::default();
        assert!(settings.public_access.is_fully_blocked());
        assert_eq!(settings.encryption, Encryption::Aes256);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn settings_with_public_access_are_rejected() {
        let settings = StoreSettings {
            public_access: PublicAccessBlock {
                block_public_policy: false,
                ..PublicAccessBlock::all_blocked()
            },
            ..StoreSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn each_put_emits_exactly_one_event() {
        let (store, sink) = store(false);
        store
            .put("incoming/claim123.pdf", b"%PDF-1.7")
            .expect("put should succeed");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "incoming/claim123.pdf");
        assert_eq!(events[0].size, 8);
        assert_eq!(events[0].content_hash, content_hash(b"%PDF-1.7"));
    }

    #[test]
    fn versioned_overwrite_keeps_prior_version_readable() {
        let (store, _) = store(true);
        let first = store.put("incoming/a.pdf", b"one").expect("put");
        let second = store.put("incoming/a.pdf", b"two").expect("put");

        assert_ne!(first.version_id, second.version_id);
        assert_eq!(store.get("incoming/a.pdf", None).expect("get"), b"two");
        assert_eq!(
            store
                .get("incoming/a.pdf", first.version_id.as_deref())
                .expect("get old version"),
            b"one"
        );
        assert_eq!(store.versions("incoming/a.pdf").len(), 2);
    }

    #[test]
    fn unversioned_overwrite_replaces_object_but_events_stay_distinct() {
        let (store, sink) = store(false);
        store.put("incoming/a.pdf", b"one").expect("put");
        store.put("incoming/a.pdf", b"two").expect("put");

        assert_eq!(store.versions("incoming/a.pdf").len(), 1);
        assert_eq!(store.get("incoming/a.pdf", None).expect("get"), b"two");

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.version_id.is_none()));
        assert_ne!(events[0].idempotency_key(), events[1].idempotency_key());
    }

    #[test]
    fn list_returns_sorted_keys_under_prefix() {
        let (store, _) = store(false);
        for key in ["incoming/b.pdf", "archive/x.pdf", "incoming/a.eml"] {
            store.put(key, b"x").expect("put");
        }
        assert_eq!(
            store.list("incoming/").expect("list"),
            vec!["incoming/a.eml".to_string(), "incoming/b.pdf".to_string()]
        );
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let (store, _) = store(false);
        let error = store.get("missing.pdf", None).expect_err("missing key");
        assert!(matches!(error, Error::NotFound { kind: "object", .. }));
    }

    #[test]
    fn empty_key_is_rejected_without_event() {
        let (store, sink) = store(false);
        assert!(store.put("", b"x").is_err());
        assert!(sink.events().is_empty());
    }
}
