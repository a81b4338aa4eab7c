use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ingest_core::config::DeploymentConfig;
use ingest_core::graph::ingestion_graph;
use ingest_core::orchestrator::{Orchestrator, SimulatedPlatform};
use ingest_core::storage::{InMemoryObjectStore, ObjectStore};
use ingest_lambda::adapters::object_reader::{ObjectHead, ObjectReader};
use ingest_lambda::adapters::processor::{DocumentProcessor, ProcessedDocument};
use ingest_lambda::adapters::ProcessError;
use ingest_lambda::handlers::receiver::{handle_notification, ReceiptProcessor};
use ingest_lambda::notification::ObjectRef;

const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn deployed() -> SimulatedPlatform {
    let config: DeploymentConfig = serde_json::from_value(serde_json::json!({
        "bucket_name": "insurance-emails",
        "stage": "dev",
        "function_name": "email-receiver",
        "filter": { "prefix": "incoming/", "suffix": ".pdf" }
    }))
    .expect("config");
    let mut platform = SimulatedPlatform::new();
    let report = platform
        .apply(&ingestion_graph(&config, HASH).expect("graph"))
        .expect("apply");
    assert!(report.is_success());
    platform
}

/// Reads object metadata straight out of the simulated store.
struct StoreBackedReader {
    store: Arc<InMemoryObjectStore>,
}

impl ObjectReader for StoreBackedReader {
    fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectHead, ProcessError> {
        if bucket != self.store.name() {
            return Err(ProcessError::PermissionDenied(bucket.to_string()));
        }
        let bytes = self
            .store
            .get(key, version_id)
            .map_err(|error| ProcessError::NotFound(error.to_string()))?;
        Ok(ObjectHead {
            size: bytes.len() as u64,
            ..ObjectHead::default()
        })
    }
}

/// Counts how often each document was handed over.
#[derive(Default)]
struct CapturingProcessor {
    seen: Mutex<BTreeMap<String, usize>>,
}

impl DocumentProcessor for CapturingProcessor {
    fn process(&self, object: &ObjectRef) -> Result<ProcessedDocument, ProcessError> {
        *self
            .seen
            .lock()
            .expect("poisoned mutex")
            .entry(object.key.clone())
            .or_default() += 1;
        Ok(ProcessedDocument {
            bucket: object.bucket.clone(),
            file: object.key.clone(),
            version_id: object.version_id.clone(),
            document_type: "pdf".to_string(),
            size: object.size,
            processed_at: "2024-02-04T10:00:00Z".to_string(),
            next_step: "Send to extraction queue".to_string(),
        })
    }
}

#[test]
fn routed_upload_reaches_the_receiver_as_a_storage_notification() {
    let platform = deployed();
    let store = platform.store("insurance-emails").expect("store");
    store
        .put("incoming/claim 123 (final).pdf", b"%PDF-1.7")
        .expect("put");

    let delivery = platform.router().poll().expect("delivery");
    let notification = delivery.event.to_notification(&delivery.subscription_id);

    let processor = ReceiptProcessor::new(
        StoreBackedReader {
            store: Arc::clone(&store),
        },
        "insurance-emails",
        "2024-02-04T10:00:00Z",
    );
    let response = handle_notification(&notification, &processor).expect("response");
    assert_eq!(response.status_code, 200);

    let body = response.body_json();
    assert_eq!(body["details"][0]["file"], "incoming/claim 123 (final).pdf");
    assert_eq!(body["details"][0]["size"], 8);
    assert!(platform.router().ack(delivery.delivery_id));
}

#[test]
fn redelivered_event_carries_the_same_idempotency_key() {
    let platform = deployed();
    let store = platform.store("insurance-emails").expect("store");
    store.put("incoming/claim123.pdf", b"%PDF").expect("put");

    let processor = CapturingProcessor::default();
    let first = platform.router().poll().expect("delivery");
    handle_notification(&first.event.to_notification("pdf"), &processor).expect("first");

    // The ack is lost, so the router hands the same event over again.
    assert_eq!(platform.router().redeliver_unacked(), 1);
    let again = platform.router().poll().expect("redelivery");
    assert_eq!(again.event.idempotency_key(), first.event.idempotency_key());
    let response =
        handle_notification(&again.event.to_notification("pdf"), &processor).expect("again");
    assert_eq!(response.status_code, 200);

    let seen = processor.seen.lock().expect("poisoned mutex");
    assert_eq!(seen.get("incoming/claim123.pdf"), Some(&2));
}
