use std::collections::BTreeSet;

use ingest_core::event::IdempotencyKey;
use ingest_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::adapters::object_reader::ObjectReader;
use crate::adapters::processor::{DocumentProcessor, ProcessedDocument};
use crate::adapters::ProcessError;
use crate::notification::{decode_records, NotificationError, ObjectRef};

pub const NEXT_STEP: &str = "Send to extraction queue";
pub const SUCCESS_MESSAGE: &str = "Email received for processing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl ReceiverResponse {
    fn json(status_code: u16, body: Value) -> Self {
        Self {
            status_code,
            body: body.to_string(),
        }
    }

    fn error(status_code: u16, error: &str, details: Option<String>) -> Self {
        let mut body = json!({ "error": error });
        if let Some(details) = details {
            body["details"] = Value::from(details);
        }
        Self::json(status_code, body)
    }

    pub fn body_json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

/// Non-retryable outcome of one record. Ordered by precedence when a batch
/// mixes failures: a permission problem outranks a missing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFailureKind {
    PermissionDenied,
    ObjectNotFound,
}

impl RecordFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::ObjectNotFound => "object_not_found",
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            Self::PermissionDenied => 403,
            Self::ObjectNotFound => 404,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub bucket: String,
    pub file: String,
    pub error: RecordFailureKind,
    pub reason: String,
}

impl RecordFailure {
    fn new(object: &ObjectRef, error: RecordFailureKind, reason: String) -> Self {
        Self {
            bucket: object.bucket.clone(),
            file: object.key.clone(),
            error,
            reason,
        }
    }
}

/// Confirms each object exists and is readable before handing it on. The
/// object itself is never fetched or changed here.
pub struct ReceiptProcessor<R> {
    reader: R,
    bucket: String,
    processed_at: String,
}

impl<R: ObjectReader> ReceiptProcessor<R> {
    pub fn new(reader: R, bucket: impl Into<String>, processed_at: impl Into<String>) -> Self {
        Self {
            reader,
            bucket: bucket.into(),
            processed_at: processed_at.into(),
        }
    }
}

impl<R: ObjectReader> DocumentProcessor for ReceiptProcessor<R> {
    fn process(&self, object: &ObjectRef) -> Result<ProcessedDocument, ProcessError> {
        if object.bucket != self.bucket {
            return Err(ProcessError::PermissionDenied(format!(
                "bucket '{}' is outside the configured ingest bucket '{}'",
                object.bucket, self.bucket
            )));
        }

        let head = self
            .reader
            .head_object(&object.bucket, &object.key, object.version_id.as_deref())?;

        Ok(ProcessedDocument {
            bucket: object.bucket.clone(),
            file: object.key.clone(),
            version_id: head.version_id.or_else(|| object.version_id.clone()),
            document_type: object
                .extension()
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| "unknown".to_string()),
            size: head.size,
            processed_at: self.processed_at.clone(),
            next_step: NEXT_STEP.to_string(),
        })
    }
}

/// Handles one storage notification. Every record in the batch is attempted;
/// records that fail for good are listed under `failures` and decide the
/// non-2xx status. Only transient failures are returned as `Err` so the
/// platform retries the invocation.
pub fn handle_notification(
    event: &Value,
    processor: &dyn DocumentProcessor,
) -> Result<ReceiverResponse, Error> {
    let objects = match decode_records(event) {
        Ok(objects) => objects,
        Err(NotificationError::MissingRecords) => {
            warn!(component = "email_receiver", event = "invalid_event");
            return Ok(ReceiverResponse::error(400, "Invalid event - no records", None));
        }
        Err(malformed @ NotificationError::Malformed { .. }) => {
            error!(component = "email_receiver", event = "malformed_record", error = %malformed);
            return Ok(ReceiverResponse::error(
                500,
                "Internal server error",
                Some(malformed.to_string()),
            ));
        }
    };

    if objects.is_empty() {
        return Ok(ReceiverResponse::error(400, "No S3 events found", None));
    }

    let mut seen: BTreeSet<IdempotencyKey> = BTreeSet::new();
    let mut details = Vec::with_capacity(objects.len());
    let mut failures = Vec::new();
    for object in &objects {
        if !seen.insert(object.idempotency_key()) {
            info!(
                component = "email_receiver",
                event = "duplicate_record_skipped",
                bucket = %object.bucket,
                key = %object.key,
            );
            continue;
        }

        match processor.process(object) {
            Ok(document) => {
                info!(
                    component = "email_receiver",
                    event = "document_received",
                    bucket = %document.bucket,
                    key = %document.file,
                    document_type = %document.document_type,
                    size = document.size,
                );
                details.push(document);
            }
            Err(ProcessError::Transient(reason)) => {
                // The whole batch comes back; processors must be idempotent.
                warn!(component = "email_receiver", event = "transient_failure", key = %object.key, reason = %reason);
                return Err(Error::TransientInvocationFailure(format!(
                    "{}/{}: {reason}",
                    object.bucket, object.key
                )));
            }
            Err(ProcessError::PermissionDenied(reason)) => {
                error!(component = "email_receiver", event = "permission_denied", key = %object.key, reason = %reason);
                failures.push(RecordFailure::new(object, RecordFailureKind::PermissionDenied, reason));
            }
            Err(ProcessError::NotFound(reason)) => {
                warn!(component = "email_receiver", event = "object_missing", key = %object.key, reason = %reason);
                failures.push(RecordFailure::new(object, RecordFailureKind::ObjectNotFound, reason));
            }
        }
    }

    let Some(status) = failures.iter().map(|failure| failure.error).min() else {
        return Ok(ReceiverResponse::json(
            200,
            json!({
                "status": "success",
                "message": SUCCESS_MESSAGE,
                "details": details,
            }),
        ));
    };

    Ok(ReceiverResponse::json(
        status.status_code(),
        json!({
            "error": status.as_str(),
            "message": format!(
                "{} of {} records could not be processed",
                failures.len(),
                failures.len() + details.len()
            ),
            "details": details,
            "failures": failures,
        }),
    ))
}
