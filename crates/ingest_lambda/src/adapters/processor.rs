use serde::{Deserialize, Serialize};

use super::ProcessError;
use crate::notification::ObjectRef;

/// What the receiver reports back for one accepted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub bucket: String,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub document_type: String,
    pub size: u64,
    pub processed_at: String,
    pub next_step: String,
}

/// Business logic behind the receiver. Must tolerate the same object being
/// handed over more than once.
pub trait DocumentProcessor {
    fn process(&self, object: &ObjectRef) -> Result<ProcessedDocument, ProcessError>;
}
