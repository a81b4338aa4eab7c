pub mod object_reader;
pub mod processor;

/// Failure reported by an adapter. Only `Transient` is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
}
