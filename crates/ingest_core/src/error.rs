use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("build failure: {0}")]
    BuildFailure(String),

    #[error(
        "no deployable artifact at '{}'; run `cargo run -p xtask -- package` before provisioning",
        path.display()
    )]
    MissingArtifact { path: PathBuf },

    #[error("notification misconfiguration for '{subscription}': {reason}")]
    NotificationMisconfiguration {
        subscription: String,
        reason: String,
    },

    #[error("permission denied: '{principal}' may not {action} on {resource}")]
    PermissionDenied {
        principal: String,
        action: String,
        resource: String,
    },

    #[error("transient invocation failure: {0}")]
    TransientInvocationFailure(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("dependency cycle detected at {0}")]
    DependencyCycle(String),

    #[error("resource '{referenced}' referenced by '{by}' is not declared")]
    UnknownResource { referenced: String, by: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::BuildFailure(message.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn misconfigured(subscription: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotificationMisconfiguration {
            subscription: subscription.into(),
            reason: reason.into(),
        }
    }

    /// Only transient invocation failures are worth another attempt; every
    /// provisioning error is fatal for the current apply.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientInvocationFailure(_))
    }
}
