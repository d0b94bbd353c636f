use thiserror::Error;

/// Typed failure taxonomy for both messaging services. The REST layer maps
/// these to status codes; the gateway maps them to a single `Error` event
/// delivered to the initiating connection only.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("validation: {0}")]
    Validation(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    /// Stable machine-readable code carried on gateway error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
        }
    }
}
