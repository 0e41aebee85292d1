use huddle_retry::RequestError;
use thiserror::Error;

/// Errors from conflict detection, resolution and migration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("local and remote profiles diverge: {}", .0.join("; "))]
    Conflict(Vec<String>),

    #[error("manual resolution requested without override data")]
    MissingOverride,

    #[error("invalid manual override: {0}")]
    InvalidOverride(String),

    #[error(transparent)]
    Request(#[from] RequestError),
}

impl ReconcileError {
    /// Whether repeating the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
