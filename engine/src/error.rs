use huddle_reconcile::ReconcileError;
use huddle_retry::RequestError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation requires an authenticated user")]
    NotAuthenticated,

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
