use mainframe_model::ModelError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{operation} kept conflicting after {attempts} attempts")]
    StoreConflictExhausted {
        operation: &'static str,
        attempts: u16,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid verdict: {0}")]
    InvalidVerdict(String),
}

impl CoreError {
    /// Transient failures may succeed when the caller tries again later.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::StoreConflictExhausted { .. } => true,
            CoreError::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    /// The store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CoreError::Store(StoreError::Unavailable(_)))
    }
}

impl From<ModelError> for CoreError {
    fn from(err: ModelError) -> Self {
        CoreError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
