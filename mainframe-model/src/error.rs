use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidPackage(String),
    InvalidStatus(String),
    InvalidUrl(String),
    InvalidWorker(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidPackage(msg) => {
                write!(f, "invalid package: {msg}")
            }
            ModelError::InvalidStatus(raw) => {
                write!(f, "unknown package status: {raw}")
            }
            ModelError::InvalidUrl(msg) => {
                write!(f, "invalid distribution url: {msg}")
            }
            ModelError::InvalidWorker(msg) => {
                write!(f, "invalid worker id: {msg}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
