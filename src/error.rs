//! Error types for zdap

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error on {dataset}: {message}")]
    Storage { dataset: String, message: String },

    #[error("container engine error: {0}")]
    Container(String),

    #[error("container operation timed out: {0}")]
    ContainerTimeout(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("no clones available for resource '{0}'")]
    ClaimUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("script '{script}' failed: {message}")]
    Script { script: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Storage error carrying the dataset path it concerns.
    pub fn storage(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Storage {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}
