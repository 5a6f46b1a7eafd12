use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The candidate list could not be loaded. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read candidate list {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to create empty candidate list {path:?}: {source}")]
    Init { path: PathBuf, source: io::Error },

    #[error("candidate list {path:?} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("candidate list {path:?} must be a JSON array of address strings")]
    NotArray { path: PathBuf },

    #[error("candidate list {path:?}: entry {index} is not a string")]
    InvalidEntry { path: PathBuf, index: usize },
}

/// The status record could not be written. The previous record stays in place.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to serialize status record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write status record {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// The status record could not be read back by a front-end.
#[derive(Debug, Error)]
pub enum StatusReadError {
    #[error("status record {path:?} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to read status record {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("status record {path:?} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
