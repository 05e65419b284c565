use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while reading worker session files.
#[derive(Debug, Error)]
pub enum SessionLogError {
    #[error("failed to read session file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk sessions directory `{path}`: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no session file found for thread {0}")]
    NotFound(String),
}
