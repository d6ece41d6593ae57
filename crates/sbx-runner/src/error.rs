use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "could not acquire catalog lock for '{label}' at {} within {waited_ms}ms: {cause}",
        path.display()
    )]
    Timeout {
        label: String,
        path: PathBuf,
        waited_ms: u128,
        cause: String,
    },
    #[error("catalog lock for '{label}' at {}: {source}", path.display())]
    Io {
        label: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("catalog file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode catalog: {0}")]
    Encode(#[from] serde_json::Error),
}
