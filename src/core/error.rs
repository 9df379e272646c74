//! Error types for the brick pool and octree

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the brick pool and the octree built on top of it
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No evictable buffer available: all {slots} RAM slots hold bricks in use")]
    ResourceExhausted { slots: usize },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Brick pool manager not initialized")]
    NotInitialized,

    #[error("Brick pool manager already initialized")]
    AlreadyInitialized,

    #[error("Invalid virtual address {0}")]
    InvalidAddress(u64),

    #[error("Brick {0} is in use")]
    BrickInUse(u64),

    #[error("Brick {0} is being written")]
    BrickBeingWritten(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Octree error: {0}")]
    Octree(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O error together with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attach a path to an `std::io::Result`
pub trait IoContext<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T, Error>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T, Error> {
        self.map_err(|e| Error::io(path, e))
    }
}
