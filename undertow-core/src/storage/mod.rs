//! Storage layer for torrent data.
//!
//! Defines the file sink that verified pieces are written through, with a
//! disk-backed implementation rooted at the download directory.

pub mod file_storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::path::PathBuf;

use async_trait::async_trait;
pub use file_storage::FileStorage;

/// Position of a file in the torrent descriptor's file list.
pub type FileId = usize;

/// Destination for verified piece bytes.
///
/// Receives each part of a committed piece with its file-relative offset.
/// Implementations must accept writes in any order.
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Writes `bytes` at `offset` within `file`.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownFile` - If `file` is not part of the layout
    /// - `StorageError::Io` - If the file system operation failed
    async fn write(&self, file: FileId, offset: u64, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Write addressed a file outside the torrent layout
    #[error("File {file} is not part of the torrent")]
    UnknownFile {
        /// Offending file identifier
        file: FileId,
    },

    /// Torrent path would escape the download directory
    #[error("Unsafe path in torrent: {path}")]
    InvalidPath {
        /// Path as listed in the torrent
        path: PathBuf,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
