//! Undertow Core - BitTorrent download engine
//!
//! This crate provides the building blocks for downloading a torrent from a
//! swarm: tracker communication, the peer wire protocol, hash-verified piece
//! allocation, file storage and configuration management.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use storage::{FileStorage, StorageError};
pub use torrent::TorrentError;

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::Tracker(torrent::TrackerError::NoTrackerLeft) => {
                    "Every tracker failed, no more peers can be found".to_string()
                }
                TorrentError::Tracker(_) => "Tracker communication failed".to_string(),
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Storage(_) => "Storage error occurred".to_string(),
            UndertowError::Configuration { reason } => format!("Configuration error: {reason}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
