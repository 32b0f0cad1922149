//! BitTorrent download engine: wire protocol, piece allocation and trackers

pub mod parsing;
pub mod peer_availability;
pub mod peer_session;
pub mod piece_download;
pub mod piece_store;
pub mod protocol;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;
pub mod tracker;

use std::fmt;

pub use parsing::{FileEntry, TorrentDescriptor, TorrentParser};
pub use peer_availability::PeerAvailability;
pub use peer_session::{PeerSession, PeerSessionState, SessionContext};
pub use piece_download::{BlockRequests, PieceDownloadSession};
pub use piece_store::{Part, PieceAllocator, PieceClaim, PieceError, PieceStore};
pub use protocol::{PeerError, PeerHandshake, PeerId, PeerLink, PeerMessage};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, ProgressSource, TrackerClient,
    TrackerError, TrackerManager,
};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the bencoded info dictionary. Peers and trackers
/// use it to agree on which swarm is being discussed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index for addressing piece arrays and bitfields.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Aggregates the per-subsystem errors so the orchestrator can propagate
/// any of them with `?`.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
