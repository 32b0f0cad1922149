//! Core types and errors for the BitTorrent wire protocol

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::torrent::piece_store::PieceError;
use crate::torrent::{InfoHash, PieceIndex};

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        // Azureus-style client prefix
        id[..8].copy_from_slice(b"-UT0001-");
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// BitTorrent wire protocol messages.
///
/// Every length-framed message type exchanged after the handshake.
/// Keep-alives are consumed by the link and never surface as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Peer will not answer requests
    Choke,
    /// Peer will answer requests
    Unchoke,
    /// We want pieces the peer has
    Interested,
    /// We no longer want anything from the peer
    NotInterested,
    /// Peer acquired a piece
    Have {
        /// Index of the acquired piece
        piece_index: PieceIndex,
    },
    /// Peer's complete piece availability, one flag per piece
    Bitfield {
        /// Availability flags truncated to the torrent's piece count
        pieces: Vec<bool>,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// A block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The block bytes
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// Peer's DHT port
    Port { port: u16 },
}

impl PeerMessage {
    /// Short message name for logging without dumping payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not_interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers. The info hash must match on both sides
/// before any other message is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake with no extension bits set.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Errors that end or interrupt a peer conversation.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Invalid handshake: {reason}")]
    InvalidHandshake { reason: String },

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Peer sent a second bitfield")]
    DuplicateBitfield,

    #[error("Peer choked us while blocks were requested")]
    ChokedWhileRequesting,

    #[error("No data from peer within {after:?}")]
    Timeout { after: Duration },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: SocketAddr, reason: String },

    #[error("Peer closed the connection")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),
}

impl PeerError {
    pub(crate) fn violation(message: impl Into<String>) -> Self {
        PeerError::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Whether the session can go back to negotiation after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PeerError::ChokedWhileRequesting
                | PeerError::Piece(PieceError::NoPieceNeeded)
                | PeerError::Piece(PieceError::CorruptedPiece { .. })
        )
    }
}
