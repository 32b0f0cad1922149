//! BitTorrent handshake serialization and deserialization

use super::types::{PROTOCOL_NAME, PeerError, PeerHandshake, PeerId};
use crate::torrent::InfoHash;

/// Fixed handshake size: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LENGTH: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LENGTH);
        buf.push(PROTOCOL_NAME.len() as u8);
        buf.extend_from_slice(PROTOCOL_NAME);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `PeerError::InvalidHandshake` - Wrong length or protocol identifier
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, PeerError> {
        if data.len() != HANDSHAKE_LENGTH {
            return Err(PeerError::InvalidHandshake {
                reason: format!("expected {HANDSHAKE_LENGTH} bytes, got {}", data.len()),
            });
        }

        if data[0] as usize != PROTOCOL_NAME.len() || &data[1..20] != PROTOCOL_NAME {
            return Err(PeerError::InvalidHandshake {
                reason: "unknown protocol identifier".to_string(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}
