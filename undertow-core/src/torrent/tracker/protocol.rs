//! BitTorrent tracker protocol utilities and constants

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use super::types::TrackerError;

/// BitTorrent tracker protocol constants
pub mod constants {
    /// Compact peer entry: 4-byte IPv4 address plus 2-byte port
    pub const COMPACT_PEER_SIZE: usize = 6;

    /// Magic constant opening every UDP connect request
    pub const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;

    pub const ACTION_CONNECT: u32 = 0;
    pub const ACTION_ANNOUNCE: u32 = 1;
    pub const ACTION_ERROR: u32 = 3;

    /// Size of a UDP connect request
    pub const CONNECT_REQUEST_SIZE: usize = 16;

    /// Size of a UDP announce request
    pub const ANNOUNCE_REQUEST_SIZE: usize = 98;

    /// Action plus transaction id
    pub const RESPONSE_HEADER_SIZE: usize = 8;

    /// Header plus interval, leechers and seeders
    pub const ANNOUNCE_RESPONSE_HEADER_SIZE: usize = 20;

    /// Ask the tracker for its default number of peers
    pub const NUM_WANT_DEFAULT: i32 = -1;
}

/// URL encoding utilities for tracker communication
pub mod encoding {
    /// Percent-encodes raw bytes for a tracker query parameter.
    pub fn url_encode_bytes(bytes: &[u8]) -> String {
        urlencoding::encode_binary(bytes).into_owned()
    }
}

/// Decodes a compact peer list of 6-byte IPv4 entries.
///
/// # Errors
///
/// - `TrackerError::MalformedResponse` - If the length is not a multiple of 6
pub fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if peer_bytes.len() % constants::COMPACT_PEER_SIZE != 0 {
        return Err(TrackerError::MalformedResponse {
            reason: format!("compact peer list of {} bytes", peer_bytes.len()),
        });
    }

    Ok(peer_bytes
        .chunks_exact(constants::COMPACT_PEER_SIZE)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_id_constant() {
        assert_eq!(constants::UDP_PROTOCOL_ID, 0x41727101980);
    }

    #[test]
    fn test_url_encoding_binary_data() {
        let encoded = encoding::url_encode_bytes(&[0x00, 0xFF, b'a', b'-', 0x80]);
        assert_eq!(encoded, "%00%FFa-%80");
    }

    #[test]
    fn test_parse_compact_peers() {
        let peer_bytes = [
            127, 0, 0, 1, 26, 225, // 127.0.0.1:6881
            192, 168, 1, 100, 195, 80, // 192.168.1.100:50000
        ];

        let peers = parse_compact_peers(&peer_bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "192.168.1.100:50000");
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_compact_peers_invalid_length() {
        let result = parse_compact_peers(&[127, 0, 0, 1, 26]);
        assert!(matches!(result, Err(TrackerError::MalformedResponse { .. })));
    }
}
