//! UDP tracker datagram encoding and decoding (BEP 15)

use bytes::{Buf, BufMut};

use super::protocol::{constants, parse_compact_peers};
use super::types::{AnnounceRequest, AnnounceResponse, TrackerError};

/// Decoded tracker datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpResponse {
    Connect {
        transaction_id: u32,
        connection_id: u64,
    },
    Announce {
        transaction_id: u32,
        response: AnnounceResponse,
    },
    Error {
        transaction_id: u32,
        message: String,
    },
}

impl UdpResponse {
    pub fn transaction_id(&self) -> u32 {
        match self {
            UdpResponse::Connect { transaction_id, .. }
            | UdpResponse::Announce { transaction_id, .. }
            | UdpResponse::Error { transaction_id, .. } => *transaction_id,
        }
    }
}

fn malformed(reason: impl Into<String>) -> TrackerError {
    TrackerError::MalformedResponse {
        reason: reason.into(),
    }
}

/// Stateless codec for UDP tracker datagrams.
pub struct UdpTrackerCodec;

impl UdpTrackerCodec {
    /// Connect request: protocol id, action 0, transaction id.
    pub fn encode_connect(transaction_id: u32) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(constants::CONNECT_REQUEST_SIZE);
        datagram.put_u64(constants::UDP_PROTOCOL_ID);
        datagram.put_u32(constants::ACTION_CONNECT);
        datagram.put_u32(transaction_id);
        datagram
    }

    /// Announce request of exactly 98 bytes.
    pub fn encode_announce(
        connection_id: u64,
        transaction_id: u32,
        key: u32,
        request: &AnnounceRequest,
    ) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(constants::ANNOUNCE_REQUEST_SIZE);
        datagram.put_u64(connection_id);
        datagram.put_u32(constants::ACTION_ANNOUNCE);
        datagram.put_u32(transaction_id);
        datagram.put_slice(request.info_hash.as_bytes());
        datagram.put_slice(request.peer_id.as_bytes());
        datagram.put_u64(request.downloaded);
        datagram.put_u64(request.left);
        datagram.put_u64(request.uploaded);
        datagram.put_u32(request.event.as_udp_code());
        datagram.put_u32(0); // ip: use sender address
        datagram.put_u32(key);
        datagram.put_i32(constants::NUM_WANT_DEFAULT);
        datagram.put_u16(request.port);
        datagram
    }

    /// Decodes any tracker reply.
    ///
    /// # Errors
    ///
    /// - `TrackerError::MalformedResponse` - If the datagram is truncated or
    ///   carries an unknown action
    pub fn decode_response(datagram: &[u8]) -> Result<UdpResponse, TrackerError> {
        if datagram.len() < constants::RESPONSE_HEADER_SIZE {
            return Err(malformed(format!("{}-byte datagram", datagram.len())));
        }

        let mut cursor = datagram;
        let action = cursor.get_u32();
        let transaction_id = cursor.get_u32();

        match action {
            constants::ACTION_CONNECT => {
                if cursor.remaining() < 8 {
                    return Err(malformed("connect reply without connection id"));
                }
                Ok(UdpResponse::Connect {
                    transaction_id,
                    connection_id: cursor.get_u64(),
                })
            }
            constants::ACTION_ANNOUNCE => {
                if datagram.len() < constants::ANNOUNCE_RESPONSE_HEADER_SIZE {
                    return Err(malformed("announce reply shorter than its header"));
                }
                let interval = cursor.get_u32();
                let leechers = cursor.get_u32();
                let seeders = cursor.get_u32();
                Ok(UdpResponse::Announce {
                    transaction_id,
                    response: AnnounceResponse {
                        interval,
                        peers: parse_compact_peers(cursor)?,
                        seeders: Some(seeders),
                        leechers: Some(leechers),
                    },
                })
            }
            constants::ACTION_ERROR => Ok(UdpResponse::Error {
                transaction_id,
                message: String::from_utf8_lossy(cursor).into_owned(),
            }),
            other => Err(malformed(format!("unknown action {other}"))),
        }
    }
}
