//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::bitfield;
use super::types::{PeerError, PeerMessage};
use crate::torrent::PieceIndex;

/// Message identifiers following BEP 3
pub mod message_id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
}

/// Size of the big-endian length prefix on every framed message.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Message serialization for the BitTorrent wire protocol.
///
/// Stateless apart from the torrent's piece count, which bitfield decoding
/// needs to drop padding bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCodec {
    piece_count: usize,
}

impl MessageCodec {
    /// Creates codec for a torrent with `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self { piece_count }
    }

    /// Number of pieces bitfields are decoded to.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Serializes peer message including its length prefix.
    pub fn serialize_message(&self, message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::Choke => Self::put_header(&mut buf, 0, message_id::CHOKE),
            PeerMessage::Unchoke => Self::put_header(&mut buf, 0, message_id::UNCHOKE),
            PeerMessage::Interested => Self::put_header(&mut buf, 0, message_id::INTERESTED),
            PeerMessage::NotInterested => {
                Self::put_header(&mut buf, 0, message_id::NOT_INTERESTED)
            }
            PeerMessage::Have { piece_index } => {
                Self::put_header(&mut buf, 4, message_id::HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { pieces } => {
                let packed = bitfield::pack(pieces);
                Self::put_header(&mut buf, packed.len(), message_id::BITFIELD);
                buf.extend_from_slice(&packed);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 12, message_id::REQUEST);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(&mut buf, 8 + data.len(), message_id::PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 12, message_id::CANCEL);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                Self::put_header(&mut buf, 2, message_id::PORT);
                buf.put_u16(*port);
            }
        }

        buf
    }

    fn put_header(buf: &mut Vec<u8>, payload_len: usize, id: u8) {
        buf.put_u32(1 + payload_len as u32);
        buf.put_u8(id);
    }

    /// Deserializes one complete frame, length prefix included.
    ///
    /// # Errors
    ///
    /// - `PeerError::ProtocolViolation` - Truncated frame, keep-alive, bad
    ///   payload size for the message id, or unknown message id
    pub fn deserialize_message(&self, frame: &[u8]) -> Result<PeerMessage, PeerError> {
        if frame.len() < LENGTH_PREFIX_SIZE {
            return Err(PeerError::violation("Message too short"));
        }

        let mut buf = frame;
        let length = buf.get_u32() as usize;

        if length == 0 {
            return Err(PeerError::violation("Keep-alive carries no message"));
        }

        if buf.len() != length {
            return Err(PeerError::violation(format!(
                "Frame declares {length} bytes but holds {}",
                buf.len()
            )));
        }

        let message_id = buf.get_u8();
        let payload_len = length - 1;

        match message_id {
            message_id::CHOKE => Self::expect_empty(payload_len, PeerMessage::Choke),
            message_id::UNCHOKE => Self::expect_empty(payload_len, PeerMessage::Unchoke),
            message_id::INTERESTED => Self::expect_empty(payload_len, PeerMessage::Interested),
            message_id::NOT_INTERESTED => {
                Self::expect_empty(payload_len, PeerMessage::NotInterested)
            }
            message_id::HAVE => {
                Self::expect_payload(payload_len, 4, "Have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                })
            }
            message_id::BITFIELD => Ok(PeerMessage::Bitfield {
                pieces: bitfield::unpack(buf, self.piece_count),
            }),
            message_id::REQUEST => {
                Self::expect_payload(payload_len, 12, "Request")?;
                Ok(PeerMessage::Request {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            message_id::PIECE => {
                if payload_len < 8 {
                    return Err(PeerError::violation("Invalid Piece message length"));
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            message_id::CANCEL => {
                Self::expect_payload(payload_len, 12, "Cancel")?;
                Ok(PeerMessage::Cancel {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            message_id::PORT => {
                Self::expect_payload(payload_len, 2, "Port")?;
                Ok(PeerMessage::Port {
                    port: buf.get_u16(),
                })
            }
            _ => Err(PeerError::violation(format!(
                "Unknown message ID: {message_id}"
            ))),
        }
    }

    fn expect_empty(payload_len: usize, message: PeerMessage) -> Result<PeerMessage, PeerError> {
        if payload_len != 0 {
            return Err(PeerError::violation(format!(
                "Unexpected payload on {} message",
                message.kind()
            )));
        }
        Ok(message)
    }

    fn expect_payload(payload_len: usize, expected: usize, name: &str) -> Result<(), PeerError> {
        if payload_len != expected {
            return Err(PeerError::violation(format!(
                "Invalid {name} message length"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_fixed_layouts() {
        let codec = MessageCodec::new(8);

        assert_eq!(
            codec.serialize_message(&PeerMessage::Interested),
            vec![0, 0, 0, 1, 2]
        );
        assert_eq!(
            codec.serialize_message(&PeerMessage::Have {
                piece_index: PieceIndex::new(0x0102_0304),
            }),
            vec![0, 0, 0, 5, 4, 1, 2, 3, 4]
        );
        assert_eq!(
            codec.serialize_message(&PeerMessage::Request {
                piece_index: PieceIndex::new(1),
                offset: 16384,
                length: 16384,
            }),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]
        );
    }

    #[test]
    fn test_message_serialization() {
        let codec = MessageCodec::new(17);
        let test_cases = vec![
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(42),
            },
            PeerMessage::Request {
                piece_index: PieceIndex::new(10),
                offset: 16384,
                length: 16384,
            },
            PeerMessage::Piece {
                piece_index: PieceIndex::new(3),
                offset: 32768,
                data: Bytes::new(),
            },
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(2),
                offset: 0,
                length: 100,
            },
            PeerMessage::Port { port: 6881 },
        ];

        for original_message in test_cases {
            let serialized = codec.serialize_message(&original_message);
            let deserialized = codec.deserialize_message(&serialized).unwrap();
            assert_eq!(original_message, deserialized);
        }
    }

    #[test]
    fn test_bitfield_round_trip_for_piece_counts() {
        for count in [0usize, 1, 7, 8, 9, 17] {
            let codec = MessageCodec::new(count);
            let message = PeerMessage::Bitfield {
                pieces: (0..count).map(|i| i % 2 == 0).collect(),
            };
            let serialized = codec.serialize_message(&message);
            assert_eq!(serialized.len(), 5 + count.div_ceil(8));
            assert_eq!(codec.deserialize_message(&serialized).unwrap(), message);
        }
    }

    #[test]
    fn test_bitfield_decode_truncates_to_piece_count() {
        let codec = MessageCodec::new(3);
        let decoded = codec.deserialize_message(&[0, 0, 0, 2, 5, 0xFF]).unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Bitfield {
                pieces: vec![true, true, true]
            }
        );
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let codec = MessageCodec::new(4);

        // Truncated length prefix
        assert!(codec.deserialize_message(&[0, 0]).is_err());
        // Keep-alive is handled by the link, never by the codec
        assert!(codec.deserialize_message(&[0, 0, 0, 0]).is_err());
        // Declared length larger than the frame
        assert!(codec.deserialize_message(&[0, 0, 0, 5, 4, 0]).is_err());
        // Have with a short payload
        assert!(codec.deserialize_message(&[0, 0, 0, 3, 4, 0, 0]).is_err());
        // Choke with a payload
        assert!(codec.deserialize_message(&[0, 0, 0, 2, 0, 1]).is_err());
        // Piece without offset
        assert!(codec.deserialize_message(&[0, 0, 0, 5, 7, 0, 0, 0, 1]).is_err());

        let unknown = codec.deserialize_message(&[0, 0, 0, 1, 20]).unwrap_err();
        assert!(matches!(unknown, PeerError::ProtocolViolation { .. }));
    }

    proptest! {
        #[test]
        fn prop_piece_round_trip(
            index in any::<u32>(),
            offset in any::<u32>(),
            block in proptest::collection::vec(any::<u8>(), 0..4096),
        ) {
            let codec = MessageCodec::new(1);
            let message = PeerMessage::Piece {
                piece_index: PieceIndex::new(index),
                offset,
                data: Bytes::from(block),
            };
            let serialized = codec.serialize_message(&message);
            prop_assert_eq!(codec.deserialize_message(&serialized).unwrap(), message);
        }
    }
}
