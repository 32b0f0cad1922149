//! BitTorrent wire protocol abstractions and message types.
//!
//! BitTorrent peer-to-peer protocol implementation following BEP 3.
//! Defines message types, the fixed handshake layout, bitfield packing and
//! the buffered link that turns a byte stream into messages.

pub mod bitfield;
pub mod handshake;
pub mod link;
pub mod messages;
pub mod types;

// Re-export public API
pub use handshake::{HANDSHAKE_LENGTH, HandshakeCodec};
pub use link::{LinkReader, LinkWriter, MAX_FRAME_LENGTH, PeerLink};
pub use messages::MessageCodec;
pub use types::{PROTOCOL_NAME, PeerError, PeerHandshake, PeerId, PeerMessage};
