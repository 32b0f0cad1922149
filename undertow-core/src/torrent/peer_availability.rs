//! Pieces a remote peer has announced

use super::PieceIndex;
use super::protocol::PeerError;

/// Record of the pieces a remote peer claims to have.
///
/// Filled from at most one Bitfield plus any number of Have messages.
#[derive(Debug, Clone)]
pub struct PeerAvailability {
    pieces: Vec<bool>,
    bitfield_received: bool,
}

impl PeerAvailability {
    pub fn new(piece_count: usize) -> Self {
        Self {
            pieces: vec![false; piece_count],
            bitfield_received: false,
        }
    }

    /// Applies the peer's Bitfield message.
    ///
    /// Bits are truncated or padded to the torrent's piece count.
    ///
    /// # Errors
    ///
    /// - `PeerError::DuplicateBitfield` - If a bitfield was already applied
    pub fn set_bitfield(&mut self, pieces: &[bool]) -> Result<(), PeerError> {
        if self.bitfield_received {
            return Err(PeerError::DuplicateBitfield);
        }
        self.bitfield_received = true;
        for (slot, has) in self.pieces.iter_mut().zip(pieces) {
            *slot = *has;
        }
        Ok(())
    }

    /// Applies a Have message.
    ///
    /// # Errors
    ///
    /// - `PeerError::ProtocolViolation` - If the index is outside the torrent
    pub fn notify_have(&mut self, index: PieceIndex) -> Result<(), PeerError> {
        let piece_count = self.pieces.len();
        let slot = self.pieces.get_mut(index.as_usize()).ok_or_else(|| {
            PeerError::violation(format!(
                "Have for piece {index} beyond piece count {piece_count}"
            ))
        })?;
        *slot = true;
        Ok(())
    }

    pub fn has(&self, index: PieceIndex) -> bool {
        self.pieces.get(index.as_usize()).copied().unwrap_or(false)
    }

    /// True if the peer has any of `needed`.
    pub fn has_needed_piece(&self, needed: &[PieceIndex]) -> bool {
        needed.iter().any(|index| self.has(*index))
    }

    pub fn bitfield(&self) -> &[bool] {
        &self.pieces
    }

    pub fn bitfield_received(&self) -> bool {
        self.bitfield_received
    }
}
