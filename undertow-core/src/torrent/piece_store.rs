//! Piece arena shared by every peer session of one torrent
//!
//! Tracks which pieces are available, claimed by a session, or downloaded,
//! and fans verified pieces out to their files. All state lives behind one
//! lock; sessions only ever see claims.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::parsing::TorrentDescriptor;
use super::tracker::ProgressSource;
use super::PieceIndex;
use crate::storage::{FileId, FileSink, StorageError};

/// Intersection of one piece with one output file's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub file: FileId,
    pub size: u64,
    pub offset_in_file: u64,
}

/// Capability proving the holder owns the occupancy lock of a piece.
///
/// Only `PieceAllocator::occupy` creates claims and they cannot be cloned,
/// so at most one session holds a claim per index.
#[derive(Debug, PartialEq, Eq)]
pub struct PieceClaim {
    index: PieceIndex,
    length: u64,
    hash: [u8; 20],
}

impl PieceClaim {
    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }
}

/// Errors from claiming, releasing and committing pieces.
#[derive(Debug, thiserror::Error)]
pub enum PieceError {
    #[error("Piece {index} is already occupied")]
    AlreadyOccupied { index: PieceIndex },

    #[error("Piece {index} is already downloaded")]
    AlreadyDownloaded { index: PieceIndex },

    #[error("Piece {index} is not occupied")]
    NotOccupied { index: PieceIndex },

    #[error("Piece {index} does not exist")]
    UnknownPiece { index: PieceIndex },

    #[error("Peer has no piece we need")]
    NoPieceNeeded,

    #[error("Piece {index} failed hash verification")]
    CorruptedPiece { index: PieceIndex },

    #[error("Piece {index} expects {expected} bytes, got {actual}")]
    LengthMismatch {
        index: PieceIndex,
        expected: u64,
        actual: u64,
    },

    #[error("Piece {index} is missing blocks")]
    Incomplete { index: PieceIndex },

    #[error("Piece layout mismatch: {reason}")]
    LayoutMismatch { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PieceError {
    /// Errors that only a broken occupancy discipline can produce.
    pub fn is_concurrency_violation(&self) -> bool {
        matches!(
            self,
            PieceError::AlreadyOccupied { .. } | PieceError::NotOccupied { .. }
        )
    }
}

/// Piece allocation interface consumed by peer sessions.
#[async_trait]
pub trait PieceAllocator: Send + Sync {
    /// Total number of pieces in the torrent.
    fn piece_count(&self) -> usize;

    /// Indexes neither occupied nor downloaded, ascending.
    fn needed_indexes(&self) -> Vec<PieceIndex>;

    /// Claims a piece for exclusive download.
    ///
    /// # Errors
    ///
    /// - `PieceError::AlreadyOccupied` - If another session holds the piece
    /// - `PieceError::AlreadyDownloaded` - If the piece is done
    /// - `PieceError::UnknownPiece` - If the index is out of range
    fn occupy(&self, index: PieceIndex) -> Result<PieceClaim, PieceError>;

    /// Gives up a claim without downloading the piece.
    ///
    /// # Errors
    ///
    /// - `PieceError::NotOccupied` - If nobody holds the piece
    /// - `PieceError::UnknownPiece` - If the index is out of range
    fn release(&self, index: PieceIndex) -> Result<(), PieceError>;

    /// Writes a verified piece to its files and marks it downloaded.
    ///
    /// The hash is not checked here. On error the piece stays occupied and
    /// the caller still owns the release.
    ///
    /// # Errors
    ///
    /// - `PieceError::LengthMismatch` - If `bytes` is not the piece size
    /// - `PieceError::NotOccupied` - If the claim no longer matches the arena
    /// - `PieceError::Storage` - If the file sink failed
    async fn commit(&self, claim: PieceClaim, bytes: &[u8]) -> Result<(), PieceError>;

    /// True once every piece is downloaded.
    fn is_complete(&self) -> bool;
}

#[derive(Debug)]
struct Piece {
    hash: [u8; 20],
    size: u64,
    parts: Vec<Part>,
    occupied: bool,
    downloaded: bool,
}

impl Piece {
    fn is_available(&self) -> bool {
        !self.occupied && !self.downloaded
    }
}

/// Owns every piece of one torrent and the sink they are written to.
pub struct PieceStore {
    pieces: Mutex<Vec<Piece>>,
    sink: Arc<dyn FileSink>,
    total_size: u64,
}

impl PieceStore {
    /// Builds the piece arena for `descriptor`, writing through `sink`.
    ///
    /// # Errors
    ///
    /// - `PieceError::LayoutMismatch` - If the file layout yields a different
    ///   number of pieces than the descriptor has hashes
    pub fn new(descriptor: &TorrentDescriptor, sink: Arc<dyn FileSink>) -> Result<Self, PieceError> {
        let layout = build_pieces(descriptor)?;
        let pieces = layout
            .into_iter()
            .zip(&descriptor.piece_hashes)
            .map(|(parts, hash)| Piece {
                hash: *hash,
                size: parts.iter().map(|part| part.size).sum(),
                parts,
                occupied: false,
                downloaded: false,
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            "PieceStore: {} pieces over {} files, {} bytes",
            pieces.len(),
            descriptor.files.len(),
            descriptor.total_size
        );

        Ok(Self {
            pieces: Mutex::new(pieces),
            sink,
            total_size: descriptor.total_size,
        })
    }

    /// Size of piece `index` in bytes.
    pub fn piece_length(&self, index: PieceIndex) -> Option<u64> {
        self.pieces.lock().get(index.as_usize()).map(|piece| piece.size)
    }

    /// Parts of piece `index` in payload order.
    pub fn parts(&self, index: PieceIndex) -> Option<Vec<Part>> {
        self.pieces
            .lock()
            .get(index.as_usize())
            .map(|piece| piece.parts.clone())
    }

    /// Sum of the sizes of downloaded pieces.
    pub fn bytes_downloaded(&self) -> u64 {
        self.pieces
            .lock()
            .iter()
            .filter(|piece| piece.downloaded)
            .map(|piece| piece.size)
            .sum()
    }

    /// Number of pieces downloaded so far.
    pub fn downloaded_count(&self) -> usize {
        self.pieces
            .lock()
            .iter()
            .filter(|piece| piece.downloaded)
            .count()
    }
}

#[async_trait]
impl PieceAllocator for PieceStore {
    fn piece_count(&self) -> usize {
        self.pieces.lock().len()
    }

    fn needed_indexes(&self) -> Vec<PieceIndex> {
        self.pieces
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, piece)| piece.is_available())
            .map(|(index, _)| PieceIndex::new(index as u32))
            .collect()
    }

    fn occupy(&self, index: PieceIndex) -> Result<PieceClaim, PieceError> {
        let mut pieces = self.pieces.lock();
        let piece = pieces
            .get_mut(index.as_usize())
            .ok_or(PieceError::UnknownPiece { index })?;

        if piece.occupied {
            return Err(PieceError::AlreadyOccupied { index });
        }
        if piece.downloaded {
            return Err(PieceError::AlreadyDownloaded { index });
        }

        piece.occupied = true;
        tracing::trace!("PieceStore: occupied piece {index}");
        Ok(PieceClaim {
            index,
            length: piece.size,
            hash: piece.hash,
        })
    }

    fn release(&self, index: PieceIndex) -> Result<(), PieceError> {
        let mut pieces = self.pieces.lock();
        let piece = pieces
            .get_mut(index.as_usize())
            .ok_or(PieceError::UnknownPiece { index })?;

        if !piece.occupied {
            return Err(PieceError::NotOccupied { index });
        }

        piece.occupied = false;
        tracing::trace!("PieceStore: released piece {index}");
        Ok(())
    }

    async fn commit(&self, claim: PieceClaim, bytes: &[u8]) -> Result<(), PieceError> {
        let index = claim.index;
        let parts = {
            let pieces = self.pieces.lock();
            let piece = pieces
                .get(index.as_usize())
                .ok_or(PieceError::UnknownPiece { index })?;
            if !piece.occupied {
                return Err(PieceError::NotOccupied { index });
            }
            if piece.size != bytes.len() as u64 {
                return Err(PieceError::LengthMismatch {
                    index,
                    expected: piece.size,
                    actual: bytes.len() as u64,
                });
            }
            piece.parts.clone()
        };

        let mut remaining = bytes;
        for part in &parts {
            let (slice, rest) = remaining.split_at(part.size as usize);
            self.sink.write(part.file, part.offset_in_file, slice).await?;
            remaining = rest;
        }

        let mut pieces = self.pieces.lock();
        let piece = pieces
            .get_mut(index.as_usize())
            .ok_or(PieceError::UnknownPiece { index })?;
        piece.occupied = false;
        piece.downloaded = true;
        tracing::debug!("PieceStore: committed piece {index} ({} parts)", parts.len());
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.pieces.lock().iter().all(|piece| piece.downloaded)
    }
}

impl ProgressSource for PieceStore {
    fn bytes_downloaded(&self) -> u64 {
        PieceStore::bytes_downloaded(self)
    }

    fn bytes_uploaded(&self) -> u64 {
        0
    }

    fn bytes_left(&self) -> u64 {
        self.total_size.saturating_sub(PieceStore::bytes_downloaded(self))
    }
}

/// Sizes of the parts a file of `length` bytes is cut into.
///
/// `first_budget` is the room left in the piece the file starts in. A
/// zero-length file contributes no parts.
pub fn split_file_into_parts(length: u64, first_budget: u64, piece_length: u64) -> Vec<u64> {
    if length == 0 {
        return Vec::new();
    }
    if first_budget >= length {
        return vec![length];
    }

    let mut sizes = vec![first_budget];
    let mut remaining = length - first_budget;
    while remaining > 0 {
        let size = remaining.min(piece_length);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

/// Groups every file's parts into pieces, in file order.
///
/// # Errors
///
/// - `PieceError::LayoutMismatch` - If the piece length is zero or the piece
///   count disagrees with the hash count
pub fn build_pieces(descriptor: &TorrentDescriptor) -> Result<Vec<Vec<Part>>, PieceError> {
    let piece_length = u64::from(descriptor.piece_length);
    if piece_length == 0 {
        return Err(PieceError::LayoutMismatch {
            reason: "piece length is zero".to_string(),
        });
    }

    let mut layout = Vec::with_capacity(descriptor.piece_hashes.len());
    let mut current = Vec::new();
    let mut filled = 0u64;

    for (file, entry) in descriptor.files.iter().enumerate() {
        let mut offset_in_file = 0;
        for size in split_file_into_parts(entry.length, piece_length - filled, piece_length) {
            current.push(Part {
                file,
                size,
                offset_in_file,
            });
            offset_in_file += size;
            filled += size;
            if filled == piece_length {
                layout.push(std::mem::take(&mut current));
                filled = 0;
            }
        }
    }
    if !current.is_empty() {
        layout.push(current);
    }

    if layout.len() != descriptor.piece_hashes.len() {
        return Err(PieceError::LayoutMismatch {
            reason: format!(
                "files yield {} pieces but torrent lists {} hashes",
                layout.len(),
                descriptor.piece_hashes.len()
            ),
        });
    }
    Ok(layout)
}
