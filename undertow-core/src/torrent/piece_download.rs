//! Scoped download of one piece from one peer
//!
//! `PieceDownloadSession` owns a claim for its whole lifetime. `finish`
//! verifies and commits; every other way out of scope, including a dropped
//! future, hands the piece back to the allocator.

use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::PieceIndex;
use super::piece_store::{PieceAllocator, PieceClaim, PieceError};
use super::protocol::{PeerError, PeerMessage};

/// Request messages covering one piece, in offset order.
///
/// Holds nothing but a cursor, so a clone starts over from where the
/// original stood.
#[derive(Debug, Clone)]
pub struct BlockRequests {
    piece_index: PieceIndex,
    length: u64,
    block_size: u32,
    cursor: u64,
}

impl BlockRequests {
    pub fn new(piece_index: PieceIndex, length: u64, block_size: u32) -> Self {
        Self {
            piece_index,
            length,
            block_size: block_size.max(1),
            cursor: 0,
        }
    }
}

impl Iterator for BlockRequests {
    type Item = PeerMessage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.length {
            return None;
        }
        let length = (self.length - self.cursor).min(u64::from(self.block_size));
        let request = PeerMessage::Request {
            piece_index: self.piece_index,
            offset: self.cursor as u32,
            length: length as u32,
        };
        self.cursor += length;
        Some(request)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.length.saturating_sub(self.cursor);
        let count = remaining.div_ceil(u64::from(self.block_size)) as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for BlockRequests {}

/// One attempt at downloading one piece.
pub struct PieceDownloadSession {
    allocator: Arc<dyn PieceAllocator>,
    claim: Option<PieceClaim>,
    index: PieceIndex,
    length: u64,
    block_size: Option<u32>,
    blocks: Vec<Option<Bytes>>,
    received: usize,
    settled: bool,
}

impl PieceDownloadSession {
    /// Claims the first candidate the peer has.
    ///
    /// Candidates lost to a concurrent session are skipped.
    ///
    /// # Errors
    ///
    /// - `PieceError::NoPieceNeeded` - If no candidate could be claimed
    /// - `PieceError::UnknownPiece` - If a candidate is outside the torrent
    pub fn begin(
        allocator: Arc<dyn PieceAllocator>,
        candidates: &[PieceIndex],
        peer_bitfield: &[bool],
    ) -> Result<Self, PieceError> {
        for &index in candidates {
            if !peer_bitfield.get(index.as_usize()).copied().unwrap_or(false) {
                continue;
            }
            match allocator.occupy(index) {
                Ok(claim) => {
                    tracing::debug!("PieceDownloadSession: claimed piece {index}");
                    return Ok(Self {
                        index,
                        length: claim.length(),
                        claim: Some(claim),
                        allocator,
                        block_size: None,
                        blocks: Vec::new(),
                        received: 0,
                        settled: false,
                    });
                }
                Err(PieceError::AlreadyOccupied { .. } | PieceError::AlreadyDownloaded { .. }) => {
                    tracing::trace!("PieceDownloadSession: piece {index} taken, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Err(PieceError::NoPieceNeeded)
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Requests covering the whole piece in `block_size` chunks.
    ///
    /// Fixes the block grid that arriving blocks are checked against.
    pub fn requests(&mut self, block_size: u32) -> BlockRequests {
        let requests = BlockRequests::new(self.index, self.length, block_size);
        let block_size = block_size.max(1);
        if self.block_size != Some(block_size) {
            self.block_size = Some(block_size);
            self.blocks = vec![None; requests.size_hint().0];
            self.received = 0;
        }
        requests
    }

    /// Stores a received block.
    ///
    /// Blocks may arrive in any order. A repeated block is ignored.
    ///
    /// # Errors
    ///
    /// - `PeerError::ProtocolViolation` - If the block belongs to another
    ///   piece, was never requested, or has the wrong length
    pub fn add_block(&mut self, index: PieceIndex, offset: u32, data: Bytes) -> Result<(), PeerError> {
        if index != self.index {
            return Err(PeerError::violation(format!(
                "Block for piece {index} while downloading piece {}",
                self.index
            )));
        }
        let Some(block_size) = self.block_size else {
            return Err(PeerError::violation("Block arrived before any request"));
        };

        let slot = (offset / block_size) as usize;
        if offset % block_size != 0 || slot >= self.blocks.len() {
            return Err(PeerError::violation(format!(
                "Unrequested block at offset {offset} of piece {index}"
            )));
        }
        let expected = (self.length - u64::from(offset)).min(u64::from(block_size));
        if data.len() as u64 != expected {
            return Err(PeerError::violation(format!(
                "Block at offset {offset} of piece {index} has {} bytes, expected {expected}",
                data.len()
            )));
        }

        if self.blocks[slot].is_some() {
            tracing::debug!("PieceDownloadSession: duplicate block {offset} of piece {index}");
            return Ok(());
        }
        self.blocks[slot] = Some(data);
        self.received += 1;
        Ok(())
    }

    /// True once every requested block has arrived.
    pub fn is_complete(&self) -> bool {
        !self.blocks.is_empty() && self.received == self.blocks.len()
    }

    /// Verifies the assembled piece and commits it.
    ///
    /// # Errors
    ///
    /// - `PieceError::Incomplete` - If blocks are missing
    /// - `PieceError::CorruptedPiece` - If the SHA-1 does not match
    /// - Any error from `PieceAllocator::commit`
    ///
    /// On error the claim is released and the piece is available again.
    pub async fn finish(mut self) -> Result<(), PieceError> {
        let index = self.index;
        if !self.is_complete() {
            return Err(PieceError::Incomplete { index });
        }

        let mut buffer = Vec::with_capacity(self.length as usize);
        for block in self.blocks.iter().flatten() {
            buffer.extend_from_slice(block);
        }

        let Some(claim) = self.claim.take() else {
            return Err(PieceError::NotOccupied { index });
        };
        let digest = Sha1::digest(&buffer);
        if digest.as_slice() != claim.hash() {
            tracing::debug!("PieceDownloadSession: piece {index} failed hash check");
            return Err(PieceError::CorruptedPiece { index });
        }

        self.allocator.commit(claim, &buffer).await?;
        self.settled = true;
        tracing::debug!("PieceDownloadSession: piece {index} verified and committed");
        Ok(())
    }
}

impl Drop for PieceDownloadSession {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.allocator.release(self.index) {
            tracing::error!(
                "PieceDownloadSession: failed to release piece {}: {e}",
                self.index
            );
            debug_assert!(!e.is_concurrency_violation(), "release of piece {} failed: {e}", self.index);
        } else {
            tracing::trace!("PieceDownloadSession: released piece {}", self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_fixtures::{FailingSink, MemorySink};
    use crate::torrent::PieceStore;
    use crate::torrent::test_fixtures::{descriptor_for_files, patterned_payload};

    fn store_with(payload: &[u8], piece_length: u32) -> (Arc<PieceStore>, Arc<MemorySink>) {
        let (descriptor, _) = descriptor_for_files(&[payload.to_vec()], piece_length);
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(PieceStore::new(&descriptor, sink.clone()).unwrap());
        (store, sink)
    }

    fn indexes(raw: &[u32]) -> Vec<PieceIndex> {
        raw.iter().copied().map(PieceIndex::new).collect()
    }

    #[test]
    fn test_block_requests_bound_last_block() {
        let requests: Vec<_> = BlockRequests::new(PieceIndex::new(3), 25, 10).collect();
        assert_eq!(
            requests,
            vec![
                PeerMessage::Request {
                    piece_index: PieceIndex::new(3),
                    offset: 0,
                    length: 10
                },
                PeerMessage::Request {
                    piece_index: PieceIndex::new(3),
                    offset: 10,
                    length: 10
                },
                PeerMessage::Request {
                    piece_index: PieceIndex::new(3),
                    offset: 20,
                    length: 5
                },
            ]
        );
    }

    #[test]
    fn test_block_requests_clone_restarts_from_cursor() {
        let mut requests = BlockRequests::new(PieceIndex::new(0), 30, 10);
        assert_eq!(requests.size_hint(), (3, Some(3)));
        requests.next();

        let replay: Vec<_> = requests.clone().collect();
        assert_eq!(replay.len(), 2);
        assert_eq!(requests.count(), 2);
    }

    #[test]
    fn test_begin_claims_first_piece_peer_has() {
        let (store, _) = store_with(&patterned_payload(30), 10);
        let allocator: Arc<dyn PieceAllocator> = store.clone();

        let session =
            PieceDownloadSession::begin(allocator, &indexes(&[0, 1, 2]), &[false, true, true]).unwrap();

        assert_eq!(session.index(), PieceIndex::new(1));
        assert_eq!(store.needed_indexes(), indexes(&[0, 2]));
    }

    #[test]
    fn test_begin_skips_claimed_pieces() {
        let (store, _) = store_with(&patterned_payload(30), 10);
        let _first = PieceDownloadSession::begin(store.clone(), &indexes(&[0, 1, 2]), &[true; 3]).unwrap();

        let second = PieceDownloadSession::begin(store.clone(), &indexes(&[0, 1, 2]), &[true; 3]).unwrap();
        assert_eq!(second.index(), PieceIndex::new(1));
    }

    #[test]
    fn test_begin_without_match_fails() {
        let (store, _) = store_with(&patterned_payload(20), 10);

        let result = PieceDownloadSession::begin(store.clone(), &indexes(&[0, 1]), &[false, false]);
        assert!(matches!(result, Err(PieceError::NoPieceNeeded)));

        let result = PieceDownloadSession::begin(store, &[], &[true, true]);
        assert!(matches!(result, Err(PieceError::NoPieceNeeded)));
    }

    #[tokio::test]
    async fn test_out_of_order_blocks_commit() {
        let payload = patterned_payload(25);
        let (store, sink) = store_with(&payload, 25);

        let mut session = PieceDownloadSession::begin(store.clone(), &indexes(&[0]), &[true]).unwrap();
        let requests: Vec<_> = session.requests(10).collect();
        assert_eq!(requests.len(), 3);

        let index = PieceIndex::new(0);
        session
            .add_block(index, 20, Bytes::copy_from_slice(&payload[20..]))
            .unwrap();
        session
            .add_block(index, 0, Bytes::copy_from_slice(&payload[..10]))
            .unwrap();
        assert!(!session.is_complete());
        session
            .add_block(index, 10, Bytes::copy_from_slice(&payload[10..20]))
            .unwrap();
        assert!(session.is_complete());

        session.finish().await.unwrap();
        assert!(store.is_complete());
        assert_eq!(sink.file_contents(0), payload);
    }

    #[tokio::test]
    async fn test_duplicate_block_is_ignored() {
        let payload = patterned_payload(20);
        let (store, _) = store_with(&payload, 20);
        let index = PieceIndex::new(0);

        let mut session = PieceDownloadSession::begin(store.clone(), &[index], &[true]).unwrap();
        let _ = session.requests(10);
        session
            .add_block(index, 0, Bytes::copy_from_slice(&payload[..10]))
            .unwrap();
        session
            .add_block(index, 0, Bytes::from_static(&[0xff; 10]))
            .unwrap();
        session
            .add_block(index, 10, Bytes::copy_from_slice(&payload[10..]))
            .unwrap();

        session.finish().await.unwrap();
        assert!(store.is_complete());
    }

    #[test]
    fn test_unexpected_blocks_are_violations() {
        let (store, _) = store_with(&patterned_payload(25), 25);
        let index = PieceIndex::new(0);
        let mut session = PieceDownloadSession::begin(store, &[index], &[true]).unwrap();

        let early = session.add_block(index, 0, Bytes::from_static(&[0; 10]));
        assert!(matches!(early, Err(PeerError::ProtocolViolation { .. })));

        let _ = session.requests(10);
        let cases = [
            (PieceIndex::new(1), 0, 10),
            (index, 5, 10),
            (index, 30, 10),
            (index, 10, 4),
            (index, 20, 10),
        ];
        for (piece, offset, length) in cases {
            let result = session.add_block(piece, offset, Bytes::from(vec![0; length]));
            assert!(
                matches!(result, Err(PeerError::ProtocolViolation { .. })),
                "piece {piece} offset {offset} length {length}"
            );
        }
    }

    #[tokio::test]
    async fn test_corrupted_piece_is_released() {
        let (store, sink) = store_with(&patterned_payload(10), 10);
        let index = PieceIndex::new(0);

        let mut session = PieceDownloadSession::begin(store.clone(), &[index], &[true]).unwrap();
        let _ = session.requests(10);
        session.add_block(index, 0, Bytes::from_static(&[0xaa; 10])).unwrap();

        let result = session.finish().await;
        assert!(matches!(result, Err(PieceError::CorruptedPiece { index: i }) if i == index));
        assert_eq!(store.needed_indexes(), vec![index]);
        assert_eq!(sink.write_count(), 0);
    }

    #[tokio::test]
    async fn test_incomplete_finish_releases() {
        let (store, _) = store_with(&patterned_payload(20), 20);
        let index = PieceIndex::new(0);

        let mut session = PieceDownloadSession::begin(store.clone(), &[index], &[true]).unwrap();
        let _ = session.requests(10);

        let result = session.finish().await;
        assert!(matches!(result, Err(PieceError::Incomplete { .. })));
        assert_eq!(store.needed_indexes(), vec![index]);
    }

    #[test]
    fn test_drop_releases_claim() {
        let (store, _) = store_with(&patterned_payload(20), 10);

        let session = PieceDownloadSession::begin(store.clone(), &indexes(&[0]), &[true, true]).unwrap();
        assert_eq!(store.needed_indexes(), indexes(&[1]));

        drop(session);
        assert_eq!(store.needed_indexes(), indexes(&[0, 1]));
        assert!(!store.is_complete());
    }

    #[tokio::test]
    async fn test_failed_commit_releases() {
        let payload = patterned_payload(10);
        let (descriptor, _) = descriptor_for_files(&[payload.clone()], 10);
        let store = Arc::new(PieceStore::new(&descriptor, Arc::new(FailingSink)).unwrap());
        let index = PieceIndex::new(0);

        let mut session = PieceDownloadSession::begin(store.clone(), &[index], &[true]).unwrap();
        let _ = session.requests(16384);
        session.add_block(index, 0, Bytes::from(payload)).unwrap();

        let result = session.finish().await;
        assert!(matches!(result, Err(PieceError::Storage(_))));
        assert_eq!(store.needed_indexes(), vec![index]);
    }

    #[tokio::test]
    async fn test_cancelled_owner_releases_claim() {
        let (store, _) = store_with(&patterned_payload(10), 10);
        let allocator: Arc<dyn PieceAllocator> = store.clone();

        let task = tokio::spawn(async move {
            let _session = PieceDownloadSession::begin(allocator, &indexes(&[0]), &[true]).unwrap();
            std::future::pending::<()>().await;
        });
        while !store.needed_indexes().is_empty() {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;
        assert_eq!(store.needed_indexes(), indexes(&[0]));
    }
}
