//! Test fixtures for torrent testing.
//!
//! Descriptor builders with real piece hashes and a clock that only moves
//! when told to.

use std::time::Duration;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::time::Instant;

use super::parsing::{FileEntry, TorrentDescriptor};
use super::tracker::Clock;
use super::InfoHash;

/// SHA-1 of `data` as a fixed array.
pub fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

/// Builds a descriptor for files with the given contents.
///
/// Returns the descriptor together with the concatenated payload the piece
/// hashes were computed over.
pub fn descriptor_for_files(files: &[Vec<u8>], piece_length: u32) -> (TorrentDescriptor, Vec<u8>) {
    let payload: Vec<u8> = files.iter().flatten().copied().collect();
    let piece_hashes = payload
        .chunks(piece_length.max(1) as usize)
        .map(sha1_of)
        .collect();

    let entries = files
        .iter()
        .enumerate()
        .map(|(index, contents)| FileEntry {
            path: vec!["fixture".to_string(), format!("file-{index}.bin")],
            length: contents.len() as u64,
        })
        .collect();

    let descriptor = TorrentDescriptor {
        announce_urls: vec!["udp://tracker.test:6969/announce".to_string()],
        name: "fixture".to_string(),
        piece_length,
        piece_hashes,
        files: entries,
        info_hash: InfoHash::new(sha1_of(&payload)),
        total_size: payload.len() as u64,
    };
    (descriptor, payload)
}

/// Deterministic payload of `length` bytes.
pub fn patterned_payload(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i % 251) as u8).collect()
}

/// Clock advanced explicitly by tests.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}
