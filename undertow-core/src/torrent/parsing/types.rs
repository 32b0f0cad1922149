//! Core types for decoded torrent metadata

use std::path::Path;

use async_trait::async_trait;

use super::super::{InfoHash, TorrentError};

/// Everything needed to download one torrent.
///
/// Immutable once decoded. File entries appear in the order the pieces
/// cover them.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentDescriptor {
    pub announce_urls: Vec<String>,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub info_hash: InfoHash,
    pub total_size: u64,
}

impl TorrentDescriptor {
    /// Number of pieces the payload is split into.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }
}

/// Individual file within a torrent.
///
/// Path components are relative to the download directory. Multi-file
/// torrents are rooted under the torrent name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

/// Decodes torrent metadata from bencoded sources.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses a descriptor from raw `.torrent` bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentDescriptor, TorrentError>;

    /// Reads a `.torrent` file from disk and parses it.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Parsing failure
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentDescriptor, TorrentError>;
}
