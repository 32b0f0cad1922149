//! Torrent metainfo decoding.
//!
//! Turns `.torrent` files into immutable descriptors using bencode-rs, with
//! the info hash computed over the exact bencoded `info` bytes.

pub mod bencode;
pub mod parser;
pub mod types;

// Re-export public API
pub use parser::BencodeTorrentParser;
pub use types::{FileEntry, TorrentDescriptor, TorrentParser};

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::torrent::TorrentError;

    #[tokio::test]
    async fn test_torrent_file_parsing() {
        let parser = BencodeTorrentParser::new();

        let mut torrent_data =
            b"d8:announce14:udp://t.test:14:infod6:lengthi64e4:name5:movie12:piece lengthi32e6:pieces40:"
                .to_vec();
        torrent_data.extend_from_slice(&[4u8; 40]);
        torrent_data.extend_from_slice(b"ee");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&torrent_data).unwrap();

        let descriptor = parser.parse_torrent_file(file.path()).await.unwrap();
        assert_eq!(descriptor.name, "movie");
        assert_eq!(descriptor.piece_count(), 2);
        assert_eq!(descriptor.total_size, 64);
        assert_eq!(descriptor.announce_urls, vec!["udp://t.test:1"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let parser = BencodeTorrentParser::new();
        let temp_dir = tempfile::tempdir().unwrap();

        let result = parser
            .parse_torrent_file(&temp_dir.path().join("absent.torrent"))
            .await;
        assert!(matches!(result, Err(TorrentError::Io(_))));
    }

    #[tokio::test]
    async fn test_invalid_torrent_data() {
        let parser = BencodeTorrentParser::new();

        let result = parser.parse_torrent_data(b"invalid torrent data").await;
        assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));
    }
}
