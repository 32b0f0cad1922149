//! Bencode parsing logic and info hash calculation

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use super::types::{FileEntry, TorrentDescriptor};
use crate::torrent::{InfoHash, TorrentError};

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parse bencode data into a torrent descriptor
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing or metadata extraction failed
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> ParseResult<TorrentDescriptor> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;

        let Some(root) = parsed.first() else {
            return Err(invalid("Empty bencode data"));
        };
        let bencode_rs::Value::Dictionary(dict) = root else {
            return Err(invalid("Root element must be dictionary"));
        };

        Self::extract_descriptor(dict, torrent_bytes)
    }

    fn extract_descriptor(dict: &BencodeDict<'_>, original_data: &[u8]) -> ParseResult<TorrentDescriptor> {
        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(invalid("Missing or invalid 'info' dictionary"));
        };

        let info_hash = Self::calculate_info_hash(original_data)?;
        let name = Self::extract_string(info, b"name")?;

        let piece_length = Self::extract_integer(info, b"piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|length| *length > 0)
            .ok_or_else(|| invalid(format!("Invalid piece length: {piece_length}")))?;

        let pieces = Self::extract_bytes(info, b"pieces")?;
        if pieces.len() % 20 != 0 {
            return Err(invalid("Invalid pieces length"));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
            (Some(_), _) => vec![FileEntry {
                path: vec![name.clone()],
                length: Self::extract_length(info)?,
            }],
            (None, Some(bencode_rs::Value::List(entries))) => Self::extract_files(&name, entries)?,
            _ => return Err(invalid("Missing 'files' or 'length' field")),
        };
        let total_size = files.iter().map(|file| file.length).sum();

        Ok(TorrentDescriptor {
            announce_urls: Self::extract_announce_urls(dict)?,
            name,
            piece_length,
            piece_hashes,
            files,
            info_hash,
            total_size,
        })
    }

    /// Calculate SHA1 hash of the exact bencoded `info` value
    fn calculate_info_hash(original_data: &[u8]) -> ParseResult<InfoHash> {
        let info_bytes = Self::find_info_bytes(original_data)?;

        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());

        Ok(InfoHash::new(hash))
    }

    /// Locates the raw `info` value by walking the root dictionary's keys.
    fn find_info_bytes(data: &[u8]) -> ParseResult<&[u8]> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let key_end = pos + Self::find_element_end(&data[pos..])?;
            let value_end = key_end + Self::find_element_end(&data[key_end..])?;
            if &data[pos..key_end] == b"4:info" {
                return Ok(&data[key_end..value_end]);
            }
            pos = value_end;
        }

        Err(invalid("Could not find info dictionary in data"))
    }

    /// Length in bytes of the bencode element at the start of `data`
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the element is malformed or truncated
    pub fn find_element_end(data: &[u8]) -> ParseResult<usize> {
        let mut pos = 0;
        let mut depth = 0usize;

        loop {
            let byte = *data
                .get(pos)
                .ok_or_else(|| invalid("Incomplete bencode element"))?;
            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let end = data[pos..]
                        .iter()
                        .position(|&b| b == b'e')
                        .ok_or_else(|| invalid("Unterminated integer"))?;
                    pos += end + 1;
                }
                b'0'..=b'9' => {
                    let colon = data[pos..]
                        .iter()
                        .position(|&b| b == b':')
                        .ok_or_else(|| invalid("Invalid string format"))?;
                    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                        .ok()
                        .and_then(|digits| digits.parse().ok())
                        .ok_or_else(|| invalid("Invalid string length"))?;
                    pos += colon + 1 + length;
                    if pos > data.len() {
                        return Err(invalid("String exceeds data"));
                    }
                }
                _ => return Err(invalid("Invalid bencode character")),
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(invalid(format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_length(dict: &BencodeDict<'_>) -> ParseResult<u64> {
        let length = Self::extract_integer(dict, b"length")?;
        u64::try_from(length).map_err(|_| invalid(format!("Negative file length: {length}")))
    }

    /// Multi-file entries, each rooted under the torrent name
    fn extract_files(name: &str, entries: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<FileEntry>> {
        entries
            .iter()
            .map(|entry| {
                let bencode_rs::Value::Dictionary(file) = entry else {
                    return Err(invalid("Invalid file entry type"));
                };
                let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice()) else {
                    return Err(invalid("Missing or invalid path in file"));
                };

                let mut path = vec![name.to_string()];
                for component in components {
                    let bencode_rs::Value::Bytes(bytes) = component else {
                        return Err(invalid("Invalid path component type"));
                    };
                    let component = String::from_utf8(bytes.to_vec())
                        .map_err(|_| invalid("Invalid UTF-8 in file path"))?;
                    path.push(component);
                }

                Ok(FileEntry {
                    path,
                    length: Self::extract_length(file)?,
                })
            })
            .collect()
    }

    /// First URL of every `announce-list` tier, else `announce`, deduplicated.
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> ParseResult<Vec<String>> {
        let mut candidates = Vec::new();

        if let Some(bencode_rs::Value::List(tiers)) = dict.get(b"announce-list".as_slice()) {
            for tier in tiers {
                if let bencode_rs::Value::List(urls) = tier {
                    if let Some(bencode_rs::Value::Bytes(url)) = urls.first() {
                        candidates.push(String::from_utf8_lossy(url).into_owned());
                    }
                }
            }
        }
        if candidates.is_empty() {
            if let Ok(announce) = Self::extract_string(dict, b"announce") {
                candidates.push(announce);
            }
        }

        let mut announce_urls: Vec<String> = Vec::with_capacity(candidates.len());
        for url in candidates {
            if !announce_urls.contains(&url) {
                announce_urls.push(url);
            }
        }

        if announce_urls.is_empty() {
            return Err(invalid("No announce URLs found"));
        }
        Ok(announce_urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        hash
    }

    fn single_file_torrent() -> Vec<u8> {
        let mut data = b"d8:announce23:http://tracker.test/ann4:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:".to_vec();
        data.extend_from_slice(&[7u8; 20]);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let descriptor = BencodeParser::parse_bencode_data(&single_file_torrent()).unwrap();

        assert_eq!(descriptor.name, "test.txt");
        assert_eq!(descriptor.piece_length, 32768);
        assert_eq!(descriptor.total_size, 1000);
        assert_eq!(descriptor.piece_hashes, vec![[7u8; 20]]);
        assert_eq!(
            descriptor.files,
            vec![FileEntry {
                path: vec!["test.txt".to_string()],
                length: 1000
            }]
        );
        assert_eq!(descriptor.announce_urls, vec!["http://tracker.test/ann"]);
    }

    #[test]
    fn test_info_hash_covers_exact_info_bytes() {
        let data = single_file_torrent();
        let descriptor = BencodeParser::parse_bencode_data(&data).unwrap();

        let start = data.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let info = &data[start..data.len() - 1];
        let expected = sha1(info);

        assert_eq!(descriptor.info_hash.as_bytes(), &expected);
    }

    #[test]
    fn test_info_key_inside_string_is_not_matched() {
        // Comment value contains "4:info" before the real info key
        let mut data = b"d8:announce14:udp://t.test:17:comment6:4:info4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:".to_vec();
        data.extend_from_slice(&[1u8; 20]);
        data.extend_from_slice(b"ee");

        let descriptor = BencodeParser::parse_bencode_data(&data).unwrap();
        let start = data.windows(7).position(|w| w == b"4:infod").unwrap() + 6;
        let expected = sha1(&data[start..data.len() - 1]);

        assert_eq!(descriptor.info_hash.as_bytes(), &expected);
    }

    #[test]
    fn test_multi_file_paths_rooted_under_name() {
        let mut data = b"d8:announce14:udp://t.test:14:infod5:filesld6:lengthi3e4:pathl1:a5:x.binee\
d6:lengthi4e4:pathl5:y.bineee4:name5:album12:piece lengthi4e6:pieces40:"
            .to_vec();
        data.extend_from_slice(&[2u8; 40]);
        data.extend_from_slice(b"ee");

        let descriptor = BencodeParser::parse_bencode_data(&data).unwrap();
        assert_eq!(descriptor.total_size, 7);
        assert_eq!(descriptor.files[0].path, vec!["album", "a", "x.bin"]);
        assert_eq!(descriptor.files[1].path, vec!["album", "y.bin"]);
        assert_eq!(descriptor.piece_count(), 2);
    }

    #[test]
    fn test_announce_list_takes_first_of_each_tier() {
        let mut data = b"d8:announce15:http://a.test/a13:announce-listll15:http://a.test/a15:http://b.test/bel15:http://c.test/cel15:http://a.test/aee4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:".to_vec();
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");

        let descriptor = BencodeParser::parse_bencode_data(&data).unwrap();
        assert_eq!(
            descriptor.announce_urls,
            vec!["http://a.test/a", "http://c.test/c"]
        );
    }

    #[test]
    fn test_rejects_bad_pieces_length() {
        let data = b"d8:announce14:udp://t.test:14:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces3:abcee";
        let result = BencodeParser::parse_bencode_data(data);
        assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));
    }

    #[test]
    fn test_rejects_zero_piece_length() {
        let mut data = b"d8:announce14:udp://t.test:14:infod6:lengthi1e4:name1:a12:piece lengthi0e6:pieces20:".to_vec();
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");

        let result = BencodeParser::parse_bencode_data(&data);
        assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));
    }

    #[test]
    fn test_rejects_missing_trackers() {
        let mut data = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:".to_vec();
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");

        let result = BencodeParser::parse_bencode_data(&data);
        assert!(result.is_err());
    }

    #[test]
    fn test_find_element_end_nested() {
        let data = b"d3:keyd4:namei42eee";
        assert_eq!(BencodeParser::find_element_end(data).unwrap(), data.len());

        let data = b"d4:listl4:testi42eeetrailing";
        assert_eq!(BencodeParser::find_element_end(data).unwrap(), 20);

        assert_eq!(BencodeParser::find_element_end(b"i-3eXX").unwrap(), 4);
        assert_eq!(BencodeParser::find_element_end(b"4:spamX").unwrap(), 6);
    }

    #[test]
    fn test_find_element_end_rejects_truncated() {
        assert!(BencodeParser::find_element_end(b"d3:key").is_err());
        assert!(BencodeParser::find_element_end(b"d3:key999:").is_err());
        assert!(BencodeParser::find_element_end(b"e").is_err());
        assert!(BencodeParser::find_element_end(b"").is_err());
    }
}
