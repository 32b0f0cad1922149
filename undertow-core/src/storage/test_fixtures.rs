//! Test fixtures for storage testing.
//!
//! In-memory sinks that record what the piece store writes.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{FileId, FileSink, StorageError};

/// File sink keeping every file as a growable byte vector.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<HashMap<FileId, Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of `file`, empty if never written.
    pub fn file_contents(&self, file: FileId) -> Vec<u8> {
        self.files.lock().get(&file).cloned().unwrap_or_default()
    }

    /// Number of write calls received.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl FileSink for MemorySink {
    async fn write(&self, file: FileId, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let mut files = self.files.lock();
        let contents = files.entry(file).or_default();
        let start = offset as usize;
        let end = start + bytes.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(bytes);
        *self.writes.lock() += 1;
        Ok(())
    }
}

/// File sink failing every write with an I/O error.
#[derive(Debug, Default)]
pub struct FailingSink;

#[async_trait]
impl FileSink for FailingSink {
    async fn write(&self, _file: FileId, _offset: u64, _bytes: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Io(std::io::Error::other("disk unavailable")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_places_bytes() {
        let sink = MemorySink::new();
        sink.write(0, 3, b"def").await.unwrap();
        sink.write(0, 0, b"abc").await.unwrap();

        assert_eq!(sink.file_contents(0), b"abcdef");
        assert_eq!(sink.write_count(), 2);
        assert!(sink.file_contents(1).is_empty());
    }
}
