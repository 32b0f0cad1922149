//! File-based storage implementation

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{FileId, FileSink, StorageError};
use crate::torrent::FileEntry;

/// One output file resolved against the download directory.
#[derive(Debug, Clone)]
struct OutputFile {
    path: PathBuf,
    length: u64,
}

/// File system-based storage implementation.
///
/// Maps every file of a torrent to a path below the download directory and
/// writes piece parts straight into their byte ranges.
pub struct FileStorage {
    download_dir: PathBuf,
    files: Vec<OutputFile>,
}

impl FileStorage {
    /// Creates storage for `files` rooted at `download_dir`.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidPath` - If a torrent path is absolute or climbs
    ///   out of the download directory
    pub fn new(download_dir: PathBuf, files: &[FileEntry]) -> Result<Self, StorageError> {
        let files = files
            .iter()
            .map(|entry| {
                Ok(OutputFile {
                    path: Self::resolve(&download_dir, &entry.path)?,
                    length: entry.length,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(Self {
            download_dir,
            files,
        })
    }

    fn resolve(root: &Path, components: &[String]) -> Result<PathBuf, StorageError> {
        let relative: PathBuf = components.iter().collect();
        let safe = !relative.as_os_str().is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidPath { path: relative });
        }
        Ok(root.join(relative))
    }

    /// Root directory all files live under.
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Resolved path of `file`, if it is part of the layout.
    pub fn file_path(&self, file: FileId) -> Option<&Path> {
        self.files.get(file).map(|output| output.path.as_path())
    }

    /// Creates parent directories and pre-sizes every output file.
    ///
    /// Existing files keep their contents and are only grown.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If a directory or file could not be created
    pub async fn prepare(&self) -> Result<(), StorageError> {
        for output in &self.files {
            if let Some(parent) = output.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&output.path)
                .await?;
            if file.metadata().await?.len() < output.length {
                file.set_len(output.length).await?;
            }
            tracing::debug!(
                "FileStorage: prepared {} ({} bytes)",
                output.path.display(),
                output.length
            );
        }
        Ok(())
    }
}

#[async_trait]
impl FileSink for FileStorage {
    async fn write(&self, file: FileId, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let output = self
            .files
            .get(file)
            .ok_or(StorageError::UnknownFile { file })?;

        if let Some(parent) = output.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut handle = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&output.path)
            .await?;
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.write_all(bytes).await?;
        handle.flush().await?;

        tracing::trace!(
            "FileStorage: wrote {} bytes at {} into {}",
            bytes.len(),
            offset,
            output.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<FileEntry> {
        vec![
            FileEntry {
                path: vec!["album".to_string(), "a.bin".to_string()],
                length: 10,
            },
            FileEntry {
                path: vec!["album".to_string(), "b.bin".to_string()],
                length: 4,
            },
        ]
    }

    #[tokio::test]
    async fn test_prepare_creates_sized_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(temp_dir.path().to_path_buf(), &entries()).unwrap();

        storage.prepare().await.unwrap();

        let a = std::fs::metadata(temp_dir.path().join("album/a.bin")).unwrap();
        let b = std::fs::metadata(temp_dir.path().join("album/b.bin")).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 4);
    }

    #[tokio::test]
    async fn test_writes_land_at_offsets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(temp_dir.path().to_path_buf(), &entries()).unwrap();
        storage.prepare().await.unwrap();

        storage.write(0, 6, b"wxyz").await.unwrap();
        storage.write(0, 0, b"abc").await.unwrap();
        storage.write(1, 0, b"1234").await.unwrap();

        let a = std::fs::read(storage.file_path(0).unwrap()).unwrap();
        assert_eq!(a, b"abc\0\0\0wxyz");
        let b = std::fs::read(storage.file_path(1).unwrap()).unwrap();
        assert_eq!(b, b"1234");
    }

    #[tokio::test]
    async fn test_unknown_file_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(temp_dir.path().to_path_buf(), &entries()).unwrap();

        let result = storage.write(7, 0, b"x").await;
        assert!(matches!(result, Err(StorageError::UnknownFile { file: 7 })));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        let escaping = vec![FileEntry {
            path: vec!["..".to_string(), "etc".to_string(), "passwd".to_string()],
            length: 1,
        }];

        let result = FileStorage::new(temp_dir.path().to_path_buf(), &escaping);
        assert!(matches!(result, Err(StorageError::InvalidPath { .. })));
    }
}
