//! On-disk persistence of verified pieces.
//!
//! The writer owns the working layout: a `.part`-suffixed file (single-file
//! torrents) or directory (multi-file torrents) inside the destination
//! directory, renamed to its final name only when the torrent completes.
//! Interrupted downloads leave the working layout on disk untouched.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::torrent::PieceIndex;
use crate::torrent::metainfo::Metainfo;

/// Suffix marking an in-progress download target.
pub const WORKING_SUFFIX: &str = ".part";

/// Transient write failures are retried this many times before becoming
/// fatal for the torrent.
const WRITE_ATTEMPTS: u32 = 3;

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O failure at {path}: {source}")]
    /// Variant.
    Io {
        /// Field.
        path: PathBuf,
        #[source]
        /// Field.
        source: std::io::Error,
    },

    #[error("piece {index} exceeds the torrent layout")]
    /// Variant.
    PieceOutOfRange {
        /// Field.
        index: PieceIndex,
    },
}

/// Persists hash-verified pieces into the torrent's file layout.
///
/// All writes go through one writer task, which serializes access to each
/// underlying file. Bytes handed to [`PieceWriter::write_piece`] must already
/// have passed hash verification.
pub struct PieceWriter {
    metainfo: Arc<Metainfo>,
    destination: PathBuf,
}

impl PieceWriter {
    /// Creates a writer rooted at the destination directory.
    pub fn new(metainfo: Arc<Metainfo>, destination: impl Into<PathBuf>) -> Self {
        Self {
            metainfo,
            destination: destination.into(),
        }
    }

    /// Working path while the download is incomplete.
    pub fn working_root(&self) -> PathBuf {
        self.destination
            .join(format!("{}{WORKING_SUFFIX}", self.metainfo.name()))
    }

    /// Final path after completion.
    pub fn final_root(&self) -> PathBuf {
        self.destination.join(self.metainfo.name())
    }

    fn file_path(&self, file_index: usize) -> PathBuf {
        if self.metainfo.is_multi_file() {
            self.working_root()
                .join(&self.metainfo.files()[file_index].path)
        } else {
            self.working_root()
        }
    }

    /// Writes one verified piece into its file segments.
    ///
    /// Files and parent directories are created on first touch. Transient
    /// failures are retried a bounded number of times.
    ///
    /// # Errors
    /// - `StorageError::PieceOutOfRange` - index outside the torrent
    /// - `StorageError::Io` - disk failure after retries
    pub async fn write_piece(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), StorageError> {
        if index.as_u32() >= self.metainfo.piece_count() {
            return Err(StorageError::PieceOutOfRange { index });
        }

        let mut consumed = 0usize;
        for slice in self.metainfo.piece_locations(index) {
            let path = self.file_path(slice.file_index);
            let segment = &data[consumed..consumed + slice.length as usize];
            self.write_segment(&path, slice.file_offset, segment).await?;
            consumed += slice.length as usize;
        }
        tracing::trace!("piece {index} persisted ({consumed} bytes)");
        Ok(())
    }

    async fn write_segment(
        &self,
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::try_write_segment(path, offset, data).await {
                Ok(()) => return Ok(()),
                Err(source) if attempt < WRITE_ATTEMPTS => {
                    tracing::warn!(
                        "write to {} failed (attempt {attempt}): {source}, retrying",
                        path.display()
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(source) => {
                    return Err(StorageError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
    }

    async fn try_write_segment(
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Atomically moves the working layout to its final name.
    ///
    /// Called exactly once, after every piece has been written.
    ///
    /// # Errors
    /// - `StorageError::Io` - the rename failed
    pub async fn finalize(&self) -> Result<PathBuf, StorageError> {
        let working = self.working_root();
        let target = self.final_root();
        fs::rename(&working, &target)
            .await
            .map_err(|source| StorageError::Io {
                path: working.clone(),
                source,
            })?;
        tracing::info!("download finalized at {}", target.display());
        Ok(target)
    }
}
