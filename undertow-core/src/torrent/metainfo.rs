//! Metainfo (.torrent) parsing and piece geometry.
//!
//! Parses the bencoded metainfo dictionary, computes the info hash from the
//! canonical re-encoding of the `info` subtree, and exposes the piece/file
//! geometry the inventory and writer operate on.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};

use super::bencode::Value;
use super::{InfoHash, PieceIndex, TorrentError};

/// Length of one block request, 16 KiB per BEP 3 convention.
pub const BLOCK_LENGTH: u32 = 16_384;

/// Complete metadata extracted from a metainfo file.
///
/// Immutable after parse. Contains everything needed to download the torrent:
/// piece hashes, piece geometry, file layout, and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    info_hash: InfoHash,
    name: String,
    announce_urls: Vec<String>,
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    total_length: u64,
    files: Vec<FileEntry>,
    comment: Option<String>,
    created_by: Option<String>,
    creation_date: Option<i64>,
}

/// Individual file within a torrent.
///
/// Single-file torrents are represented as one entry whose path is the
/// torrent name. Files are contiguous in piece space, in list order.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Field.
    pub path: PathBuf,
    /// Field.
    pub length: u64,
}

/// A write destination for part of a piece: which file, where in it, how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    /// Field.
    pub file_index: usize,
    /// Field.
    pub file_offset: u64,
    /// Field.
    pub length: u64,
}

impl Metainfo {
    /// Parses metainfo from raw bencoded bytes.
    ///
    /// # Errors
    /// - `TorrentError::Bencode` - the data is not well-formed bencode
    /// - `TorrentError::InvalidMetainfo` - missing required fields or
    ///   inconsistent piece/file geometry
    pub fn from_bytes(data: &[u8]) -> Result<Self, TorrentError> {
        let root = Value::decode(data)?;
        let dict = root.as_dict().ok_or_else(|| invalid("root is not a dictionary"))?;

        let info = dict
            .get(b"info".as_slice())
            .ok_or_else(|| invalid("missing 'info'"))?;
        let info_hash = Self::hash_info_dict(info);
        let info_dict = info
            .as_dict()
            .ok_or_else(|| invalid("'info' is not a dictionary"))?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'announce'"))?
            .to_string();
        let announce_urls = Self::collect_announce_urls(announce, dict);

        let name = info_dict
            .get(b"name".as_slice())
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'name'"))?
            .to_string();

        let piece_length = info_dict
            .get(b"piece length".as_slice())
            .and_then(Value::as_int)
            .filter(|len| *len > 0)
            .ok_or_else(|| invalid("missing or non-positive 'piece length'"))?
            as u32;

        let pieces_bytes = info_dict
            .get(b"pieces".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing 'pieces'"))?;
        if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
            return Err(invalid("'pieces' length is not a positive multiple of 20"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = Self::extract_files(info_dict, &name)?;
        let total_length: u64 = files.iter().map(|file| file.length).sum();
        if total_length == 0 {
            return Err(invalid("torrent has zero total length"));
        }

        let expected_pieces = total_length.div_ceil(piece_length as u64);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(&format!(
                "{} piece hashes for a {total_length}-byte torrent with {piece_length}-byte pieces",
                piece_hashes.len()
            )));
        }

        Ok(Self {
            info_hash,
            name,
            announce_urls,
            piece_length,
            piece_hashes,
            total_length,
            files,
            comment: dict
                .get(b"comment".as_slice())
                .and_then(Value::as_str)
                .map(str::to_string),
            created_by: dict
                .get(b"created by".as_slice())
                .and_then(Value::as_str)
                .map(str::to_string),
            creation_date: dict.get(b"creation date".as_slice()).and_then(Value::as_int),
        })
    }

    /// Reads and parses a metainfo file from disk.
    ///
    /// # Errors
    /// - `TorrentError::Io` - the file cannot be read
    /// - `TorrentError::InvalidMetainfo` / `TorrentError::Bencode` - parse failure
    pub async fn load(path: &Path) -> Result<Self, TorrentError> {
        let data = tokio::fs::read(path).await?;
        Self::from_bytes(&data)
    }

    fn hash_info_dict(info: &Value) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(info.to_bytes());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());
        InfoHash::new(hash)
    }

    fn collect_announce_urls(announce: String, dict: &BTreeMap<Vec<u8>, Value>) -> Vec<String> {
        let mut urls = vec![announce];
        if let Some(tiers) = dict.get(b"announce-list".as_slice()).and_then(Value::as_list) {
            for tier in tiers.iter().filter_map(Value::as_list) {
                for url in tier.iter().filter_map(Value::as_str) {
                    if !urls.iter().any(|known| known == url) {
                        urls.push(url.to_string());
                    }
                }
            }
        }
        urls
    }

    fn extract_files(
        info_dict: &BTreeMap<Vec<u8>, Value>,
        name: &str,
    ) -> Result<Vec<FileEntry>, TorrentError> {
        if let Some(length) = info_dict.get(b"length".as_slice()) {
            let length = length
                .as_int()
                .filter(|len| *len >= 0)
                .ok_or_else(|| invalid("invalid 'length'"))?;
            return Ok(vec![FileEntry {
                path: PathBuf::from(name),
                length: length as u64,
            }]);
        }

        let file_list = info_dict
            .get(b"files".as_slice())
            .and_then(Value::as_list)
            .ok_or_else(|| invalid("missing 'length' and 'files'"))?;
        if file_list.is_empty() {
            return Err(invalid("'files' is empty"));
        }

        let mut files = Vec::with_capacity(file_list.len());
        for entry in file_list {
            let entry_dict = entry
                .as_dict()
                .ok_or_else(|| invalid("file entry is not a dictionary"))?;
            let length = entry_dict
                .get(b"length".as_slice())
                .and_then(Value::as_int)
                .filter(|len| *len >= 0)
                .ok_or_else(|| invalid("file entry missing 'length'"))?;
            let segments = entry_dict
                .get(b"path".as_slice())
                .and_then(Value::as_list)
                .ok_or_else(|| invalid("file entry missing 'path'"))?;
            if segments.is_empty() {
                return Err(invalid("file entry has empty 'path'"));
            }

            let mut path = PathBuf::new();
            for segment in segments {
                let segment = segment
                    .as_str()
                    .ok_or_else(|| invalid("file path segment is not a string"))?;
                path.push(segment);
            }
            // Paths are relative to the torrent directory; anything that
            // escapes it is hostile.
            if path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(invalid("file path escapes the torrent directory"));
            }

            files.push(FileEntry {
                path,
                length: length as u64,
            });
        }
        Ok(files)
    }

    /// 20-byte SHA-1 over the canonical bencoding of the `info` dictionary.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Torrent name: the single file name, or the containing directory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Announce URL plus any announce-list entries, deduplicated in tier order.
    pub fn announce_urls(&self) -> &[String] {
        &self.announce_urls
    }

    /// Nominal piece length; the trailing piece may be shorter.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Total payload length across all files.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Files in piece-space order. Single-file torrents have one entry.
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Whether the torrent lists more than one file.
    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    /// Free-form comment from the metainfo, if present.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Creating tool recorded in the metainfo, if present.
    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    /// Creation time as a Unix timestamp, if present.
    pub fn creation_date(&self) -> Option<i64> {
        self.creation_date
    }

    /// Expected SHA-1 of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_u32() as usize)
    }

    /// Actual length of the piece at `index`, shorter for the trailing piece.
    pub fn piece_actual_length(&self, index: PieceIndex) -> u32 {
        let i = index.as_u32() as u64;
        let start = i * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_length);
        end.saturating_sub(start) as u32
    }

    /// Maps a full piece to the file segments it covers, in write order.
    pub fn piece_locations(&self, index: PieceIndex) -> Vec<FileSlice> {
        let piece_start = index.as_u32() as u64 * self.piece_length as u64;
        let piece_end = piece_start + self.piece_actual_length(index) as u64;

        let mut slices = Vec::new();
        let mut file_start = 0u64;
        for (file_index, file) in self.files.iter().enumerate() {
            let file_end = file_start + file.length;
            let overlap_start = piece_start.max(file_start);
            let overlap_end = piece_end.min(file_end);
            if overlap_start < overlap_end {
                slices.push(FileSlice {
                    file_index,
                    file_offset: overlap_start - file_start,
                    length: overlap_end - overlap_start,
                });
            }
            file_start = file_end;
            if file_start >= piece_end {
                break;
            }
        }
        slices
    }
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidMetainfo {
        reason: reason.to_string(),
    }
}
