//! BitTorrent download protocol implementation

pub mod bencode;
pub mod inventory;
pub mod metainfo;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;

pub use bencode::{BencodeError, Value};
pub use inventory::{BlockOutcome, BlockRequest, InventoryProgress, PieceInventory};
pub use metainfo::{FileEntry, FileSlice, Metainfo};
pub use peer::{CloseReason, PeerConnection, PeerSession};
pub use protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
pub use scheduler::{Scheduler, SwarmEvent, TorrentProgress, TorrentState};
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTracker, TrackerClient};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the canonical bencoding of the metainfo `info`
/// dictionary. Identifies the torrent to trackers and peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bitmap over the pieces of a torrent, MSB of the first byte is piece 0.
///
/// Used both for the remote peer's advertised pieces and for membership
/// queries against the local inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl PieceBitfield {
    /// Creates an all-zero bitfield sized for `piece_count` pieces.
    pub fn new(piece_count: u32) -> Self {
        let byte_len = piece_count.div_ceil(8) as usize;
        Self {
            bits: vec![0u8; byte_len],
            piece_count,
        }
    }

    /// Parses a wire-format bitfield, enforcing exact length and zeroed
    /// trailing bits.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - wrong byte length or a set bit
    ///   past the last piece
    pub fn from_bytes(bytes: &[u8], piece_count: u32) -> Result<Self, TorrentError> {
        let expected_len = piece_count.div_ceil(8) as usize;
        if bytes.len() != expected_len {
            return Err(TorrentError::ProtocolViolation {
                message: format!(
                    "bitfield length {} does not match {expected_len} bytes for {piece_count} pieces",
                    bytes.len()
                ),
            });
        }

        let trailing_bits = (expected_len as u32 * 8).saturating_sub(piece_count);
        if trailing_bits > 0 {
            let last = bytes[expected_len - 1];
            let mask = (1u8 << trailing_bits) - 1;
            if last & mask != 0 {
                return Err(TorrentError::ProtocolViolation {
                    message: "bitfield has nonzero trailing bits".to_string(),
                });
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            piece_count,
        })
    }

    /// Returns whether the bit for `index` is set.
    pub fn has(&self, index: PieceIndex) -> bool {
        let i = index.as_u32();
        if i >= self.piece_count {
            return false;
        }
        let byte = self.bits[(i / 8) as usize];
        byte & (0x80 >> (i % 8)) != 0
    }

    /// Sets the bit for `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: PieceIndex) {
        let i = index.as_u32();
        if i < self.piece_count {
            self.bits[(i / 8) as usize] |= 0x80 >> (i % 8);
        }
    }

    /// Number of pieces this bitfield covers.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers metainfo parsing, tracker communication, the peer wire protocol,
/// and piece verification. Connection-scoped variants are fatal only for the
/// peer that produced them; the scheduler replaces the peer and continues.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("invalid metainfo: {reason}")]
    /// Variant.
    InvalidMetainfo {
        /// Field.
        reason: String,
    },

    #[error("malformed bencode")]
    /// Variant.
    Bencode(#[from] BencodeError),

    #[error("tracker unavailable: {reason}")]
    /// Variant.
    TrackerUnavailable {
        /// Field.
        reason: String,
    },

    #[error("tracker rejected announce: {reason}")]
    /// Variant.
    TrackerRejected {
        /// Field.
        reason: String,
    },

    #[error("handshake info hash mismatch")]
    /// Variant.
    HandshakeMismatch,

    #[error("frame length {length} exceeds ceiling")]
    /// Variant.
    OversizeFrame {
        /// Field.
        length: u32,
    },

    #[error("protocol violation: {message}")]
    /// Variant.
    ProtocolViolation {
        /// Field.
        message: String,
    },

    #[error("peer idle past receive deadline")]
    /// Variant.
    PeerIdle,

    #[error("peer closed the connection")]
    /// Variant.
    PeerDisconnected,

    #[error("failed to dial peer {address}")]
    /// Variant.
    DialFailure {
        /// Field.
        address: SocketAddr,
    },

    #[error("piece {index} hash mismatch")]
    /// Variant.
    HashMismatch {
        /// Field.
        index: PieceIndex,
    },

    #[error("storage error")]
    /// Variant.
    Storage(#[from] StorageError),

    #[error("torrent {info_hash} is already active")]
    /// Variant.
    DuplicateTorrent {
        /// Field.
        info_hash: InfoHash,
    },

    #[error("client is shutting down")]
    /// Variant.
    ClientShutdown,

    #[error("I/O error")]
    /// Variant.
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    /// Variant.
    UrlParsing(#[from] url::ParseError),
}
