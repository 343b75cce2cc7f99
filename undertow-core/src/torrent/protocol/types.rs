//! Core types for the BitTorrent wire protocol

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol string exchanged in every handshake.
pub const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier carried in handshakes and announces. Chosen once per
/// process start and stable across all torrents in that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random peer ID with the undertow client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-UT0001-");
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// BitTorrent wire protocol messages.
///
/// The message set of BEP 3. `Unknown` carries any id outside it; such
/// frames are skipped, not treated as fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Variant.
    KeepAlive,
    /// Variant.
    Choke,
    /// Variant.
    Unchoke,
    /// Variant.
    Interested,
    /// Variant.
    NotInterested,
    /// Variant.
    Have {
        /// Field.
        piece_index: PieceIndex,
    },
    /// Variant.
    Bitfield {
        /// Field.
        bitfield: Bytes,
    },
    /// Variant.
    Request {
        /// Field.
        piece_index: PieceIndex,
        /// Field.
        offset: u32,
        /// Field.
        length: u32,
    },
    /// Variant.
    Piece {
        /// Field.
        piece_index: PieceIndex,
        /// Field.
        offset: u32,
        /// Field.
        data: Bytes,
    },
    /// Variant.
    Cancel {
        /// Field.
        piece_index: PieceIndex,
        /// Field.
        offset: u32,
        /// Field.
        length: u32,
    },
    /// Variant.
    Port {
        /// Field.
        port: u16,
    },
    /// Variant.
    Unknown {
        /// Field.
        id: u8,
    },
}

/// Peer handshake contents.
///
/// The fixed 68-byte exchange that opens every connection; the info hash
/// must match ours or the connection is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Field.
    pub reserved: [u8; 8],
    /// Field.
    pub info_hash: InfoHash,
    /// Field.
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Creates an outgoing handshake with zeroed reserved bytes.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
