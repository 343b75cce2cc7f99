//! Piece and block accounting shared by all peer connections.
//!
//! The inventory tracks which pieces are complete, which blocks of in-flight
//! pieces are pending, requested, or received, and assembles and
//! hash-verifies completed pieces. Peer sessions draw block requests from it
//! and feed received blocks back; the scheduler reads progress from it.
//!
//! Operations are short and never block on I/O, so the whole inventory sits
//! behind a single mutex shared by the peer tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use super::metainfo::{BLOCK_LENGTH, Metainfo};
use super::{PieceBitfield, PieceIndex};

/// A block request triple. Doubles as the response key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// Field.
    pub piece: PieceIndex,
    /// Field.
    pub offset: u32,
    /// Field.
    pub length: u32,
}

/// Result of feeding a received block into the inventory.
#[derive(Debug, PartialEq)]
pub enum BlockOutcome {
    /// Block recorded; the piece is still incomplete.
    Accepted,
    /// The block completed its piece and the hash matched. The verified
    /// bytes are handed out for persistence.
    PieceCompleted {
        /// Field.
        index: PieceIndex,
        /// Field.
        data: Vec<u8>,
    },
    /// The assembled piece failed verification and was reset to missing.
    HashMismatch {
        /// Field.
        index: PieceIndex,
    },
    /// Unrequested, duplicate, or malformed block; dropped without effect.
    Ignored,
}

/// Snapshot of download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventoryProgress {
    /// Field.
    pub complete_pieces: u32,
    /// Field.
    pub total_pieces: u32,
    /// Field.
    pub bytes_complete: u64,
    /// Field.
    pub bytes_total: u64,
}

/// Buffer and per-block state for a piece currently being assembled.
struct InFlightPiece {
    buffer: Vec<u8>,
    received: Vec<bool>,
    /// Outstanding request count per block. Stays 0 or 1 outside end-game.
    requested: Vec<u8>,
    received_count: u32,
}

impl InFlightPiece {
    fn new(piece_length: u32) -> Self {
        let block_count = piece_length.div_ceil(BLOCK_LENGTH) as usize;
        Self {
            buffer: vec![0u8; piece_length as usize],
            received: vec![false; block_count],
            requested: vec![0u8; block_count],
            received_count: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.received_count as usize == self.received.len()
    }
}

/// Process-wide piece/block state for one torrent.
pub struct PieceInventory {
    metainfo: Arc<Metainfo>,
    complete: PieceBitfield,
    complete_count: u32,
    bytes_complete: u64,
    in_flight: HashMap<u32, InFlightPiece>,
    /// End-game engages when this many pieces or fewer are still missing.
    endgame_threshold: u32,
}

impl PieceInventory {
    /// Creates an empty inventory for the torrent.
    pub fn new(metainfo: Arc<Metainfo>, endgame_threshold: u32) -> Self {
        let piece_count = metainfo.piece_count();
        Self {
            metainfo,
            complete: PieceBitfield::new(piece_count),
            complete_count: 0,
            bytes_complete: 0,
            in_flight: HashMap::new(),
            endgame_threshold,
        }
    }

    /// Whether the piece has been received and hash-verified.
    pub fn have(&self, index: PieceIndex) -> bool {
        self.complete.has(index)
    }

    /// Whether every piece is complete.
    pub fn is_complete(&self) -> bool {
        self.complete_count == self.metainfo.piece_count()
    }

    /// Whether the peer advertises any piece we have not completed.
    pub fn wants_from(&self, peer_has: &PieceBitfield) -> bool {
        (0..self.metainfo.piece_count())
            .map(PieceIndex::new)
            .any(|index| peer_has.has(index) && !self.have(index))
    }

    /// Selects the next block to request from a peer advertising `peer_has`.
    ///
    /// Baseline policy is sequential by piece index, block offsets in order,
    /// and no block handed to two peers at once. Once the number of missing
    /// pieces drops to the end-game threshold, blocks already requested
    /// elsewhere may be handed out again; `peer_outstanding` keeps a peer
    /// from being handed a block it already has in flight.
    pub fn next_request(
        &mut self,
        peer_has: &PieceBitfield,
        peer_outstanding: &HashSet<(u32, u32)>,
    ) -> Option<BlockRequest> {
        let piece_count = self.metainfo.piece_count();

        for i in 0..piece_count {
            let index = PieceIndex::new(i);
            if self.have(index) || !peer_has.has(index) {
                continue;
            }

            let piece_length = self.metainfo.piece_actual_length(index);
            let piece = self
                .in_flight
                .entry(i)
                .or_insert_with(|| InFlightPiece::new(piece_length));

            for block in 0..piece.received.len() {
                if piece.received[block] || piece.requested[block] != 0 {
                    continue;
                }
                piece.requested[block] = 1;
                return Some(Self::block_request(index, block as u32, piece_length));
            }
        }

        if piece_count - self.complete_count <= self.endgame_threshold {
            return self.next_endgame_request(peer_has, peer_outstanding);
        }
        None
    }

    /// End-game pass: duplicate the least-requested outstanding block the
    /// peer can serve and does not already have in flight.
    fn next_endgame_request(
        &mut self,
        peer_has: &PieceBitfield,
        peer_outstanding: &HashSet<(u32, u32)>,
    ) -> Option<BlockRequest> {
        let mut best: Option<(u8, u32, u32)> = None;
        for (&i, piece) in &self.in_flight {
            if !peer_has.has(PieceIndex::new(i)) {
                continue;
            }
            for block in 0..piece.received.len() {
                let offset = block as u32 * BLOCK_LENGTH;
                if piece.received[block] || peer_outstanding.contains(&(i, offset)) {
                    continue;
                }
                let count = piece.requested[block];
                if best.is_none_or(|(best_count, ..)| count < best_count) {
                    best = Some((count, i, block as u32));
                }
            }
        }

        let (_, i, block) = best?;
        let index = PieceIndex::new(i);
        let piece_length = self.metainfo.piece_actual_length(index);
        if let Some(piece) = self.in_flight.get_mut(&i) {
            piece.requested[block as usize] = piece.requested[block as usize].saturating_add(1);
        }
        Some(Self::block_request(index, block, piece_length))
    }

    fn block_request(index: PieceIndex, block: u32, piece_length: u32) -> BlockRequest {
        let offset = block * BLOCK_LENGTH;
        BlockRequest {
            piece: index,
            offset,
            length: (piece_length - offset).min(BLOCK_LENGTH),
        }
    }

    /// Records a received block.
    ///
    /// Completing a piece triggers hash verification: on a match the piece
    /// transitions to complete and its bytes are returned for the writer; on
    /// a mismatch the whole piece is reset to missing. The mismatch is not
    /// attributable to a single peer, so no per-peer penalty is taken here.
    pub fn on_block(&mut self, index: PieceIndex, offset: u32, data: &[u8]) -> BlockOutcome {
        let i = index.as_u32();
        if i >= self.metainfo.piece_count() || self.have(index) {
            return BlockOutcome::Ignored;
        }
        let piece_length = self.metainfo.piece_actual_length(index);
        if offset % BLOCK_LENGTH != 0 {
            return BlockOutcome::Ignored;
        }
        let block = (offset / BLOCK_LENGTH) as usize;
        let expected_length = piece_length.saturating_sub(offset).min(BLOCK_LENGTH);
        if expected_length == 0 || data.len() as u32 != expected_length {
            return BlockOutcome::Ignored;
        }

        let Some(piece) = self.in_flight.get_mut(&i) else {
            // A block we never asked for.
            return BlockOutcome::Ignored;
        };
        if piece.received[block] {
            // End-game duplicate; first response already won.
            return BlockOutcome::Ignored;
        }

        let start = offset as usize;
        piece.buffer[start..start + data.len()].copy_from_slice(data);
        piece.received[block] = true;
        piece.requested[block] = 0;
        piece.received_count += 1;

        if !piece.is_full() {
            return BlockOutcome::Accepted;
        }

        let assembled = self
            .in_flight
            .remove(&i)
            .map(|piece| piece.buffer)
            .unwrap_or_default();

        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest = hasher.finalize();
        let matches = self
            .metainfo
            .piece_hash(index)
            .is_some_and(|expected| digest.as_slice() == expected);

        if !matches {
            tracing::warn!("piece {index} failed hash verification, resetting");
            return BlockOutcome::HashMismatch { index };
        }

        self.complete.set(index);
        self.complete_count += 1;
        self.bytes_complete += piece_length as u64;
        BlockOutcome::PieceCompleted {
            index,
            data: assembled,
        }
    }

    /// Releases previously-issued block requests back to pending.
    ///
    /// Used when a peer disconnects, is choked, or a request deadline
    /// expires; the blocks become eligible for other peers immediately.
    pub fn cancel(&mut self, requests: impl IntoIterator<Item = BlockRequest>) {
        for request in requests {
            let Some(piece) = self.in_flight.get_mut(&request.piece.as_u32()) else {
                continue;
            };
            let block = (request.offset / BLOCK_LENGTH) as usize;
            if let Some(count) = piece.requested.get_mut(block)
                && !piece.received[block]
            {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Current progress counters.
    pub fn progress(&self) -> InventoryProgress {
        InventoryProgress {
            complete_pieces: self.complete_count,
            total_pieces: self.metainfo.piece_count(),
            bytes_complete: self.bytes_complete,
            bytes_total: self.metainfo.total_length(),
        }
    }
}
