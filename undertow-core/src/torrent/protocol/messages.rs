//! Wire message framing: length-prefixed serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::types::PeerMessage;
use crate::torrent::{PieceIndex, TorrentError};

/// Hard ceiling on a frame's declared length (2^17). A 16 KiB block plus
/// message overhead fits comfortably; anything larger is hostile.
pub const MAX_FRAME_LENGTH: u32 = 1 << 17;

/// Message serialization utilities for the BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message including its 4-byte big-endian length prefix.
    pub fn encode(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            PeerMessage::Unknown { .. } => {
                // Never sent; represented only on receive.
                buf.put_u32(0);
            }
        }

        buf
    }

    /// Deserializes a frame body (the bytes after the length prefix).
    ///
    /// A zero-length body is a keep-alive. Unknown ids produce
    /// `PeerMessage::Unknown` so callers can skip them.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - payload length does not match
    ///   the message id
    pub fn decode(body: &[u8]) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = body[0];
        let mut payload = &body[1..];

        match id {
            0 => Self::expect_empty(payload, "choke").map(|_| PeerMessage::Choke),
            1 => Self::expect_empty(payload, "unchoke").map(|_| PeerMessage::Unchoke),
            2 => Self::expect_empty(payload, "interested").map(|_| PeerMessage::Interested),
            3 => Self::expect_empty(payload, "not interested").map(|_| PeerMessage::NotInterested),
            4 => {
                if payload.len() != 4 {
                    return Err(malformed("have"));
                }
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(payload.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(payload),
            }),
            6 => {
                if payload.len() != 12 {
                    return Err(malformed("request"));
                }
                Ok(PeerMessage::Request {
                    piece_index: PieceIndex::new(payload.get_u32()),
                    offset: payload.get_u32(),
                    length: payload.get_u32(),
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(malformed("piece"));
                }
                let piece_index = PieceIndex::new(payload.get_u32());
                let offset = payload.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(payload),
                })
            }
            8 => {
                if payload.len() != 12 {
                    return Err(malformed("cancel"));
                }
                Ok(PeerMessage::Cancel {
                    piece_index: PieceIndex::new(payload.get_u32()),
                    offset: payload.get_u32(),
                    length: payload.get_u32(),
                })
            }
            9 => {
                if payload.len() != 2 {
                    return Err(malformed("port"));
                }
                Ok(PeerMessage::Port {
                    port: payload.get_u16(),
                })
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }

    fn expect_empty(payload: &[u8], name: &str) -> Result<(), TorrentError> {
        if payload.is_empty() {
            Ok(())
        } else {
            Err(malformed(name))
        }
    }
}

fn malformed(name: &str) -> TorrentError {
    TorrentError::ProtocolViolation {
        message: format!("malformed {name} message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: PeerMessage) {
        let encoded = MessageCodec::encode(&message);
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(length as usize, encoded.len() - 4);
        assert_eq!(MessageCodec::decode(&encoded[4..]).unwrap(), message);
    }

    #[test]
    fn test_roundtrip_all_messages() {
        roundtrip(PeerMessage::KeepAlive);
        roundtrip(PeerMessage::Choke);
        roundtrip(PeerMessage::Unchoke);
        roundtrip(PeerMessage::Interested);
        roundtrip(PeerMessage::NotInterested);
        roundtrip(PeerMessage::Have {
            piece_index: PieceIndex::new(42),
        });
        roundtrip(PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b1100_0000]),
        });
        roundtrip(PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 16_384,
            length: 16_384,
        });
        roundtrip(PeerMessage::Piece {
            piece_index: PieceIndex::new(1),
            offset: 0,
            data: Bytes::from_static(b"block data"),
        });
        roundtrip(PeerMessage::Cancel {
            piece_index: PieceIndex::new(1),
            offset: 0,
            length: 16_384,
        });
        roundtrip(PeerMessage::Port { port: 6881 });
    }

    #[test]
    fn test_unknown_id_is_not_fatal() {
        // Extension message id 20 with an arbitrary payload.
        let body = [20u8, 1, 2, 3];
        assert_eq!(
            MessageCodec::decode(&body).unwrap(),
            PeerMessage::Unknown { id: 20 }
        );
    }

    #[test]
    fn test_malformed_payload_lengths() {
        assert!(MessageCodec::decode(&[4u8, 0, 0]).is_err()); // have, short
        assert!(MessageCodec::decode(&[6u8, 0, 0, 0, 0]).is_err()); // request, short
        assert!(MessageCodec::decode(&[7u8, 0, 0, 0]).is_err()); // piece, short
        assert!(MessageCodec::decode(&[0u8, 9]).is_err()); // choke with payload
    }

    #[test]
    fn test_empty_body_is_keepalive() {
        assert_eq!(MessageCodec::decode(&[]).unwrap(), PeerMessage::KeepAlive);
    }
}
