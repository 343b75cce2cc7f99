//! Handshake serialization and validation

use super::types::{PROTOCOL_NAME, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Total length of the fixed-shape handshake: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LENGTH: usize = 68;

/// Handshake serialization utilities.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes the 68-byte handshake.
    pub fn encode(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        buf[0] = PROTOCOL_NAME.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_NAME);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Parses a received handshake, enforcing the exact protocol string.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - wrong pstrlen or protocol string
    pub fn decode(data: &[u8; HANDSHAKE_LENGTH]) -> Result<PeerHandshake, TorrentError> {
        if data[0] as usize != PROTOCOL_NAME.len() || &data[1..20] != PROTOCOL_NAME {
            return Err(TorrentError::ProtocolViolation {
                message: "handshake protocol string mismatch".to_string(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = PeerHandshake::new(InfoHash::new([7u8; 20]), PeerId::generate());
        let encoded = HandshakeCodec::encode(&handshake);

        assert_eq!(encoded.len(), 68);
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[1..20], b"BitTorrent protocol");

        let decoded = HandshakeCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_wrong_protocol_string_rejected() {
        let handshake = PeerHandshake::new(InfoHash::new([7u8; 20]), PeerId::generate());
        let mut encoded = HandshakeCodec::encode(&handshake);
        encoded[5] ^= 0xFF;
        assert!(HandshakeCodec::decode(&encoded).is_err());

        let mut encoded = HandshakeCodec::encode(&handshake);
        encoded[0] = 18;
        assert!(HandshakeCodec::decode(&encoded).is_err());
    }
}
