//! BitTorrent wire protocol: handshake and message codecs

pub mod handshake;
pub mod messages;
pub mod types;

pub use handshake::HandshakeCodec;
pub use messages::{MAX_FRAME_LENGTH, MessageCodec};
pub use types::{PeerHandshake, PeerId, PeerMessage};
