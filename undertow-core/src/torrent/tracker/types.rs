//! Core types for tracker communication

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::protocol::PeerId;
use crate::torrent::{InfoHash, TorrentError};

/// Tracker announce request.
///
/// Client statistics and torrent identity sent with every announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Torrent being announced
    pub info_hash: InfoHash,
    /// Client's process-wide 20-byte identifier
    pub peer_id: PeerId,
    /// Port advertised to the swarm (no listener is bound in v1)
    pub port: u16,
    /// Total bytes uploaded (always 0; download-only)
    pub uploaded: u64,
    /// Total bytes downloaded and verified
    pub downloaded: u64,
    /// Bytes remaining until completion
    pub left: u64,
    /// State-change event, or `None` for a periodic reannounce
    pub event: Option<AnnounceEvent>,
}

/// Announce state-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// First announce for this torrent in this run
    Started,
    /// Orderly shutdown mid-download
    Stopped,
    /// All pieces complete and verified
    Completed,
}

impl AnnounceEvent {
    /// Wire value of the `event` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next periodic announce
    pub interval: u32,
    /// Candidate peer addresses, possibly empty
    pub peers: Vec<SocketAddr>,
}

/// Abstract tracker seam.
///
/// The production implementation is [`super::HttpTracker`]; tests substitute
/// in-process fakes.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces to the tracker and returns a fresh peer list.
    ///
    /// # Errors
    /// - `TorrentError::TrackerRejected` - the tracker returned a failure
    ///   reason; fatal for the torrent
    /// - `TorrentError::TrackerUnavailable` - transport or decoding failure;
    ///   retried by the scheduler with backoff
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Announce URL currently in use, for logging.
    fn url(&self) -> &str;
}
