//! Message protocol between the client handle and the actor

use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::torrent::{InfoHash, TorrentError, TorrentProgress};

/// Commands accepted by the client actor.
#[derive(Debug)]
pub enum ClientCommand {
    /// Load a metainfo file and start downloading into `destination`.
    Download {
        /// Field.
        metainfo_path: PathBuf,
        /// Field.
        destination: PathBuf,
        /// Field.
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Snapshot progress for every active torrent.
    Progress {
        /// Field.
        responder: oneshot::Sender<Vec<TorrentProgress>>,
    },
    /// Stop all torrents and wait for their schedulers to wind down.
    Stop {
        /// Field.
        responder: oneshot::Sender<()>,
    },
}
