//! Handle for communicating with the client actor.

use std::path::Path;

use tokio::sync::{mpsc, oneshot};

use super::commands::ClientCommand;
use crate::torrent::{InfoHash, TorrentError, TorrentProgress};

/// Async API over the client actor.
///
/// Cheap to clone and safe to share across tasks; every method is a message
/// round-trip to the actor.
#[derive(Clone)]
pub struct ClientHandle {
    sender: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    /// Creates a handle over the actor's command channel.
    pub fn new(sender: mpsc::Sender<ClientCommand>) -> Self {
        Self { sender }
    }

    /// Loads a metainfo file and starts downloading it into `destination`.
    ///
    /// Returns as soon as the torrent's scheduler is running; progress is
    /// observed via [`ClientHandle::progress`].
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` / `TorrentError::Bencode` - the
    ///   file is not a valid torrent
    /// - `TorrentError::DuplicateTorrent` - the torrent is already active
    /// - `TorrentError::ClientShutdown` - the actor is gone
    pub async fn download(
        &self,
        metainfo_path: &Path,
        destination: &Path,
    ) -> Result<InfoHash, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = ClientCommand::Download {
            metainfo_path: metainfo_path.to_path_buf(),
            destination: destination.to_path_buf(),
            responder,
        };

        self.sender
            .send(command)
            .await
            .map_err(|_| TorrentError::ClientShutdown)?;
        rx.await.map_err(|_| TorrentError::ClientShutdown)?
    }

    /// Snapshots progress for every active torrent.
    ///
    /// # Errors
    /// - `TorrentError::ClientShutdown` - the actor is gone
    pub async fn progress(&self) -> Result<Vec<TorrentProgress>, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(ClientCommand::Progress { responder })
            .await
            .map_err(|_| TorrentError::ClientShutdown)?;
        rx.await.map_err(|_| TorrentError::ClientShutdown)
    }

    /// Stops every torrent and waits for schedulers to wind down.
    ///
    /// Working files are left on disk; nothing is finalized.
    ///
    /// # Errors
    /// - `TorrentError::ClientShutdown` - the actor is gone
    pub async fn stop(&self) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(ClientCommand::Stop { responder })
            .await
            .map_err(|_| TorrentError::ClientShutdown)?;
        rx.await.map_err(|_| TorrentError::ClientShutdown)
    }
}
