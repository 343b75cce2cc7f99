//! Actor implementation for the client orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::commands::ClientCommand;
use super::handle::ClientHandle;
use crate::config::UndertowConfig;
use crate::torrent::metainfo::Metainfo;
use crate::torrent::scheduler::Scheduler;
use crate::torrent::tracker::HttpTracker;
use crate::torrent::{InfoHash, PeerId, TorrentError, TorrentProgress};

/// Spawns the client actor and returns its handle.
///
/// The actor processes commands one at a time; each torrent it starts runs
/// its own scheduler task whose lifetime the actor owns.
pub fn spawn_client(config: UndertowConfig) -> ClientHandle {
    let (sender, receiver) = mpsc::channel(16);
    let client = Client {
        config,
        peer_id: PeerId::generate(),
        torrents: HashMap::new(),
    };

    tokio::spawn(run_actor_loop(client, receiver));
    ClientHandle::new(sender)
}

/// One running torrent: shutdown signal, progress feed, scheduler task.
struct ActiveTorrent {
    shutdown: watch::Sender<bool>,
    progress: watch::Receiver<TorrentProgress>,
    task: tokio::task::JoinHandle<Result<(), TorrentError>>,
}

struct Client {
    config: UndertowConfig,
    peer_id: PeerId,
    torrents: HashMap<InfoHash, ActiveTorrent>,
}

async fn run_actor_loop(mut client: Client, mut receiver: mpsc::Receiver<ClientCommand>) {
    tracing::debug!("client actor started");

    while let Some(command) = receiver.recv().await {
        match command {
            ClientCommand::Download {
                metainfo_path,
                destination,
                responder,
            } => {
                let result = client.start_download(&metainfo_path, destination).await;
                let _ = responder.send(result);
            }
            ClientCommand::Progress { responder } => {
                let _ = responder.send(client.progress());
            }
            ClientCommand::Stop { responder } => {
                client.stop_all().await;
                let _ = responder.send(());
            }
        }
    }

    // Handle dropped without an explicit stop; wind torrents down anyway.
    client.stop_all().await;
    tracing::debug!("client actor stopped");
}

impl Client {
    async fn start_download(
        &mut self,
        metainfo_path: &std::path::Path,
        destination: PathBuf,
    ) -> Result<InfoHash, TorrentError> {
        let metainfo = Arc::new(Metainfo::load(metainfo_path).await?);
        let info_hash = metainfo.info_hash();
        if self.torrents.contains_key(&info_hash) {
            return Err(TorrentError::DuplicateTorrent { info_hash });
        }

        let tracker = Arc::new(HttpTracker::new(
            metainfo.announce_urls().to_vec(),
            &self.config.network,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(TorrentProgress::initial(&metainfo));

        let scheduler = Scheduler::new(
            metainfo,
            destination,
            self.config.clone(),
            tracker,
            self.peer_id,
            shutdown_rx,
            progress_tx,
        );
        let task = tokio::spawn(scheduler.run());

        self.torrents.insert(
            info_hash,
            ActiveTorrent {
                shutdown: shutdown_tx,
                progress: progress_rx,
                task,
            },
        );
        tracing::info!("torrent {info_hash} added");
        Ok(info_hash)
    }

    fn progress(&self) -> Vec<TorrentProgress> {
        self.torrents
            .values()
            .map(|torrent| torrent.progress.borrow().clone())
            .collect()
    }

    async fn stop_all(&mut self) {
        for torrent in self.torrents.values() {
            let _ = torrent.shutdown.send(true);
        }
        for (info_hash, torrent) in self.torrents.drain() {
            match torrent.task.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::debug!("torrent {info_hash} ended with error: {error}");
                }
                Err(join_error) => {
                    tracing::debug!("torrent {info_hash} task panicked: {join_error}");
                }
            }
        }
    }
}
