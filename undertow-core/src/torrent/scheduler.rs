//! Swarm scheduling: peer connection management, the announce loop, and
//! download completion.
//!
//! One scheduler task runs per torrent. It owns the inventory, the writer
//! task, the tracker client, and the set of peer session tasks; peer sessions
//! report back through an event channel. Candidate addresses from announces
//! are deduplicated against active and recently-failed peers before dialing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::Instant;

use super::inventory::{BlockRequest, PieceInventory};
use super::metainfo::Metainfo;
use super::peer::{CloseReason, PeerConnection, PeerSession, SessionContext};
use super::protocol::PeerId;
use super::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient};
use super::{PieceIndex, TorrentError};
use crate::config::UndertowConfig;
use crate::storage::{PieceWriter, StorageError};

/// Window for the rolling download rate shown to the user.
const RATE_WINDOW: Duration = Duration::from_secs(2);

/// Events flowing from peer sessions and the writer task to the scheduler.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A peer session ended; the scheduler may dial a replacement.
    PeerClosed {
        /// Field.
        address: SocketAddr,
        /// Field.
        reason: CloseReason,
    },
    /// A verified piece reached disk.
    PieceWritten {
        /// Field.
        index: PieceIndex,
    },
    /// A piece failed verification and was reset for re-request.
    HashMismatch {
        /// Field.
        index: PieceIndex,
    },
    /// The writer task hit a fatal disk error.
    WriterFailed {
        /// Field.
        error: StorageError,
    },
}

/// Lifecycle of one torrent download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentState {
    /// Actively announcing and downloading.
    Running,
    /// Every piece verified and the layout finalized.
    Completed,
    /// Stopped on request; working files remain for a future resume.
    Stopped,
    /// Aborted with a torrent-fatal error.
    Failed {
        /// Field.
        reason: String,
    },
}

/// Periodic progress snapshot published to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentProgress {
    /// Field.
    pub state: TorrentState,
    /// Field.
    pub name: String,
    /// Field.
    pub complete_pieces: u32,
    /// Field.
    pub total_pieces: u32,
    /// Field.
    pub bytes_complete: u64,
    /// Field.
    pub bytes_total: u64,
    /// Field.
    pub connected_peers: usize,
    /// Rolling average over the last two seconds, bytes per second.
    pub download_rate: u64,
    /// Field.
    pub next_announce_in: Duration,
}

impl TorrentProgress {
    /// Snapshot for a torrent that has not received anything yet.
    pub fn initial(metainfo: &Metainfo) -> Self {
        Self {
            state: TorrentState::Running,
            name: metainfo.name().to_string(),
            complete_pieces: 0,
            total_pieces: metainfo.piece_count(),
            bytes_complete: 0,
            bytes_total: metainfo.total_length(),
            connected_peers: 0,
            download_rate: 0,
            next_announce_in: Duration::ZERO,
        }
    }
}

enum Outcome {
    Completed,
    Stopped,
}

/// Per-torrent download coordinator.
pub struct Scheduler {
    metainfo: Arc<Metainfo>,
    destination: PathBuf,
    config: UndertowConfig,
    tracker: Arc<dyn TrackerClient>,
    peer_id: PeerId,
    shutdown: watch::Receiver<bool>,
    progress_tx: watch::Sender<TorrentProgress>,
}

/// Connection bookkeeping: who is active, who recently failed, who is queued.
struct SwarmState {
    candidates: VecDeque<SocketAddr>,
    active: HashMap<SocketAddr, tokio::task::JoinHandle<()>>,
    failed: HashMap<SocketAddr, Instant>,
    pieces_written: u32,
}

impl Scheduler {
    /// Assembles a scheduler for one torrent. Nothing runs until
    /// [`Scheduler::run`] is awaited.
    pub fn new(
        metainfo: Arc<Metainfo>,
        destination: PathBuf,
        config: UndertowConfig,
        tracker: Arc<dyn TrackerClient>,
        peer_id: PeerId,
        shutdown: watch::Receiver<bool>,
        progress_tx: watch::Sender<TorrentProgress>,
    ) -> Self {
        Self {
            metainfo,
            destination,
            config,
            tracker,
            peer_id,
            shutdown,
            progress_tx,
        }
    }

    /// Drives the torrent to completion, stop, or a fatal error.
    ///
    /// # Errors
    /// - `TorrentError::TrackerRejected` - the tracker refused the torrent
    /// - `TorrentError::Storage` - the destination failed past retries
    pub async fn run(self) -> Result<(), TorrentError> {
        let piece_count = self.metainfo.piece_count();
        let inventory = Arc::new(Mutex::new(PieceInventory::new(
            self.metainfo.clone(),
            self.config.torrent.endgame_threshold,
        )));
        let writer = Arc::new(PieceWriter::new(
            self.metainfo.clone(),
            self.destination.clone(),
        ));

        let (writer_tx, mut writer_rx) = mpsc::channel::<(PieceIndex, Vec<u8>)>(16);
        let (events_tx, mut events_rx) = mpsc::channel::<SwarmEvent>(128);
        let (block_done, _) = broadcast::channel::<BlockRequest>(256);
        let (peer_shutdown_tx, peer_shutdown_rx) = watch::channel(false);
        let downloaded = Arc::new(AtomicU64::new(0));

        // The writer task serializes all disk writes for the torrent.
        let writer_task = {
            let writer = writer.clone();
            let events = events_tx.clone();
            tokio::spawn(async move {
                while let Some((index, data)) = writer_rx.recv().await {
                    match writer.write_piece(index, &data).await {
                        Ok(()) => {
                            if events.send(SwarmEvent::PieceWritten { index }).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            let _ = events.send(SwarmEvent::WriterFailed { error }).await;
                            break;
                        }
                    }
                }
            })
        };

        let ctx = SessionContext {
            inventory: inventory.clone(),
            writer_tx: writer_tx.clone(),
            events: events_tx.clone(),
            block_done: block_done.clone(),
            shutdown: peer_shutdown_rx,
            downloaded: downloaded.clone(),
            torrent: self.config.torrent.clone(),
            network: self.config.network.clone(),
            piece_count,
        };

        let mut swarm = SwarmState {
            candidates: VecDeque::new(),
            active: HashMap::new(),
            failed: HashMap::new(),
            pieces_written: 0,
        };

        // Announce state: `started` at boot, then periodic; failures back
        // off doubling from the configured start, capped at the last
        // tracker-supplied interval.
        let mut pending_event = Some(AnnounceEvent::Started);
        let mut announce_at = Instant::now();
        let mut backoff = self.config.network.announce_backoff_start;
        let mut backoff_cap = self.config.network.max_announce_interval;

        let mut rate_samples: VecDeque<(Instant, u64)> = VecDeque::new();
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        tracing::info!(
            "starting download of '{}' ({} pieces, {} bytes)",
            self.metainfo.name(),
            piece_count,
            self.metainfo.total_length()
        );

        let outcome = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(Outcome::Stopped);
                    }
                }
                _ = tokio::time::sleep_until(announce_at) => {
                    match self.announce(pending_event, &inventory).await {
                        Ok(response) => {
                            pending_event = None;
                            backoff = self.config.network.announce_backoff_start;
                            let interval = self
                                .config
                                .network
                                .clamp_announce_interval(Duration::from_secs(response.interval as u64));
                            backoff_cap = interval;
                            announce_at = Instant::now() + interval;
                            self.enqueue_candidates(&mut swarm, response.peers);
                        }
                        Err(error @ TorrentError::TrackerRejected { .. }) => break Err(error),
                        Err(error) => {
                            tracing::warn!("announce failed: {error}, retrying in {backoff:?}");
                            announce_at = Instant::now() + backoff;
                            backoff = (backoff * 2).min(backoff_cap);
                        }
                    }
                }
                event = events_rx.recv() => match event {
                    Some(SwarmEvent::PeerClosed { address, reason }) => {
                        swarm.active.remove(&address);
                        if let CloseReason::Fault(error) = &reason {
                            tracing::debug!("peer {address} failed: {error}");
                            swarm.failed.insert(address, Instant::now());
                        }
                    }
                    Some(SwarmEvent::PieceWritten { index }) => {
                        swarm.pieces_written += 1;
                        tracing::info!(
                            "piece {index} written ({}/{piece_count})",
                            swarm.pieces_written
                        );
                        if swarm.pieces_written == piece_count {
                            break Ok(Outcome::Completed);
                        }
                    }
                    Some(SwarmEvent::HashMismatch { index }) => {
                        tracing::warn!("piece {index} hash mismatch, re-requesting");
                    }
                    Some(SwarmEvent::WriterFailed { error }) => {
                        break Err(TorrentError::Storage(error));
                    }
                    // Unreachable while we hold a sender clone.
                    None => break Ok(Outcome::Stopped),
                },
                _ = tick.tick() => {
                    self.dial_candidates(&mut swarm, &ctx);
                    self.publish_progress(
                        &inventory,
                        &swarm,
                        &downloaded,
                        &mut rate_samples,
                        announce_at,
                    )
                    .await;
                }
            }
        };

        // Teardown: stop every peer task first; they return their block
        // reservations and report in before we settle the terminal state.
        let _ = peer_shutdown_tx.send(true);
        let handles: Vec<_> = swarm.active.drain().map(|(_, handle)| handle).collect();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(handles),
        )
        .await;
        writer_task.abort();

        match outcome {
            Ok(Outcome::Completed) => {
                tracing::info!("all {piece_count} pieces complete");
                self.announce_terminal(AnnounceEvent::Completed, &inventory, None)
                    .await;
                writer.finalize().await.map_err(|error| {
                    self.publish_terminal(TorrentState::Failed {
                        reason: error.to_string(),
                    });
                    TorrentError::Storage(error)
                })?;
                self.publish_terminal(TorrentState::Completed);
                Ok(())
            }
            Ok(Outcome::Stopped) => {
                // Best-effort stopped announce; working files stay on disk.
                self.announce_terminal(
                    AnnounceEvent::Stopped,
                    &inventory,
                    Some(self.config.network.stopped_announce_deadline),
                )
                .await;
                self.publish_terminal(TorrentState::Stopped);
                tracing::info!("download of '{}' stopped", self.metainfo.name());
                Ok(())
            }
            Err(error) => {
                self.publish_terminal(TorrentState::Failed {
                    reason: error.to_string(),
                });
                tracing::error!("download of '{}' aborted: {error}", self.metainfo.name());
                Err(error)
            }
        }
    }

    async fn announce(
        &self,
        event: Option<AnnounceEvent>,
        inventory: &Arc<Mutex<PieceInventory>>,
    ) -> Result<super::tracker::AnnounceResponse, TorrentError> {
        let progress = inventory.lock().await.progress();
        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash(),
            peer_id: self.peer_id,
            port: self.config.network.announce_port,
            uploaded: 0,
            downloaded: progress.bytes_complete,
            left: progress.bytes_total - progress.bytes_complete,
            event,
        };
        self.tracker.announce(request).await
    }

    /// Fires a terminal announce (`completed`/`stopped`), swallowing errors.
    async fn announce_terminal(
        &self,
        event: AnnounceEvent,
        inventory: &Arc<Mutex<PieceInventory>>,
        deadline: Option<Duration>,
    ) {
        let announce = self.announce(Some(event), inventory);
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, announce).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!("{} announce timed out", event.as_str());
                    return;
                }
            },
            None => announce.await,
        };
        if let Err(error) = result {
            tracing::debug!("{} announce failed: {error}", event.as_str());
        }
    }

    /// Adds fresh tracker-supplied addresses to the bounded candidate queue,
    /// deduplicated against everything we already know about.
    fn enqueue_candidates(&self, swarm: &mut SwarmState, peers: Vec<SocketAddr>) {
        let offered = peers.len();
        let queued: HashSet<SocketAddr> = swarm.candidates.iter().copied().collect();
        let mut dropped = 0usize;
        for address in peers {
            if swarm.candidates.len() >= self.config.network.candidate_queue_limit {
                dropped += 1;
                continue;
            }
            if queued.contains(&address) || swarm.active.contains_key(&address) {
                continue;
            }
            if let Some(failed_at) = swarm.failed.get(&address)
                && failed_at.elapsed() < self.config.network.failed_peer_cooldown
            {
                continue;
            }
            swarm.candidates.push_back(address);
        }
        if dropped > 0 {
            tracing::debug!("candidate queue full, dropped {dropped} of {offered} peers");
        }
        tracing::debug!(
            "tracker offered {offered} peers, {} queued",
            swarm.candidates.len()
        );
    }

    /// Dials queued candidates until the connection cap is reached. Dial and
    /// handshake failures surface as `PeerClosed` events and are not fatal.
    fn dial_candidates(&self, swarm: &mut SwarmState, ctx: &SessionContext) {
        while swarm.active.len() < self.config.network.max_peers {
            let Some(address) = swarm.candidates.pop_front() else {
                break;
            };
            if swarm.active.contains_key(&address) {
                continue;
            }
            if let Some(failed_at) = swarm.failed.get(&address)
                && failed_at.elapsed() < self.config.network.failed_peer_cooldown
            {
                continue;
            }

            let ctx = ctx.clone();
            let info_hash = self.metainfo.info_hash();
            let peer_id = self.peer_id;
            let network = self.config.network.clone();
            let handle = tokio::spawn(async move {
                match PeerConnection::connect(address, info_hash, peer_id, &network).await {
                    Ok(connection) => PeerSession::new(connection, ctx).run().await,
                    Err(error) => {
                        let _ = ctx
                            .events
                            .send(SwarmEvent::PeerClosed {
                                address,
                                reason: CloseReason::Fault(error),
                            })
                            .await;
                    }
                }
            });
            swarm.active.insert(address, handle);
        }
    }

    async fn publish_progress(
        &self,
        inventory: &Arc<Mutex<PieceInventory>>,
        swarm: &SwarmState,
        downloaded: &Arc<AtomicU64>,
        rate_samples: &mut VecDeque<(Instant, u64)>,
        announce_at: Instant,
    ) {
        let progress = inventory.lock().await.progress();
        let now = Instant::now();

        let total = downloaded.load(Ordering::Relaxed);
        rate_samples.push_back((now, total));
        while let Some(&(sampled_at, _)) = rate_samples.front() {
            if now.duration_since(sampled_at) > RATE_WINDOW && rate_samples.len() > 1 {
                rate_samples.pop_front();
            } else {
                break;
            }
        }
        let download_rate = match rate_samples.front() {
            Some(&(oldest_at, oldest)) if now > oldest_at => {
                let elapsed = now.duration_since(oldest_at).as_secs_f64();
                ((total - oldest) as f64 / elapsed) as u64
            }
            _ => 0,
        };

        self.progress_tx.send_replace(TorrentProgress {
            state: TorrentState::Running,
            name: self.metainfo.name().to_string(),
            complete_pieces: progress.complete_pieces,
            total_pieces: progress.total_pieces,
            bytes_complete: progress.bytes_complete,
            bytes_total: progress.bytes_total,
            connected_peers: swarm.active.len(),
            download_rate,
            next_announce_in: announce_at.saturating_duration_since(now),
        });
    }

    fn publish_terminal(&self, state: TorrentState) {
        self.progress_tx.send_modify(|progress| {
            progress.state = state;
            progress.connected_peers = 0;
            progress.download_rate = 0;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::tests::single_file_torrent;
    use crate::torrent::tracker::AnnounceResponse;

    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    /// Records announce events and can fail a configurable number of times.
    struct RecordingTracker {
        events: std::sync::Mutex<Vec<Option<AnnounceEvent>>>,
        failures_remaining: AtomicUsize,
        interval: u32,
    }

    impl RecordingTracker {
        fn new(failures: usize, interval: u32) -> Self {
            Self {
                events: std::sync::Mutex::new(Vec::new()),
                failures_remaining: AtomicUsize::new(failures),
                interval,
            }
        }

        fn recorded(&self) -> Vec<Option<AnnounceEvent>> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TrackerClient for RecordingTracker {
        async fn announce(
            &self,
            request: AnnounceRequest,
        ) -> Result<AnnounceResponse, TorrentError> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TorrentError::TrackerUnavailable {
                    reason: "connection refused".to_string(),
                });
            }
            self.events.lock().unwrap().push(request.event);
            Ok(AnnounceResponse {
                interval: self.interval,
                peers: Vec::new(),
            })
        }

        fn url(&self) -> &str {
            "http://tracker.test/announce"
        }
    }

    fn scheduler_for(
        tracker: Arc<dyn TrackerClient>,
        destination: PathBuf,
    ) -> (Scheduler, watch::Sender<bool>, watch::Receiver<TorrentProgress>) {
        let metainfo = Arc::new(
            Metainfo::from_bytes(&single_file_torrent("t", &[1u8; 16_384], 16_384)).unwrap(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(TorrentProgress::initial(&metainfo));
        let scheduler = Scheduler::new(
            metainfo,
            destination,
            UndertowConfig::default(),
            tracker,
            PeerId::generate(),
            shutdown_rx,
            progress_tx,
        );
        (scheduler, shutdown_tx, progress_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_retries_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(RecordingTracker::new(2, 1800));
        let (scheduler, shutdown_tx, _progress) =
            scheduler_for(tracker.clone(), dir.path().to_path_buf());

        let task = tokio::spawn(scheduler.run());

        // Two failures back off 30 s then 60 s before the started announce
        // lands; paused time auto-advances through the sleeps.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(tracker.recorded(), vec![Some(AnnounceEvent::Started)]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reannounce_has_no_event() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(RecordingTracker::new(0, 60));
        let (scheduler, shutdown_tx, _progress) =
            scheduler_for(tracker.clone(), dir.path().to_path_buf());

        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_secs(150)).await;

        let recorded = tracker.recorded();
        assert_eq!(recorded[0], Some(AnnounceEvent::Started));
        assert!(recorded.len() >= 3);
        assert!(recorded[1..].iter().all(Option::is_none));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_sends_stopped_announce() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(RecordingTracker::new(0, 1800));
        let (scheduler, shutdown_tx, mut progress) =
            scheduler_for(tracker.clone(), dir.path().to_path_buf());

        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_secs(1)).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let recorded = tracker.recorded();
        assert_eq!(
            recorded.last().copied().flatten(),
            Some(AnnounceEvent::Stopped)
        );
        assert_eq!(
            progress.borrow_and_update().state,
            TorrentState::Stopped
        );
        // Nothing was downloaded, nothing renamed.
        assert!(!dir.path().join("t").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_rejection_aborts_torrent() {
        struct RejectingTracker;

        #[async_trait]
        impl TrackerClient for RejectingTracker {
            async fn announce(
                &self,
                _request: AnnounceRequest,
            ) -> Result<AnnounceResponse, TorrentError> {
                Err(TorrentError::TrackerRejected {
                    reason: "torrent not registered".to_string(),
                })
            }

            fn url(&self) -> &str {
                "http://tracker.test/announce"
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _shutdown_tx, mut progress) =
            scheduler_for(Arc::new(RejectingTracker), dir.path().to_path_buf());

        let result = scheduler.run().await;
        assert!(matches!(
            result,
            Err(TorrentError::TrackerRejected { .. })
        ));
        assert!(matches!(
            progress.borrow_and_update().state,
            TorrentState::Failed { .. }
        ));
    }
}
