//! Peer connection handling: TCP transport, handshake, and the per-peer
//! download state machine.
//!
//! Each connected peer runs as one [`PeerSession`] task. The session owns the
//! write half of the socket and its choke/interest state; a small reader task
//! forwards decoded frames into the session loop so timers, shutdown, and
//! socket traffic can be multiplexed in one `select!`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use super::inventory::{BlockOutcome, BlockRequest, PieceInventory};
use super::protocol::handshake::HANDSHAKE_LENGTH;
use super::protocol::{
    HandshakeCodec, MAX_FRAME_LENGTH, MessageCodec, PeerHandshake, PeerId, PeerMessage,
};
use super::scheduler::SwarmEvent;
use super::{InfoHash, PieceBitfield, PieceIndex, TorrentError};
use crate::config::{NetworkConfig, TorrentConfig};

/// Why a peer session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Orderly shutdown requested by the scheduler.
    Shutdown,
    /// The connection failed; the scheduler may replace the peer.
    Fault(TorrentError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Fault(error) => write!(f, "{error}"),
        }
    }
}

/// An established, handshaken connection to one peer.
pub struct PeerConnection {
    address: SocketAddr,
    stream: TcpStream,
    remote_peer_id: PeerId,
}

impl PeerConnection {
    /// Dials the peer and performs the 68-byte handshake exchange.
    ///
    /// # Errors
    /// - `TorrentError::DialFailure` - TCP connect failed or timed out
    /// - `TorrentError::HandshakeMismatch` - remote answered for a different
    ///   torrent
    /// - `TorrentError::ProtocolViolation` - malformed or overdue handshake
    pub async fn connect(
        address: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        config: &NetworkConfig,
    ) -> Result<Self, TorrentError> {
        let mut stream =
            match tokio::time::timeout(config.dial_timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(_)) | Err(_) => return Err(TorrentError::DialFailure { address }),
            };

        let handshake = PeerHandshake::new(info_hash, peer_id);
        let exchange = async {
            stream.write_all(&HandshakeCodec::encode(&handshake)).await?;
            let mut buf = [0u8; HANDSHAKE_LENGTH];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };
        let received = match tokio::time::timeout(config.handshake_timeout, exchange).await {
            Ok(Ok(buf)) => HandshakeCodec::decode(&buf)?,
            Ok(Err(_)) => return Err(TorrentError::PeerDisconnected),
            Err(_) => {
                return Err(TorrentError::ProtocolViolation {
                    message: "handshake timed out".to_string(),
                });
            }
        };

        if received.info_hash != info_hash {
            return Err(TorrentError::HandshakeMismatch);
        }

        tracing::debug!("handshake complete with {address}");
        Ok(Self {
            address,
            stream,
            remote_peer_id: received.peer_id,
        })
    }

    /// Remote peer's self-reported id from the handshake.
    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    /// Socket address of the remote peer.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    fn into_split(self) -> (PeerReader, PeerWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (PeerReader { half: read_half }, PeerWriter { half: write_half })
    }
}

/// Read half of a peer connection, yielding decoded frames.
pub struct PeerReader {
    half: OwnedReadHalf,
}

impl PeerReader {
    /// Reads one length-prefixed frame and decodes it.
    ///
    /// # Errors
    /// - `TorrentError::PeerDisconnected` - remote closed the socket
    /// - `TorrentError::OversizeFrame` - declared length above the ceiling
    /// - `TorrentError::ProtocolViolation` - malformed message body
    pub async fn read_message(&mut self) -> Result<PeerMessage, TorrentError> {
        let mut length_buf = [0u8; 4];
        self.half
            .read_exact(&mut length_buf)
            .await
            .map_err(map_read_error)?;
        let length = u32::from_be_bytes(length_buf);

        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::OversizeFrame { length });
        }

        let mut body = vec![0u8; length as usize];
        self.half
            .read_exact(&mut body)
            .await
            .map_err(map_read_error)?;
        MessageCodec::decode(&body)
    }
}

/// Write half of a peer connection.
pub struct PeerWriter {
    half: OwnedWriteHalf,
}

impl PeerWriter {
    /// Serializes and sends one message.
    ///
    /// # Errors
    /// - `TorrentError::PeerDisconnected` - the socket write failed
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        self.half
            .write_all(&MessageCodec::encode(message))
            .await
            .map_err(|_| TorrentError::PeerDisconnected)
    }
}

fn map_read_error(error: std::io::Error) -> TorrentError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        TorrentError::PeerDisconnected
    } else {
        TorrentError::Io(error)
    }
}

/// Shared wiring handed to every peer session by the scheduler.
#[derive(Clone)]
pub struct SessionContext {
    /// Field.
    pub inventory: Arc<tokio::sync::Mutex<PieceInventory>>,
    /// Field.
    pub writer_tx: mpsc::Sender<(PieceIndex, Vec<u8>)>,
    /// Field.
    pub events: mpsc::Sender<SwarmEvent>,
    /// Blocks that landed somewhere in the swarm; used to cancel end-game
    /// duplicates still outstanding here.
    pub block_done: broadcast::Sender<BlockRequest>,
    /// Field.
    pub shutdown: watch::Receiver<bool>,
    /// Running total of payload bytes received, for the rolling rate.
    pub downloaded: Arc<AtomicU64>,
    /// Field.
    pub torrent: TorrentConfig,
    /// Field.
    pub network: NetworkConfig,
    /// Field.
    pub piece_count: u32,
}

struct OutstandingRequest {
    request: BlockRequest,
    deadline: Instant,
}

/// One peer's download state machine.
///
/// We never unchoke and never announce pieces: the client is download-only,
/// so `am_choking` stays true and no bitfield or `have` is ever sent.
pub struct PeerSession {
    state: SessionState,
    incoming: mpsc::Receiver<Result<PeerMessage, TorrentError>>,
    reader_task: tokio::task::JoinHandle<()>,
}

/// Connection state and wiring shared by the session's message handlers.
struct SessionState {
    address: SocketAddr,
    writer: PeerWriter,
    ctx: SessionContext,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    remote_bitfield: PieceBitfield,
    saw_message: bool,
    outstanding: HashMap<(u32, u32), OutstandingRequest>,
    last_sent: Instant,
    last_received: Instant,
}

impl PeerSession {
    /// Builds a session over an established connection and spawns its reader.
    pub fn new(connection: PeerConnection, ctx: SessionContext) -> Self {
        let address = connection.address();
        let (mut reader, writer) = connection.into_split();

        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = reader.read_message().await;
                let failed = result.is_err();
                if incoming_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let piece_count = ctx.piece_count;
        let now = Instant::now();
        Self {
            state: SessionState {
                address,
                writer,
                ctx,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
                remote_bitfield: PieceBitfield::new(piece_count),
                saw_message: false,
                outstanding: HashMap::new(),
                last_sent: now,
                last_received: now,
            },
            incoming: incoming_rx,
            reader_task,
        }
    }

    /// Runs the session to completion and reports the close reason.
    ///
    /// On any exit path, outstanding block reservations are returned to the
    /// inventory before the scheduler is notified.
    pub async fn run(self) {
        let PeerSession {
            mut state,
            mut incoming,
            reader_task,
        } = self;

        let mut block_done_rx = state.ctx.block_done.subscribe();
        let mut shutdown = state.ctx.shutdown.clone();
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            let step = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break CloseReason::Shutdown;
                    }
                    Ok(())
                }
                received = incoming.recv() => match received {
                    Some(Ok(message)) => {
                        state.last_received = Instant::now();
                        state.handle_message(message).await
                    }
                    Some(Err(error)) => Err(error),
                    None => Err(TorrentError::PeerDisconnected),
                },
                done = block_done_rx.recv() => match done {
                    // A lagged receiver only misses cancel opportunities.
                    Ok(request) => state.cancel_if_outstanding(request).await,
                    Err(_) => Ok(()),
                },
                _ = sweep.tick() => state.sweep().await,
            };
            if let Err(error) = step {
                break CloseReason::Fault(error);
            }
        };

        reader_task.abort();
        state.release_outstanding(None).await;

        tracing::debug!("peer {} closed: {reason}", state.address);
        let _ = state
            .ctx
            .events
            .send(SwarmEvent::PeerClosed {
                address: state.address,
                reason,
            })
            .await;
    }
}

impl SessionState {
    async fn handle_message(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        let first_message = !self.saw_message;
        if !matches!(message, PeerMessage::KeepAlive) {
            self.saw_message = true;
        }

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Bitfield { bitfield } => {
                if !first_message {
                    return Err(TorrentError::ProtocolViolation {
                        message: "bitfield after other messages".to_string(),
                    });
                }
                self.remote_bitfield = PieceBitfield::from_bytes(&bitfield, self.ctx.piece_count)?;
                self.update_interest().await?;
                self.fill_pipeline().await?;
            }
            PeerMessage::Have { piece_index } => {
                if piece_index.as_u32() >= self.ctx.piece_count {
                    return Err(TorrentError::ProtocolViolation {
                        message: format!("have for out-of-range piece {piece_index}"),
                    });
                }
                self.remote_bitfield.set(piece_index);
                self.update_interest().await?;
                self.fill_pipeline().await?;
            }
            PeerMessage::Choke => {
                self.peer_choking = true;
                self.release_outstanding(Some("choked")).await;
            }
            PeerMessage::Unchoke => {
                self.peer_choking = false;
                self.fill_pipeline().await?;
            }
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(piece_index, offset, &data).await?;
            }
            PeerMessage::Request { length, .. } => {
                // Download-only: we stay choking and serve nothing.
                tracing::trace!("ignoring request (length {length}) from {}", self.address);
            }
            PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => {}
            PeerMessage::Unknown { id } => {
                tracing::trace!("skipping unknown message id {id} from {}", self.address);
            }
        }
        Ok(())
    }

    async fn handle_block(
        &mut self,
        index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), TorrentError> {
        let key = (index.as_u32(), offset);
        let Some(entry) = self.outstanding.remove(&key) else {
            tracing::trace!(
                "discarding unrequested block {index}/{offset} from {}",
                self.address
            );
            return Ok(());
        };

        let outcome = {
            let mut inventory = self.ctx.inventory.lock().await;
            let outcome = inventory.on_block(index, offset, data);
            if matches!(outcome, BlockOutcome::Ignored) {
                // The reservation was consumed without the block landing
                // (duplicate or malformed); make it requestable again.
                inventory.cancel([entry.request]);
            }
            outcome
        };

        match outcome {
            BlockOutcome::Accepted => {
                self.ctx
                    .downloaded
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                let _ = self.ctx.block_done.send(entry.request);
            }
            BlockOutcome::PieceCompleted { index, data: piece } => {
                self.ctx
                    .downloaded
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                let _ = self.ctx.block_done.send(entry.request);
                tracing::debug!("piece {index} completed via {}", self.address);
                if self.ctx.writer_tx.send((index, piece)).await.is_err() {
                    // Writer gone means the torrent is tearing down.
                    return Err(TorrentError::ClientShutdown);
                }
                self.update_interest().await?;
            }
            BlockOutcome::HashMismatch { index } => {
                let _ = self
                    .ctx
                    .events
                    .send(SwarmEvent::HashMismatch { index })
                    .await;
            }
            BlockOutcome::Ignored => {}
        }

        self.fill_pipeline().await
    }

    /// Sends `interested`/`not interested` when our appetite for the peer's
    /// pieces changes.
    async fn update_interest(&mut self) -> Result<(), TorrentError> {
        let wants = {
            let inventory = self.ctx.inventory.lock().await;
            inventory.wants_from(&self.remote_bitfield)
        };
        if wants != self.am_interested {
            self.am_interested = wants;
            let message = if wants {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            };
            self.send(&message).await?;
        }
        Ok(())
    }

    /// Tops the request pipeline up to the configured depth.
    async fn fill_pipeline(&mut self) -> Result<(), TorrentError> {
        if self.peer_choking || !self.am_interested {
            return Ok(());
        }

        let depth = self.ctx.torrent.clamped_pipeline_depth();
        while self.outstanding.len() < depth {
            let keys: HashSet<(u32, u32)> = self.outstanding.keys().copied().collect();
            let next = {
                let mut inventory = self.ctx.inventory.lock().await;
                inventory.next_request(&self.remote_bitfield, &keys)
            };
            let Some(request) = next else { break };

            self.send(&PeerMessage::Request {
                piece_index: request.piece,
                offset: request.offset,
                length: request.length,
            })
            .await?;
            self.outstanding.insert(
                (request.piece.as_u32(), request.offset),
                OutstandingRequest {
                    request,
                    deadline: Instant::now() + self.ctx.torrent.request_timeout,
                },
            );
        }
        Ok(())
    }

    /// Returns every outstanding reservation to the inventory, making the
    /// blocks claimable by other peers at once.
    async fn release_outstanding(&mut self, cause: Option<&str>) {
        if self.outstanding.is_empty() {
            return;
        }
        let held: Vec<BlockRequest> = self
            .outstanding
            .drain()
            .map(|(_, entry)| entry.request)
            .collect();
        if let Some(cause) = cause {
            tracing::debug!(
                "{} {cause} with {} requests outstanding",
                self.address,
                held.len()
            );
        }
        self.ctx.inventory.lock().await.cancel(held);
    }

    /// Cancels a request another peer already satisfied (end-game).
    async fn cancel_if_outstanding(&mut self, request: BlockRequest) -> Result<(), TorrentError> {
        let key = (request.piece.as_u32(), request.offset);
        if self.outstanding.remove(&key).is_some() {
            self.send(&PeerMessage::Cancel {
                piece_index: request.piece,
                offset: request.offset,
                length: request.length,
            })
            .await?;
        }
        Ok(())
    }

    /// Periodic housekeeping: idle detection, request expiry, keep-alive.
    async fn sweep(&mut self) -> Result<(), TorrentError> {
        let now = Instant::now();

        if now.duration_since(self.last_received) >= self.ctx.network.idle_timeout {
            return Err(TorrentError::PeerIdle);
        }

        let expired: Vec<(u32, u32)> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        if !expired.is_empty() {
            let mut released = Vec::with_capacity(expired.len());
            for key in expired {
                if let Some(entry) = self.outstanding.remove(&key) {
                    released.push(entry.request);
                }
            }
            tracing::debug!("{} let {} requests expire", self.address, released.len());
            self.ctx.inventory.lock().await.cancel(released);
            self.fill_pipeline().await?;
        }

        if now.duration_since(self.last_sent) >= self.ctx.network.keepalive_interval {
            self.send(&PeerMessage::KeepAlive).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        self.writer.send(message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::Metainfo;
    use crate::torrent::metainfo::tests::single_file_torrent;

    use tokio::net::TcpListener;

    struct Harness {
        ctx: SessionContext,
        events_rx: mpsc::Receiver<SwarmEvent>,
        _writer_rx: mpsc::Receiver<(PieceIndex, Vec<u8>)>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn harness(metainfo: Arc<Metainfo>) -> Harness {
        let (writer_tx, writer_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (block_done, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let piece_count = metainfo.piece_count();
        let inventory = Arc::new(tokio::sync::Mutex::new(PieceInventory::new(metainfo, 0)));
        Harness {
            ctx: SessionContext {
                inventory,
                writer_tx,
                events: events_tx,
                block_done,
                shutdown: shutdown_rx,
                downloaded: Arc::new(AtomicU64::new(0)),
                torrent: TorrentConfig::default(),
                network: NetworkConfig::default(),
                piece_count,
            },
            events_rx,
            _writer_rx: writer_rx,
            shutdown_tx,
        }
    }

    async fn accept_and_handshake(listener: &TcpListener, info_hash: InfoHash) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        stream.read_exact(&mut buf).await.unwrap();
        let theirs = HandshakeCodec::decode(&buf).unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        let reply = PeerHandshake::new(info_hash, PeerId::generate());
        stream
            .write_all(&HandshakeCodec::encode(&reply))
            .await
            .unwrap();
        stream
    }

    async fn read_frame(stream: &mut TcpStream) -> PeerMessage {
        let mut length_buf = [0u8; 4];
        stream.read_exact(&mut length_buf).await.unwrap();
        let length = u32::from_be_bytes(length_buf) as usize;
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.unwrap();
        MessageCodec::decode(&body).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_mismatch_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LENGTH];
            stream.read_exact(&mut buf).await.unwrap();
            // Answer for a different torrent.
            let reply = PeerHandshake::new(InfoHash::new([9u8; 20]), PeerId::generate());
            stream
                .write_all(&HandshakeCodec::encode(&reply))
                .await
                .unwrap();
        });

        let result = PeerConnection::connect(
            address,
            InfoHash::new([1u8; 20]),
            PeerId::generate(),
            &NetworkConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(TorrentError::HandshakeMismatch)));
    }

    #[tokio::test]
    async fn test_dial_failure_reported() {
        // A port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = PeerConnection::connect(
            address,
            InfoHash::new([1u8; 20]),
            PeerId::generate(),
            &NetworkConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(TorrentError::DialFailure { .. })));
    }

    #[tokio::test]
    async fn test_choke_returns_outstanding_requests() {
        let content = vec![b'A'; 49_152]; // 3 pieces
        let metainfo =
            Arc::new(Metainfo::from_bytes(&single_file_torrent("t", &content, 16_384)).unwrap());
        let info_hash = metainfo.info_hash();
        let mut harness = harness(metainfo);
        let inventory = harness.ctx.inventory.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let remote = tokio::spawn(async move {
            let mut stream = accept_and_handshake(&listener, info_hash).await;
            // Advertise everything, then unchoke.
            stream
                .write_all(&MessageCodec::encode(&PeerMessage::Bitfield {
                    bitfield: bytes::Bytes::from_static(&[0b1110_0000]),
                }))
                .await
                .unwrap();
            assert_eq!(read_frame(&mut stream).await, PeerMessage::Interested);
            stream
                .write_all(&MessageCodec::encode(&PeerMessage::Unchoke))
                .await
                .unwrap();
            // Absorb the pipeline of requests, then choke.
            for _ in 0..3 {
                assert!(matches!(
                    read_frame(&mut stream).await,
                    PeerMessage::Request { .. }
                ));
            }
            stream
                .write_all(&MessageCodec::encode(&PeerMessage::Choke))
                .await
                .unwrap();
            // Hold the socket open until the session is shut down.
            let mut buf = [0u8; 4];
            let _ = stream.read(&mut buf).await;
        });

        let connection =
            PeerConnection::connect(address, info_hash, PeerId::generate(), &harness.ctx.network)
                .await
                .unwrap();
        let session_task = tokio::spawn(PeerSession::new(connection, harness.ctx.clone()).run());

        // After the choke, every reservation must be claimable again by a
        // fresh peer.
        let reclaimed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let mut inventory = inventory.lock().await;
                    let mut all = PieceBitfield::new(3);
                    for i in 0..3 {
                        all.set(PieceIndex::new(i));
                    }
                    if let Some(request) = inventory.next_request(&all, &HashSet::new()) {
                        let reclaimed = request.piece.as_u32() == 0 && request.offset == 0;
                        inventory.cancel([request]);
                        if reclaimed {
                            break;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reclaimed.is_ok(), "choked requests were not returned");

        harness.shutdown_tx.send(true).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), harness.events_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(SwarmEvent::PeerClosed {
                reason: CloseReason::Shutdown,
                ..
            })
        ));
        session_task.await.unwrap();
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_bitfield_is_protocol_violation() {
        let content = vec![b'A'; 16_384];
        let metainfo =
            Arc::new(Metainfo::from_bytes(&single_file_torrent("t", &content, 16_384)).unwrap());
        let info_hash = metainfo.info_hash();
        let mut harness = harness(metainfo);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut stream = accept_and_handshake(&listener, info_hash).await;
            stream
                .write_all(&MessageCodec::encode(&PeerMessage::Have {
                    piece_index: PieceIndex::new(0),
                }))
                .await
                .unwrap();
            stream
                .write_all(&MessageCodec::encode(&PeerMessage::Bitfield {
                    bitfield: bytes::Bytes::from_static(&[0b1000_0000]),
                }))
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
        });

        let connection =
            PeerConnection::connect(address, info_hash, PeerId::generate(), &harness.ctx.network)
                .await
                .unwrap();
        tokio::spawn(PeerSession::new(connection, harness.ctx.clone()).run());

        let event = tokio::time::timeout(Duration::from_secs(5), harness.events_rx.recv())
            .await
            .unwrap();
        match event {
            Some(SwarmEvent::PeerClosed {
                reason: CloseReason::Fault(TorrentError::ProtocolViolation { message }),
                ..
            }) => assert!(message.contains("bitfield")),
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }
}
