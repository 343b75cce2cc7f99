//! End-to-end download scenarios against in-process peers and trackers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use undertow_core::config::UndertowConfig;
use undertow_core::torrent::bencode::Value;
use undertow_core::torrent::protocol::handshake::HANDSHAKE_LENGTH;
use undertow_core::torrent::protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
use undertow_core::torrent::tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
use undertow_core::torrent::{InfoHash, Metainfo, Scheduler, TorrentError, TorrentProgress, TorrentState};

/// Builds single-file metainfo bytes whose pieces hash over `content`.
fn single_file_torrent(name: &str, content: &[u8], piece_length: u32) -> Vec<u8> {
    let mut pieces = Vec::new();
    for chunk in content.chunks(piece_length as usize) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        pieces.extend_from_slice(&hasher.finalize());
    }

    let mut info = BTreeMap::new();
    info.insert(b"length".to_vec(), Value::Integer(content.len() as i64));
    info.insert(b"name".to_vec(), Value::Bytes(name.as_bytes().to_vec()));
    info.insert(b"piece length".to_vec(), Value::Integer(piece_length as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(pieces));

    let mut root = BTreeMap::new();
    root.insert(
        b"announce".to_vec(),
        Value::Bytes(b"http://tracker.test/announce".to_vec()),
    );
    root.insert(b"info".to_vec(), Value::Dict(info));
    Value::Dict(root).to_bytes()
}

/// In-process tracker handing out a fixed peer list and recording events.
struct StaticTracker {
    peers: Vec<SocketAddr>,
    events: std::sync::Mutex<Vec<Option<AnnounceEvent>>>,
}

impl StaticTracker {
    fn new(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers,
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn recorded(&self) -> Vec<Option<AnnounceEvent>> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrackerClient for StaticTracker {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        self.events.lock().unwrap().push(request.event);
        Ok(AnnounceResponse {
            interval: 1800,
            peers: self.peers.clone(),
        })
    }

    fn url(&self) -> &str {
        "http://tracker.test/announce"
    }
}

/// A minimal seeding peer: handshakes, advertises `bitfield`, unchokes on
/// interest, and serves requested blocks from `content`. When
/// `garbage_piece` is set, the first block of that piece is corrupted once.
struct Seeder {
    info_hash: InfoHash,
    content: Arc<Vec<u8>>,
    piece_length: u32,
    bitfield: Vec<u8>,
    garbage_piece: Option<(u32, Arc<AtomicBool>)>,
}

impl Seeder {
    async fn spawn(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let seeder = Seeder {
                    info_hash: self.info_hash,
                    content: self.content.clone(),
                    piece_length: self.piece_length,
                    bitfield: self.bitfield.clone(),
                    garbage_piece: self.garbage_piece.clone(),
                };
                tokio::spawn(seeder.serve(stream));
            }
        });
        address
    }

    async fn serve(self, mut stream: TcpStream) {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }
        let Ok(theirs) = HandshakeCodec::decode(&buf) else {
            return;
        };
        assert_eq!(theirs.info_hash, self.info_hash);
        let reply = PeerHandshake::new(self.info_hash, PeerId::generate());
        if stream
            .write_all(&HandshakeCodec::encode(&reply))
            .await
            .is_err()
        {
            return;
        }

        let bitfield = PeerMessage::Bitfield {
            bitfield: bytes::Bytes::from(self.bitfield.clone()),
        };
        if stream
            .write_all(&MessageCodec::encode(&bitfield))
            .await
            .is_err()
        {
            return;
        }

        loop {
            let mut length_buf = [0u8; 4];
            if stream.read_exact(&mut length_buf).await.is_err() {
                return;
            }
            let length = u32::from_be_bytes(length_buf) as usize;
            let mut body = vec![0u8; length];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }
            let Ok(message) = MessageCodec::decode(&body) else {
                return;
            };

            match message {
                PeerMessage::Interested => {
                    if stream
                        .write_all(&MessageCodec::encode(&PeerMessage::Unchoke))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                PeerMessage::Request {
                    piece_index,
                    offset,
                    length,
                } => {
                    let start =
                        piece_index.as_u32() as usize * self.piece_length as usize + offset as usize;
                    let mut data = self.content[start..start + length as usize].to_vec();
                    if let Some((garbage_index, pending)) = &self.garbage_piece
                        && *garbage_index == piece_index.as_u32()
                        && pending.swap(false, Ordering::SeqCst)
                    {
                        for byte in &mut data {
                            *byte = !*byte;
                        }
                    }
                    let piece = PeerMessage::Piece {
                        piece_index,
                        offset,
                        data: bytes::Bytes::from(data),
                    };
                    if stream.write_all(&MessageCodec::encode(&piece)).await.is_err() {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}

struct Run {
    result: Result<(), TorrentError>,
    progress: watch::Receiver<TorrentProgress>,
    destination: PathBuf,
    _dir: tempfile::TempDir,
}

async fn run_download(
    metainfo_bytes: &[u8],
    tracker: Arc<dyn TrackerClient>,
) -> Run {
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().to_path_buf();
    let metainfo = Arc::new(Metainfo::from_bytes(metainfo_bytes).unwrap());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (progress_tx, progress_rx) = watch::channel(TorrentProgress::initial(&metainfo));

    let scheduler = Scheduler::new(
        metainfo,
        destination.clone(),
        UndertowConfig::default(),
        tracker,
        PeerId::generate(),
        shutdown_rx,
        progress_tx,
    );
    let result = tokio::time::timeout(Duration::from_secs(30), scheduler.run())
        .await
        .expect("download did not finish in time");

    Run {
        result,
        progress: progress_rx,
        destination,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_single_file_happy_path() {
    let content = Arc::new(vec![b'A'; 16_384]);
    let metainfo_bytes = single_file_torrent("solo.bin", &content, 16_384);
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();

    let seeder = Seeder {
        info_hash: metainfo.info_hash(),
        content: content.clone(),
        piece_length: 16_384,
        bitfield: vec![0b1000_0000],
        garbage_piece: None,
    };
    let address = seeder.spawn().await;
    let tracker = Arc::new(StaticTracker::new(vec![address]));

    let mut run = run_download(&metainfo_bytes, tracker.clone()).await;
    run.result.unwrap();

    assert_eq!(run.progress.borrow_and_update().state, TorrentState::Completed);
    let on_disk = std::fs::read(run.destination.join("solo.bin")).unwrap();
    assert_eq!(on_disk, *content);
    assert!(!run.destination.join("solo.bin.part").exists());

    // started first, completed exactly once.
    let events = tracker.recorded();
    assert_eq!(events.first().copied().flatten(), Some(AnnounceEvent::Started));
    assert_eq!(
        events
            .iter()
            .filter(|event| **event == Some(AnnounceEvent::Completed))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_multi_piece_split_across_two_peers() {
    // 3 pieces; peer X has 110, peer Y has 011.
    let mut content = Vec::new();
    content.extend_from_slice(&[b'X'; 16_384]);
    content.extend_from_slice(&[b'Y'; 16_384]);
    content.extend_from_slice(&[b'Z'; 16_384]);
    let content = Arc::new(content);
    let metainfo_bytes = single_file_torrent("split.bin", &content, 16_384);
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();

    let peer_x = Seeder {
        info_hash: metainfo.info_hash(),
        content: content.clone(),
        piece_length: 16_384,
        bitfield: vec![0b1100_0000],
        garbage_piece: None,
    }
    .spawn()
    .await;
    let peer_y = Seeder {
        info_hash: metainfo.info_hash(),
        content: content.clone(),
        piece_length: 16_384,
        bitfield: vec![0b0110_0000],
        garbage_piece: None,
    }
    .spawn()
    .await;

    let tracker = Arc::new(StaticTracker::new(vec![peer_x, peer_y]));
    let run = run_download(&metainfo_bytes, tracker).await;
    run.result.unwrap();

    let on_disk = std::fs::read(run.destination.join("split.bin")).unwrap();
    assert_eq!(on_disk, *content);
}

#[tokio::test]
async fn test_hash_mismatch_recovery() {
    let mut content = Vec::new();
    content.extend_from_slice(&[b'G'; 16_384]);
    content.extend_from_slice(&[b'H'; 16_384]);
    let content = Arc::new(content);
    let metainfo_bytes = single_file_torrent("flaky.bin", &content, 16_384);
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();

    // The seeder corrupts its first answer for piece 1, then behaves.
    let seeder = Seeder {
        info_hash: metainfo.info_hash(),
        content: content.clone(),
        piece_length: 16_384,
        bitfield: vec![0b1100_0000],
        garbage_piece: Some((1, Arc::new(AtomicBool::new(true)))),
    };
    let address = seeder.spawn().await;
    let tracker = Arc::new(StaticTracker::new(vec![address]));

    let mut run = run_download(&metainfo_bytes, tracker).await;
    run.result.unwrap();

    assert_eq!(run.progress.borrow_and_update().state, TorrentState::Completed);
    let on_disk = std::fs::read(run.destination.join("flaky.bin")).unwrap();
    assert_eq!(on_disk, *content);
}
