//! HTTP tracker client: announce URL building and response parsing

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use url::Url;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::bencode::Value;
use crate::torrent::TorrentError;

/// HTTP(S) tracker client.
///
/// Carries the announce URL plus any announce-list entries and rotates
/// through them round-robin when one fails, per the announce-list protocol.
pub struct HttpTracker {
    announce_urls: Vec<String>,
    cursor: AtomicUsize,
    client: reqwest::Client,
}

impl HttpTracker {
    /// Creates a tracker client over the given announce URLs.
    ///
    /// # Panics
    /// Panics if `announce_urls` is empty; the metainfo parser guarantees at
    /// least one URL.
    pub fn new(announce_urls: Vec<String>, config: &NetworkConfig) -> Self {
        assert!(!announce_urls.is_empty(), "no announce URLs");
        Self {
            announce_urls,
            cursor: AtomicUsize::new(0),
            client: reqwest::Client::builder()
                .timeout(config.tracker_timeout)
                .user_agent(config.user_agent)
                .build()
                .expect("HTTP client creation should not fail"),
        }
    }

    /// Builds the full announce URL with query parameters.
    ///
    /// `info_hash` and `peer_id` are raw bytes and must be percent-encoded
    /// by hand; going through a query-pair API would encode the percent
    /// signs a second time.
    fn build_announce_url(base: &str, request: &AnnounceRequest) -> Result<String, TorrentError> {
        let parsed = Url::parse(base)?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(TorrentError::TrackerUnavailable {
                    reason: format!("unsupported tracker scheme '{other}'"),
                });
            }
        }

        let separator = if parsed.query().is_some() { '&' } else { '?' };
        let mut url = format!(
            "{base}{separator}info_hash={}&peer_id={}",
            percent_encode(request.info_hash.as_bytes()),
            percent_encode(request.peer_id.as_bytes()),
        );
        url.push_str(&format!(
            "&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            request.port, request.uploaded, request.downloaded, request.left
        ));
        if let Some(event) = request.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        Ok(url)
    }

    /// Parses a bencoded announce response.
    fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TorrentError> {
        let root = Value::decode(body).map_err(|e| TorrentError::TrackerUnavailable {
            reason: format!("undecodable tracker response: {e}"),
        })?;
        let dict = root
            .as_dict()
            .ok_or_else(|| TorrentError::TrackerUnavailable {
                reason: "tracker response is not a dictionary".to_string(),
            })?;

        if let Some(reason) = dict.get(b"failure reason".as_slice()) {
            return Err(TorrentError::TrackerRejected {
                reason: reason
                    .as_str()
                    .unwrap_or("unreadable failure reason")
                    .to_string(),
            });
        }

        let interval = dict
            .get(b"interval".as_slice())
            .and_then(Value::as_int)
            .filter(|secs| *secs > 0)
            .ok_or_else(|| TorrentError::TrackerUnavailable {
                reason: "tracker response missing 'interval'".to_string(),
            })? as u32;

        let peers = match dict.get(b"peers".as_slice()) {
            Some(Value::Bytes(compact)) => Self::parse_compact_peers(compact)?,
            Some(Value::List(entries)) => Self::parse_dict_peers(entries),
            None => Vec::new(),
            Some(_) => {
                return Err(TorrentError::TrackerUnavailable {
                    reason: "tracker 'peers' has unexpected type".to_string(),
                });
            }
        };

        Ok(AnnounceResponse { interval, peers })
    }

    /// Parses the compact peer format: 6 bytes per peer, IPv4 + big-endian
    /// port. A zero-length string is legal and yields no candidates.
    fn parse_compact_peers(compact: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
        if compact.len() % 6 != 0 {
            return Err(TorrentError::TrackerUnavailable {
                reason: "compact peer string length not a multiple of 6".to_string(),
            });
        }
        Ok(compact
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect())
    }

    /// Parses the dictionary peer format: a list of `{ip, port, peer id}`
    /// entries. Unparseable entries are skipped.
    fn parse_dict_peers(entries: &[Value]) -> Vec<SocketAddr> {
        entries
            .iter()
            .filter_map(|entry| {
                let dict = entry.as_dict()?;
                let ip: std::net::IpAddr =
                    dict.get(b"ip".as_slice())?.as_str()?.parse().ok()?;
                let port = dict.get(b"port".as_slice())?.as_int()?;
                let port = u16::try_from(port).ok()?;
                Some(SocketAddr::new(ip, port))
            })
            .collect()
    }

    async fn announce_once(
        &self,
        base: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        let url = Self::build_announce_url(base, request)?;
        tracing::debug!("announcing to {base}");

        let response = self.client.get(&url).send().await.map_err(|e| {
            TorrentError::TrackerUnavailable {
                reason: format!("request to {base} failed: {e}"),
            }
        })?;
        if !response.status().is_success() {
            return Err(TorrentError::TrackerUnavailable {
                reason: format!("tracker returned HTTP {}", response.status()),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::TrackerUnavailable {
                reason: format!("failed to read tracker response: {e}"),
            })?;

        Self::parse_announce_response(&body)
    }
}

#[async_trait]
impl TrackerClient for HttpTracker {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let start = self.cursor.load(Ordering::Relaxed);
        let count = self.announce_urls.len();
        let mut last_error = None;

        for step in 0..count {
            let index = (start + step) % count;
            match self.announce_once(&self.announce_urls[index], &request).await {
                Ok(response) => {
                    self.cursor.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                // A rejection is an answer, not an outage; do not rotate past it.
                Err(error @ TorrentError::TrackerRejected { .. }) => return Err(error),
                Err(error) => {
                    tracing::debug!(
                        "announce to {} failed: {error}",
                        self.announce_urls[index]
                    );
                    last_error = Some(error);
                }
            }
        }

        self.cursor.store((start + 1) % count, Ordering::Relaxed);
        Err(last_error.unwrap_or(TorrentError::TrackerUnavailable {
            reason: "no announce URLs".to_string(),
        }))
    }

    fn url(&self) -> &str {
        &self.announce_urls[self.cursor.load(Ordering::Relaxed) % self.announce_urls.len()]
    }
}

/// Percent-encodes raw bytes per RFC 3986, leaving unreserved characters.
fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
