//! Centralized configuration for undertow.
//!
//! All tunable parameters live here; modules take the section they need
//! instead of scattering hard-coded values.

use std::time::Duration;

/// Central configuration for all undertow components.
///
/// Groups related settings into logical sections. Supports environment
/// variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    /// Field.
    pub torrent: TorrentConfig,
    /// Field.
    pub network: NetworkConfig,
}

/// Download-engine parameters.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Outstanding block requests per peer, clamped to 1..=50
    pub pipeline_depth: usize,
    /// Deadline for an individual block request
    pub request_timeout: Duration,
    /// End-game engages when this many pieces or fewer remain
    pub endgame_threshold: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 5,
            request_timeout: Duration::from_secs(30),
            endgame_threshold: 2,
        }
    }
}

impl TorrentConfig {
    /// Pipeline depth with the protocol bounds applied.
    pub fn clamped_pipeline_depth(&self) -> usize {
        self.pipeline_depth.clamp(1, 50)
    }
}

/// Network, peer, and tracker parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Port advertised to the tracker (no listener is bound in v1)
    pub announce_port: u16,
    /// User agent for tracker HTTP requests
    pub user_agent: &'static str,
    /// Maximum concurrent peer connections
    pub max_peers: usize,
    /// TCP connect timeout when dialing a candidate peer
    pub dial_timeout: Duration,
    /// Deadline for completing the 68-byte handshake exchange
    pub handshake_timeout: Duration,
    /// Send a keep-alive after this long without sending anything
    pub keepalive_interval: Duration,
    /// Drop a peer after this long without receiving anything
    pub idle_timeout: Duration,
    /// Announce interval clamp, low end
    pub min_announce_interval: Duration,
    /// Announce interval clamp, high end
    pub max_announce_interval: Duration,
    /// First retry delay after a failed announce; doubles per failure
    pub announce_backoff_start: Duration,
    /// Best-effort budget for the `stopped` announce at shutdown
    pub stopped_announce_deadline: Duration,
    /// Cool-down before a failed peer address may be redialed
    pub failed_peer_cooldown: Duration,
    /// Bound on the candidate peer queue; excess addresses are dropped
    pub candidate_queue_limit: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            announce_port: 6881,
            user_agent: "undertow/0.1.0",
            max_peers: 30,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(120),
            min_announce_interval: Duration::from_secs(30),
            max_announce_interval: Duration::from_secs(3600),
            announce_backoff_start: Duration::from_secs(30),
            stopped_announce_deadline: Duration::from_secs(5),
            failed_peer_cooldown: Duration::from_secs(300),
            candidate_queue_limit: 256,
        }
    }
}

impl NetworkConfig {
    /// Clamps a tracker-supplied announce interval to the configured range.
    pub fn clamp_announce_interval(&self, interval: Duration) -> Duration {
        interval.clamp(self.min_announce_interval, self.max_announce_interval)
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("UNDERTOW_MAX_PEERS")
            && let Ok(count) = value.parse::<usize>()
        {
            config.network.max_peers = count;
        }
        if let Ok(value) = std::env::var("UNDERTOW_PORT")
            && let Ok(port) = value.parse::<u16>()
        {
            config.network.announce_port = port;
        }
        if let Ok(value) = std::env::var("UNDERTOW_TRACKER_TIMEOUT")
            && let Ok(seconds) = value.parse::<u64>()
        {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }
        if let Ok(value) = std::env::var("UNDERTOW_PIPELINE_DEPTH")
            && let Ok(depth) = value.parse::<usize>()
        {
            config.torrent.pipeline_depth = depth;
        }

        config
    }
}
