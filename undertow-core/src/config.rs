//! Centralized configuration for Undertow.
//!
//! All tunable timeouts, limits and paths are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Central configuration for all Undertow components.
///
/// Groups related settings into sections. Every section has defaults and
/// `from_env` applies `UNDERTOW_*` overrides on top.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub peer: PeerConfig,
    pub tracker: TrackerConfig,
    pub storage: StorageConfig,
}

/// Peer wire protocol settings.
///
/// Controls block sizing, request pacing and the timeouts that bound every
/// wait on a peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Size of each block requested from a peer
    pub block_size: u32,
    /// Delay between consecutive block requests
    pub request_pacing: Duration,
    /// Longest silence tolerated while waiting for peer bytes
    pub read_timeout: Duration,
    /// How often a negotiating session re-checks which pieces it can claim
    pub interest_recheck_interval: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Port reported to trackers
    pub listen_port: u16,
    /// Maximum concurrent peer sessions
    pub max_peer_connections: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            block_size: 16384, // 16 KiB
            request_pacing: Duration::from_millis(10),
            read_timeout: Duration::from_secs(30),
            interest_recheck_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
            listen_port: 6881,
            max_peer_connections: 50,
        }
    }
}

/// Tracker communication settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Base of the exponential back-off after a failed announce
    pub failure_base_interval: Duration,
    /// Consecutive failures tolerated before a tracker is dropped
    pub max_failures: u32,
    /// UDP timeout for the first attempt, doubled on each retry
    pub udp_base_timeout: Duration,
    /// Times a UDP datagram is sent before giving up
    pub udp_retransmissions: u32,
    /// HTTP announce request timeout
    pub http_timeout: Duration,
    /// Lifetime of a UDP connection id
    pub connection_id_ttl: Duration,
    /// How often shutdown checks whether every tracker has stopped
    pub stop_poll_interval: Duration,
    /// How often the downloader collects new peers
    pub peer_poll_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            failure_base_interval: Duration::from_secs(5),
            max_failures: 3,
            udp_base_timeout: Duration::from_secs(15),
            udp_retransmissions: 4,
            http_timeout: Duration::from_secs(30),
            connection_id_ttl: Duration::from_secs(60),
            stop_poll_interval: Duration::from_millis(100),
            peer_poll_interval: Duration::from_secs(5),
            user_agent: "undertow/0.1.0",
        }
    }
}

/// File storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory downloaded files are written under
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
        }
    }
}

fn env_override<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Config: ignoring {name}={value}, not a valid value");
            None
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Durations are given in whole seconds. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_override::<u64>("UNDERTOW_PEER_TIMEOUT") {
            config.peer.read_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_override::<u64>("UNDERTOW_CONNECT_TIMEOUT") {
            config.peer.connect_timeout = Duration::from_secs(seconds);
        }
        if let Some(count) = env_override::<usize>("UNDERTOW_MAX_PEERS") {
            config.peer.max_peer_connections = count.max(1);
        }
        if let Some(port) = env_override::<u16>("UNDERTOW_LISTEN_PORT") {
            config.peer.listen_port = port;
        }
        if let Some(seconds) = env_override::<u64>("UNDERTOW_TRACKER_TIMEOUT") {
            config.tracker.http_timeout = Duration::from_secs(seconds);
        }
        if let Some(dir) = env_override::<PathBuf>("UNDERTOW_DOWNLOAD_DIR") {
            config.storage.download_dir = dir;
        }

        config
    }

    /// Creates a configuration with short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            peer: PeerConfig {
                request_pacing: Duration::from_millis(1),
                read_timeout: Duration::from_secs(5),
                interest_recheck_interval: Duration::from_millis(10),
                connect_timeout: Duration::from_secs(1),
                ..PeerConfig::default()
            },
            tracker: TrackerConfig {
                failure_base_interval: Duration::from_millis(10),
                udp_base_timeout: Duration::from_millis(50),
                http_timeout: Duration::from_secs(2),
                stop_poll_interval: Duration::from_millis(5),
                peer_poll_interval: Duration::from_millis(20),
                ..TrackerConfig::default()
            },
            storage: StorageConfig::default(),
        }
    }
}
