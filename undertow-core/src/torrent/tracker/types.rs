//! Core types for BitTorrent tracker communication

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::InfoHash;
use crate::torrent::protocol::PeerId;

/// Tracker announce request.
///
/// Client statistics and torrent identity reported on every announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    /// Unique identifier for the torrent being announced
    pub info_hash: InfoHash,
    /// Client's 20-byte identifier
    pub peer_id: PeerId,
    /// TCP port reported to the swarm
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes of verified pieces
    pub downloaded: u64,
    /// Bytes remaining to download
    pub left: u64,
    /// Lifecycle event carried by this announce
    pub event: AnnounceEvent,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    /// Regular interval announce
    #[default]
    None,
    /// First announce of the session
    Started,
    /// Final announce, sent once
    Completed,
}

impl AnnounceEvent {
    /// Value of the HTTP `event` parameter, absent for regular announces.
    pub fn as_http_param(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
        }
    }

    /// Event code in a UDP announce datagram.
    pub fn as_udp_code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds until the next announce
    pub interval: u32,
    /// Peer addresses for connection attempts
    pub peers: Vec<SocketAddr>,
    /// Peers with the complete payload, when reported
    pub seeders: Option<u32>,
    /// Peers still downloading, when reported
    pub leechers: Option<u32>,
}

/// Errors from tracker transports, scheduling and management.
///
/// Cloneable so a task's final status can be observed from several places.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("Tracker failed {failures} times in a row")]
    TooManyFailures { failures: u32 },

    #[error("Tracker host {host} has no IPv4 address")]
    UnsupportedAddressFamily { host: String },

    #[error("Tracker host {host} could not be resolved: {reason}")]
    UnreachableHost { host: String, reason: String },

    #[error("Unsupported tracker scheme: {url}")]
    UnsupportedScheme { url: String },

    #[error("Invalid tracker URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Tracker transport error: {reason}")]
    Transport { reason: String },

    #[error("Tracker did not answer after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Tracker rejected announce: {reason}")]
    Rejected { reason: String },

    #[error("Malformed tracker response: {reason}")]
    MalformedResponse { reason: String },

    #[error("No tracker left")]
    NoTrackerLeft,
}

impl TrackerError {
    /// Errors after which a tracker is abandoned for good.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TrackerError::TooManyFailures { .. }
                | TrackerError::UnsupportedAddressFamily { .. }
                | TrackerError::UnreachableHost { .. }
        )
    }
}

/// One announce conversation over a concrete protocol.
#[async_trait]
pub trait TrackerTransport: Send {
    /// Sends `request` and, if `expect_response`, waits for the reply.
    ///
    /// Returns `Ok(None)` when no reply was awaited.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Transport` / `Timeout` - Network failure, retried later
    /// - `TrackerError::Rejected` - Tracker answered with an error
    /// - `TrackerError::MalformedResponse` - Reply could not be decoded
    /// - `TrackerError::UnreachableHost` / `UnsupportedAddressFamily` - Permanent
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
        expect_response: bool,
    ) -> Result<Option<AnnounceResponse>, TrackerError>;

    /// Announce URL this transport talks to.
    fn url(&self) -> &str;
}

/// Download progress reported to trackers.
pub trait ProgressSource: Send + Sync {
    fn bytes_downloaded(&self) -> u64;

    fn bytes_uploaded(&self) -> u64;

    fn bytes_left(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_encodings() {
        assert_eq!(AnnounceEvent::None.as_http_param(), None);
        assert_eq!(AnnounceEvent::Started.as_http_param(), Some("started"));
        assert_eq!(AnnounceEvent::Completed.as_http_param(), Some("completed"));

        assert_eq!(AnnounceEvent::None.as_udp_code(), 0);
        assert_eq!(AnnounceEvent::Completed.as_udp_code(), 1);
        assert_eq!(AnnounceEvent::Started.as_udp_code(), 2);
    }

    #[test]
    fn test_permanent_errors() {
        assert!(TrackerError::TooManyFailures { failures: 4 }.is_permanent());
        assert!(
            TrackerError::UnsupportedAddressFamily {
                host: "v6.test".to_string()
            }
            .is_permanent()
        );
        assert!(
            TrackerError::UnreachableHost {
                host: "nowhere.test".to_string(),
                reason: "no such host".to_string()
            }
            .is_permanent()
        );
        assert!(!TrackerError::Timeout { attempts: 4 }.is_permanent());
        assert!(
            !TrackerError::Rejected {
                reason: "banned".to_string()
            }
            .is_permanent()
        );
    }
}
