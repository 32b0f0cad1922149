//! UDP tracker transport (BEP 15)
//!
//! Connect then announce over one connected socket. Every datagram is
//! retransmitted with a doubling timeout, and the connection id is reused
//! until it expires or any exchange fails.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};
use url::{Host, Url};

use super::udp_codec::{UdpResponse, UdpTrackerCodec};
use super::types::{AnnounceRequest, AnnounceResponse, TrackerError, TrackerTransport};
use crate::config::TrackerConfig;

/// Largest datagram read from a tracker.
const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy)]
struct Retransmit {
    base_timeout: Duration,
    attempts: u32,
}

fn transport(e: std::io::Error) -> TrackerError {
    TrackerError::Transport {
        reason: e.to_string(),
    }
}

/// Announces over UDP to a single tracker host.
pub struct UdpTracker {
    announce_url: String,
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
    connection: Option<(u64, Instant)>,
    connection_id_ttl: Duration,
    retransmit: Retransmit,
    key: u32,
}

impl UdpTracker {
    /// Creates a UDP tracker transport. No socket is opened until the
    /// first announce.
    ///
    /// # Errors
    ///
    /// - `TrackerError::InvalidUrl` - If the URL cannot be parsed or has no port
    /// - `TrackerError::UnsupportedScheme` - If the scheme is not `udp`
    /// - `TrackerError::UnsupportedAddressFamily` - If the host is an IPv6 literal
    pub fn new(announce_url: impl Into<String>, config: &TrackerConfig) -> Result<Self, TrackerError> {
        let announce_url = announce_url.into();
        let invalid = |reason: &str| TrackerError::InvalidUrl {
            url: announce_url.clone(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(&announce_url).map_err(|e| invalid(&e.to_string()))?;
        if parsed.scheme() != "udp" {
            return Err(TrackerError::UnsupportedScheme {
                url: announce_url.clone(),
            });
        }

        let host = match parsed.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(address)) => address.to_string(),
            Some(Host::Ipv6(address)) => {
                return Err(TrackerError::UnsupportedAddressFamily {
                    host: address.to_string(),
                });
            }
            None => return Err(invalid("missing host")),
        };
        let port = parsed.port().ok_or_else(|| invalid("missing port"))?;

        Ok(Self {
            host,
            port,
            socket: None,
            connection: None,
            connection_id_ttl: config.connection_id_ttl,
            retransmit: Retransmit {
                base_timeout: config.udp_base_timeout,
                attempts: config.udp_retransmissions.max(1),
            },
            key: rand::random(),
            announce_url,
        })
    }

    async fn open_socket(&self) -> Result<UdpSocket, TrackerError> {
        let addresses = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| TrackerError::UnreachableHost {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        let address = addresses
            .into_iter()
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TrackerError::UnsupportedAddressFamily {
                host: self.host.clone(),
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(transport)?;
        socket.connect(address).await.map_err(transport)?;
        tracing::debug!("UDP tracker {} resolved to {}", self.announce_url, address);
        Ok(socket)
    }

    async fn announce_inner(
        &mut self,
        request: &AnnounceRequest,
        expect_response: bool,
    ) -> Result<Option<AnnounceResponse>, TrackerError> {
        let retransmit = self.retransmit;
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => self.open_socket().await?,
        };
        let socket = &*self.socket.insert(socket);

        let connection_id = match self.connection {
            Some((id, obtained)) if obtained.elapsed() < self.connection_id_ttl => id,
            _ => {
                let transaction_id = rand::random();
                let datagram = UdpTrackerCodec::encode_connect(transaction_id);
                let connection_id =
                    match Self::exchange(socket, &datagram, transaction_id, retransmit).await? {
                        UdpResponse::Connect { connection_id, .. } => connection_id,
                        UdpResponse::Error { message, .. } => {
                            return Err(TrackerError::Rejected { reason: message });
                        }
                        UdpResponse::Announce { .. } => {
                            return Err(TrackerError::MalformedResponse {
                                reason: "announce reply to connect request".to_string(),
                            });
                        }
                    };
                self.connection = Some((connection_id, Instant::now()));
                connection_id
            }
        };

        let transaction_id = rand::random();
        let datagram =
            UdpTrackerCodec::encode_announce(connection_id, transaction_id, self.key, request);

        if !expect_response {
            socket.send(&datagram).await.map_err(transport)?;
            return Ok(None);
        }

        match Self::exchange(socket, &datagram, transaction_id, retransmit).await? {
            UdpResponse::Announce { response, .. } => Ok(Some(response)),
            UdpResponse::Error { message, .. } => Err(TrackerError::Rejected { reason: message }),
            UdpResponse::Connect { .. } => Err(TrackerError::MalformedResponse {
                reason: "connect reply to announce request".to_string(),
            }),
        }
    }

    /// Sends `datagram` until a reply carrying `transaction_id` arrives.
    ///
    /// Attempt `n` waits `base_timeout * 2^n`.
    async fn exchange(
        socket: &UdpSocket,
        datagram: &[u8],
        transaction_id: u32,
        retransmit: Retransmit,
    ) -> Result<UdpResponse, TrackerError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        for attempt in 0..retransmit.attempts {
            socket.send(datagram).await.map_err(transport)?;
            let wait = retransmit
                .base_timeout
                .saturating_mul(1u32 << attempt.min(16));

            match timeout(wait, Self::receive_reply(socket, &mut buffer, transaction_id)).await {
                Ok(reply) => return reply,
                Err(_) => tracing::debug!(
                    "No tracker reply within {:?} (attempt {}/{})",
                    wait,
                    attempt + 1,
                    retransmit.attempts
                ),
            }
        }

        Err(TrackerError::Timeout {
            attempts: retransmit.attempts,
        })
    }

    async fn receive_reply(
        socket: &UdpSocket,
        buffer: &mut [u8],
        transaction_id: u32,
    ) -> Result<UdpResponse, TrackerError> {
        loop {
            let length = socket.recv(buffer).await.map_err(transport)?;
            match UdpTrackerCodec::decode_response(&buffer[..length]) {
                Ok(reply) if reply.transaction_id() == transaction_id => return Ok(reply),
                Ok(reply) => tracing::debug!(
                    "Ignoring reply for transaction {:#x}",
                    reply.transaction_id()
                ),
                Err(e) => tracing::debug!("Ignoring undecodable tracker datagram: {}", e),
            }
        }
    }
}

#[async_trait]
impl TrackerTransport for UdpTracker {
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
        expect_response: bool,
    ) -> Result<Option<AnnounceResponse>, TrackerError> {
        let result = self.announce_inner(request, expect_response).await;
        if let Err(e) = &result {
            tracing::debug!("UDP announce to {} failed: {}", self.announce_url, e);
            self.connection = None;
        }
        result
    }

    fn url(&self) -> &str {
        &self.announce_url
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::config::UndertowConfig;
    use crate::torrent::InfoHash;
    use crate::torrent::protocol::PeerId;
    use crate::torrent::tracker::AnnounceEvent;

    const CONNECTION_ID: u64 = 0x0102_0304_0506_0708;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x33; 20]),
            peer_id: PeerId::new([0x44; 20]),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: AnnounceEvent::Started,
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            udp_retransmissions: 3,
            ..UndertowConfig::for_testing().tracker
        }
    }

    async fn fake_tracker() -> (UdpSocket, String) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", server.local_addr().unwrap());
        (server, url)
    }

    async fn receive(server: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (length, from) = server.recv_from(&mut buffer).await.unwrap();
        buffer.truncate(length);
        (buffer, from)
    }

    fn transaction_id(datagram: &[u8]) -> u32 {
        u32::from_be_bytes([datagram[12], datagram[13], datagram[14], datagram[15]])
    }

    fn connect_reply(transaction_id: u32) -> Vec<u8> {
        let mut reply: Vec<u8> = Vec::new();
        reply.put_u32(0);
        reply.put_u32(transaction_id);
        reply.put_u64(CONNECTION_ID);
        reply
    }

    fn announce_reply(transaction_id: u32) -> Vec<u8> {
        let mut reply: Vec<u8> = Vec::new();
        reply.put_u32(1);
        reply.put_u32(transaction_id);
        reply.put_u32(120);
        reply.put_u32(2);
        reply.put_u32(7);
        reply.put_slice(&[192, 168, 0, 9, 0x1a, 0xe1]);
        reply
    }

    fn error_reply(transaction_id: u32, message: &[u8]) -> Vec<u8> {
        let mut reply: Vec<u8> = Vec::new();
        reply.put_u32(3);
        reply.put_u32(transaction_id);
        reply.put_slice(message);
        reply
    }

    #[tokio::test]
    async fn test_connect_then_announce() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(url, &config()).unwrap();

        let fake = tokio::spawn(async move {
            let (connect, from) = receive(&server).await;
            assert_eq!(connect.len(), 16);
            server.send_to(&connect_reply(transaction_id(&connect)), from).await.unwrap();

            for _ in 0..2 {
                let (announce, from) = receive(&server).await;
                assert_eq!(announce.len(), 98);
                assert_eq!(&announce[..8], &CONNECTION_ID.to_be_bytes());
                server.send_to(&announce_reply(transaction_id(&announce)), from).await.unwrap();
            }
        });

        let first = tracker.announce(&request(), true).await.unwrap().unwrap();
        assert_eq!(first.interval, 120);
        assert_eq!(first.leechers, Some(2));
        assert_eq!(first.seeders, Some(7));
        assert_eq!(first.peers, vec!["192.168.0.9:6881".parse::<SocketAddr>().unwrap()]);

        // Cached connection id: no second connect exchange.
        let second = tracker.announce(&request(), true).await.unwrap().unwrap();
        assert_eq!(second.interval, 120);

        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_retransmits_after_lost_datagram() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(url, &config()).unwrap();

        let fake = tokio::spawn(async move {
            let (dropped, _) = receive(&server).await;
            let (connect, from) = receive(&server).await;
            assert_eq!(dropped, connect);
            server.send_to(&connect_reply(transaction_id(&connect)), from).await.unwrap();

            let (announce, from) = receive(&server).await;
            server.send_to(&announce_reply(transaction_id(&announce)), from).await.unwrap();
        });

        let response = tracker.announce(&request(), true).await.unwrap();
        assert!(response.is_some());
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_ignores_foreign_transaction() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(url, &config()).unwrap();

        let fake = tokio::spawn(async move {
            let (connect, from) = receive(&server).await;
            let expected = transaction_id(&connect);
            server.send_to(&connect_reply(expected.wrapping_add(1)), from).await.unwrap();
            server.send_to(b"junk", from).await.unwrap();
            server.send_to(&connect_reply(expected), from).await.unwrap();

            let (announce, from) = receive(&server).await;
            server.send_to(&announce_reply(transaction_id(&announce)), from).await.unwrap();
        });

        let response = tracker.announce(&request(), true).await.unwrap();
        assert!(response.is_some());
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_action_rejects_and_clears_connection() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(url, &config()).unwrap();

        let fake = tokio::spawn(async move {
            let (connect, from) = receive(&server).await;
            server.send_to(&connect_reply(transaction_id(&connect)), from).await.unwrap();
            let (announce, from) = receive(&server).await;
            server
                .send_to(&error_reply(transaction_id(&announce), b"unregistered torrent"), from)
                .await
                .unwrap();
        });

        let result = tracker.announce(&request(), true).await;
        assert_eq!(
            result,
            Err(TrackerError::Rejected {
                reason: "unregistered torrent".to_string()
            })
        );
        assert!(tracker.connection.is_none());
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out_after_all_attempts() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(url, &config()).unwrap();

        let result = tracker.announce(&request(), true).await;
        assert_eq!(result, Err(TrackerError::Timeout { attempts: 3 }));
        drop(server);
    }

    #[tokio::test]
    async fn test_final_announce_does_not_wait() {
        let (server, url) = fake_tracker().await;
        let mut tracker = UdpTracker::new(url, &config()).unwrap();

        let fake = tokio::spawn(async move {
            let (connect, from) = receive(&server).await;
            server.send_to(&connect_reply(transaction_id(&connect)), from).await.unwrap();
            let (announce, _) = receive(&server).await;
            u32::from_be_bytes([announce[80], announce[81], announce[82], announce[83]])
        });

        let final_request = AnnounceRequest {
            event: AnnounceEvent::Completed,
            ..request()
        };
        assert_eq!(tracker.announce(&final_request, false).await.unwrap(), None);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[test]
    fn test_rejects_unsupported_urls() {
        let config = TrackerConfig::default();

        assert!(matches!(
            UdpTracker::new("udp://[::1]:6969/announce", &config),
            Err(TrackerError::UnsupportedAddressFamily { .. })
        ));
        assert!(matches!(
            UdpTracker::new("udp://tracker.test/announce", &config),
            Err(TrackerError::InvalidUrl { .. })
        ));
        assert!(matches!(
            UdpTracker::new("http://tracker.test:80/announce", &config),
            Err(TrackerError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            UdpTracker::new("not a url", &config),
            Err(TrackerError::InvalidUrl { .. })
        ));
    }
}
