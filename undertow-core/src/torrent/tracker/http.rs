//! HTTP tracker transport with URL building and response parsing

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;

use super::protocol::{encoding, parse_compact_peers};
use super::types::{AnnounceRequest, AnnounceResponse, TrackerError, TrackerTransport};
use crate::config::TrackerConfig;

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;

fn malformed(reason: impl Into<String>) -> TrackerError {
    TrackerError::MalformedResponse {
        reason: reason.into(),
    }
}

/// Announces over HTTP(S) GET requests.
pub struct HttpTracker {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    /// Creates an HTTP tracker transport for `announce_url`.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Transport` - If the HTTP client cannot be built
    pub fn new(announce_url: impl Into<String>, config: &TrackerConfig) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| TrackerError::Transport {
                reason: format!("HTTP client creation failed: {e}"),
            })?;

        Ok(Self {
            announce_url: announce_url.into(),
            client,
        })
    }

    /// Announce URL with the request encoded as query parameters.
    ///
    /// Binary fields are percent-encoded by hand so they are not encoded
    /// twice by the HTTP client.
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            separator,
            encoding::url_encode_bytes(request.info_hash.as_bytes()),
            encoding::url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event.as_http_param() {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }

    /// Parses a bencoded announce reply.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Rejected` - If the tracker sent a failure reason
    /// - `TrackerError::MalformedResponse` - If the body is not a valid reply
    pub(super) fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
        let parsed = bencode_rs::Value::parse(body)
            .map_err(|e| malformed(format!("Failed to parse tracker response: {e:?}")))?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(malformed("Tracker response is not a dictionary"));
        };

        if let Some(bencode_rs::Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
            return Err(TrackerError::Rejected {
                reason: String::from_utf8_lossy(reason).into_owned(),
            });
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(bencode_rs::Value::Integer(value)) if *value >= 0 => {
                u32::try_from(*value).unwrap_or(u32::MAX)
            }
            _ => return Err(malformed("Missing interval in tracker response")),
        };

        let peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(compact)) => parse_compact_peers(compact)?,
            Some(bencode_rs::Value::List(entries)) => Self::parse_peer_dicts(entries),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval,
            peers,
            seeders: Self::optional_count(dict, b"complete"),
            leechers: Self::optional_count(dict, b"incomplete"),
        })
    }

    fn optional_count(dict: &BencodeDict<'_>, key: &[u8]) -> Option<u32> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => u32::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Non-compact peer list; entries that are not IPv4 are skipped.
    fn parse_peer_dicts(entries: &[bencode_rs::Value<'_>]) -> Vec<SocketAddr> {
        entries
            .iter()
            .filter_map(|entry| {
                let bencode_rs::Value::Dictionary(peer) = entry else {
                    return None;
                };
                let Some(bencode_rs::Value::Bytes(ip)) = peer.get(b"ip".as_slice()) else {
                    return None;
                };
                let Some(bencode_rs::Value::Integer(port)) = peer.get(b"port".as_slice()) else {
                    return None;
                };

                let ip_text = String::from_utf8_lossy(ip);
                match (ip_text.parse::<Ipv4Addr>(), u16::try_from(*port)) {
                    (Ok(ip), Ok(port)) => Some(SocketAddr::V4(SocketAddrV4::new(ip, port))),
                    _ => {
                        tracing::debug!("Skipping peer entry {}:{}", ip_text, port);
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl TrackerTransport for HttpTracker {
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
        expect_response: bool,
    ) -> Result<Option<AnnounceResponse>, TrackerError> {
        let url = self.build_announce_url(request);
        tracing::debug!("Announcing to tracker: {} ({:?})", self.announce_url, request.event);

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);
            TrackerError::Transport {
                reason: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Transport {
                reason: format!("HTTP status {status}"),
            });
        }

        if !expect_response {
            return Ok(None);
        }

        let body = response.bytes().await.map_err(|e| TrackerError::Transport {
            reason: format!("Failed to read response body: {e}"),
        })?;

        let parsed = Self::parse_announce_response(&body)?;
        tracing::debug!(
            "Announced to {}, received {} peers",
            self.announce_url,
            parsed.peers.len()
        );
        Ok(Some(parsed))
    }

    fn url(&self) -> &str {
        &self.announce_url
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::torrent::InfoHash;
    use crate::torrent::protocol::PeerId;
    use crate::torrent::tracker::AnnounceEvent;

    fn request(event: AnnounceEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x11; 20]),
            peer_id: PeerId::new([0x22; 20]),
            port: 6881,
            uploaded: 1000,
            downloaded: 500,
            left: 2000,
            event,
        }
    }

    fn tracker(url: &str) -> HttpTracker {
        HttpTracker::new(url, &TrackerConfig::default()).unwrap()
    }

    /// Serves one HTTP response and returns the request line it received.
    async fn serve_once(body: Vec<u8>) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 1024];
            while !received.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..read]);
            }

            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            // The client may hang up early when it does not read the body.
            let _ = stream.write_all(header.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;

            let text = String::from_utf8_lossy(&received).into_owned();
            text.lines().next().unwrap_or_default().to_string()
        });

        (url, handle)
    }

    #[test]
    fn test_build_announce_url() {
        let url = tracker("http://tracker.test/announce").build_announce_url(&request(AnnounceEvent::Started));

        assert!(url.starts_with("http://tracker.test/announce?info_hash="));
        assert!(url.contains(&format!("info_hash={}", "%11".repeat(20))));
        assert!(url.contains(&format!("peer_id={}", "%22".repeat(20))));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=1000"));
        assert!(url.contains("downloaded=500"));
        assert!(url.contains("left=2000"));
        assert!(url.contains("compact=1"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_regular_announce_omits_event() {
        let url = tracker("http://tracker.test/announce?passkey=abc")
            .build_announce_url(&request(AnnounceEvent::None));

        assert!(url.starts_with("http://tracker.test/announce?passkey=abc&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_parse_compact_response() {
        let body = b"d8:intervali1800e8:completei10e10:incompletei5e5:peers6:\x7f\x00\x00\x01\x1a\x09e";

        let response = HttpTracker::parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.seeders, Some(10));
        assert_eq!(response.leechers, Some(5));
        assert_eq!(response.peers, vec!["127.0.0.1:6665".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.74:porti51413eed2:ip3:::14:porti6881eeee";

        let response = HttpTracker::parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.seeders, None);
        assert_eq!(response.peers, vec!["10.0.0.7:51413".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_parse_failure_reason() {
        let result = HttpTracker::parse_announce_response(b"d14:failure reason5:errore");
        assert_eq!(
            result,
            Err(TrackerError::Rejected {
                reason: "error".to_string()
            })
        );
    }

    #[test]
    fn test_parse_missing_interval() {
        let result = HttpTracker::parse_announce_response(b"d5:peers0:e");
        assert!(matches!(result, Err(TrackerError::MalformedResponse { .. })));

        let result = HttpTracker::parse_announce_response(b"not bencode");
        assert!(matches!(result, Err(TrackerError::MalformedResponse { .. })));
    }

    #[tokio::test]
    async fn test_announce_against_local_server() {
        let body = b"d8:intervali60e5:peers12:\x0a\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1a\xe2e".to_vec();
        let (url, server) = serve_once(body).await;
        let mut tracker = tracker(&url);

        let response = tracker
            .announce(&request(AnnounceEvent::Started), true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.interval, 60);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1].to_string(), "10.0.0.2:6882");

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /announce?info_hash="));
        assert!(request_line.contains("event=started"));
    }

    #[tokio::test]
    async fn test_final_announce_skips_response() {
        let (url, server) = serve_once(b"garbage".to_vec()).await;
        let mut tracker = tracker(&url);

        let response = tracker
            .announce(&request(AnnounceEvent::Completed), false)
            .await
            .unwrap();

        assert_eq!(response, None);
        assert!(server.await.unwrap().contains("event=completed"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        drop(listener);

        let result = tracker(&url).announce(&request(AnnounceEvent::None), true).await;
        assert!(matches!(result, Err(TrackerError::Transport { .. })));
    }
}
