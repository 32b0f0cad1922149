//! Download conversation with one remote peer
//!
//! A session handshakes, negotiates interest and choking, then downloads
//! one piece at a time until the allocator reports the torrent complete.
//! Requests are sent while blocks are received on the same link.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::InfoHash;
use super::peer_availability::PeerAvailability;
use super::piece_download::{BlockRequests, PieceDownloadSession};
use super::piece_store::{PieceAllocator, PieceError};
use super::protocol::{
    LinkReader, LinkWriter, MessageCodec, PeerError, PeerHandshake, PeerId, PeerLink, PeerMessage,
};
use crate::config::PeerConfig;

/// Shared inputs every session of one torrent needs.
#[derive(Clone)]
pub struct SessionContext {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub allocator: Arc<dyn PieceAllocator>,
    pub config: PeerConfig,
}

/// Lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionState {
    Connecting,
    Handshaking,
    /// Handshake done, nothing heard from the peer yet
    AwaitingBitfield,
    Negotiating,
    RequestingPiece,
    Closed,
}

/// What the remote side has told us so far.
struct RemotePeer {
    availability: PeerAvailability,
    choking: bool,
}

impl RemotePeer {
    /// Applies a choke or availability update; other messages are ignored.
    fn apply(&mut self, message: &PeerMessage) -> Result<(), PeerError> {
        match message {
            PeerMessage::Choke => self.choking = true,
            PeerMessage::Unchoke => self.choking = false,
            PeerMessage::Have { piece_index } => self.availability.notify_have(*piece_index)?,
            PeerMessage::Bitfield { pieces } => self.availability.set_bitfield(pieces)?,
            PeerMessage::Piece {
                piece_index, offset, ..
            } => {
                tracing::debug!("PeerSession: ignoring unrequested block {offset} of piece {piece_index}");
            }
            other => tracing::trace!("PeerSession: ignoring {}", other.kind()),
        }
        Ok(())
    }
}

/// Download session with one peer over stream `S`.
pub struct PeerSession<S> {
    address: SocketAddr,
    link: PeerLink<S>,
    context: SessionContext,
    remote: RemotePeer,
    interested: bool,
    state: PeerSessionState,
}

impl PeerSession<TcpStream> {
    /// Opens a TCP connection to `address`.
    ///
    /// # Errors
    ///
    /// - `PeerError::ConnectionFailed` - If the connection was refused or
    ///   did not complete within the connect timeout
    pub async fn connect(address: SocketAddr, context: SessionContext) -> Result<Self, PeerError> {
        let connect_timeout = context.config.connect_timeout;
        tracing::debug!(peer = %address, "PeerSession: connecting");

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::ConnectionFailed {
                address,
                reason: format!("timed out after {connect_timeout:?}"),
            })?
            .map_err(|e| PeerError::ConnectionFailed {
                address,
                reason: e.to_string(),
            })?;

        Ok(Self::new(stream, address, context))
    }
}

impl<S: AsyncRead + AsyncWrite> PeerSession<S> {
    /// Wraps an established stream; nothing is sent until `run`.
    pub fn new(stream: S, address: SocketAddr, context: SessionContext) -> Self {
        let piece_count = context.allocator.piece_count();
        let link = PeerLink::new(stream, MessageCodec::new(piece_count), context.config.read_timeout);
        Self {
            address,
            link,
            context,
            remote: RemotePeer {
                availability: PeerAvailability::new(piece_count),
                choking: true,
            },
            interested: false,
            state: PeerSessionState::Connecting,
        }
    }

    pub fn state(&self) -> PeerSessionState {
        self.state
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Downloads from the peer until the torrent is complete.
    ///
    /// Choking and pieces the peer cannot supply send the session back to
    /// negotiation. A corrupted piece is given up and downloaded again.
    ///
    /// # Errors
    ///
    /// - `PeerError::InvalidHandshake` - If the peer is in another swarm
    /// - `PeerError::Timeout` - If the peer went quiet
    /// - `PeerError::ProtocolViolation` / `DuplicateBitfield` - If the peer
    ///   broke the protocol
    /// - `PeerError::ConnectionClosed` / `Io` - If the connection was lost
    pub async fn run(&mut self) -> Result<(), PeerError> {
        let result = self.drive().await;
        if let Err(e) = &result {
            tracing::debug!(peer = %self.address, "PeerSession: ended with {e}");
        }
        self.transition(PeerSessionState::Closed);
        result
    }

    async fn drive(&mut self) -> Result<(), PeerError> {
        self.transition(PeerSessionState::Handshaking);
        self.handshake().await?;
        self.transition(PeerSessionState::AwaitingBitfield);

        loop {
            if self.context.allocator.is_complete() {
                return Ok(());
            }
            if self.state != PeerSessionState::AwaitingBitfield {
                self.transition(PeerSessionState::Negotiating);
            }
            self.negotiate().await?;
            if self.context.allocator.is_complete() {
                return Ok(());
            }

            self.transition(PeerSessionState::RequestingPiece);
            match self.download_piece().await {
                Ok(()) => {}
                Err(PeerError::Piece(PieceError::NoPieceNeeded)) => {
                    tracing::debug!(peer = %self.address, "PeerSession: nothing claimable from peer");
                }
                Err(PeerError::ChokedWhileRequesting) => {
                    tracing::debug!(peer = %self.address, "PeerSession: choked mid-piece");
                }
                Err(PeerError::Piece(PieceError::CorruptedPiece { index })) => {
                    tracing::warn!(peer = %self.address, "PeerSession: piece {index} failed verification, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), PeerError> {
        let ours = PeerHandshake::new(self.context.info_hash, self.context.peer_id);
        let (reader, writer) = self.link.halves();
        writer.send_handshake(&ours).await?;
        let theirs = reader.read_handshake().await?;

        if theirs.info_hash != self.context.info_hash {
            return Err(PeerError::InvalidHandshake {
                reason: format!(
                    "peer is serving {} instead of {}",
                    theirs.info_hash, self.context.info_hash
                ),
            });
        }
        tracing::debug!(peer = %self.address, "PeerSession: handshake complete");
        Ok(())
    }

    /// Reads messages until the peer unchokes us while we are interested.
    ///
    /// Interest is re-checked every `interest_recheck_interval` even when the
    /// peer is quiet, since other sessions release pieces. Returns early once
    /// the torrent completes.
    async fn negotiate(&mut self) -> Result<(), PeerError> {
        let recheck = self.context.config.interest_recheck_interval;
        let read_timeout = self.context.config.read_timeout;
        let mut last_heard = Instant::now();

        loop {
            if self.context.allocator.is_complete() {
                return Ok(());
            }
            self.update_interest().await?;
            if !self.remote.choking && self.interested {
                return Ok(());
            }

            let message = match tokio::time::timeout(recheck, self.link.reader().read()).await {
                Ok(message) => message?,
                Err(_) if last_heard.elapsed() >= read_timeout => {
                    return Err(PeerError::Timeout {
                        after: read_timeout,
                    });
                }
                Err(_) => continue,
            };
            last_heard = Instant::now();
            tracing::debug!(peer = %self.address, "PeerSession: received {}", message.kind());
            self.remote.apply(&message)?;
            if self.state == PeerSessionState::AwaitingBitfield {
                self.transition(PeerSessionState::Negotiating);
            }
        }
    }

    async fn update_interest(&mut self) -> Result<(), PeerError> {
        let needed = self.context.allocator.needed_indexes();
        let wanted = self.remote.availability.has_needed_piece(&needed);

        if wanted && !self.interested {
            self.link.writer().send(&PeerMessage::Interested).await?;
            self.interested = true;
            tracing::debug!(peer = %self.address, "PeerSession: interested");
        } else if !wanted && self.interested {
            self.link.writer().send(&PeerMessage::NotInterested).await?;
            self.interested = false;
            tracing::debug!(peer = %self.address, "PeerSession: not interested");
        }
        Ok(())
    }

    async fn download_piece(&mut self) -> Result<(), PeerError> {
        let PeerSession {
            link,
            context,
            remote,
            ..
        } = self;

        let needed = context.allocator.needed_indexes();
        let mut download = PieceDownloadSession::begin(
            Arc::clone(&context.allocator),
            &needed,
            remote.availability.bitfield(),
        )?;
        let requests = download.requests(context.config.block_size);
        tracing::debug!(
            "PeerSession: requesting piece {} in {} blocks",
            download.index(),
            requests.len()
        );

        let (reader, writer) = link.halves();
        tokio::try_join!(
            send_requests(writer, requests, context.config.request_pacing),
            receive_blocks(reader, &mut download, remote),
        )?;

        let index = download.index();
        download.finish().await?;
        tracing::info!("PeerSession: downloaded piece {index}");
        Ok(())
    }

    fn transition(&mut self, next: PeerSessionState) {
        if self.state != next {
            tracing::debug!(peer = %self.address, "PeerSession: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

async fn send_requests<W: AsyncWrite + Unpin>(
    writer: &mut LinkWriter<W>,
    requests: BlockRequests,
    pacing: Duration,
) -> Result<(), PeerError> {
    for (sent, request) in requests.enumerate() {
        if sent > 0 {
            tokio::time::sleep(pacing).await;
        }
        writer.send(&request).await?;
    }
    Ok(())
}

async fn receive_blocks<R: AsyncRead + Unpin>(
    reader: &mut LinkReader<R>,
    download: &mut PieceDownloadSession,
    remote: &mut RemotePeer,
) -> Result<(), PeerError> {
    while !download.is_complete() {
        match reader.read().await? {
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } if piece_index == download.index() => {
                tracing::trace!("PeerSession: block {offset} of piece {piece_index}");
                download.add_block(piece_index, offset, data)?;
            }
            PeerMessage::Choke => {
                remote.choking = true;
                return Err(PeerError::ChokedWhileRequesting);
            }
            other => remote.apply(&other)?,
        }
    }
    Ok(())
}
