//! Peer dialing loop of the download command
//!
//! Polls the trackers for addresses, queues every new one and keeps up to
//! `max_peers` sessions running until the piece store is complete.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use undertow_core::config::UndertowConfig;
use undertow_core::torrent::tracker::TrackerManager;
use undertow_core::torrent::{PeerError, PieceAllocator, PieceStore};

/// Limits and timings of the dialing loop.
#[derive(Debug, Clone)]
pub struct SwarmSettings {
    pub max_peers: usize,
    pub peer_poll_interval: Duration,
    /// Upper bound on waiting for the final announces
    pub stop_timeout: Duration,
}

impl SwarmSettings {
    pub fn from_config(config: &UndertowConfig) -> Self {
        Self {
            max_peers: config.peer.max_peer_connections.max(1),
            peer_poll_interval: config.tracker.peer_poll_interval,
            stop_timeout: config.tracker.http_timeout,
        }
    }
}

/// Runs sessions produced by `dial` until `store` is complete.
///
/// Each address is dialed at most once. Addresses beyond the connection cap
/// wait in a queue and are dialed as sessions finish.
///
/// # Errors
/// - Every tracker failed before the download completed
pub async fn run_swarm<D, F>(
    trackers: &mut TrackerManager,
    store: &PieceStore,
    settings: &SwarmSettings,
    dial: D,
) -> Result<()>
where
    D: Fn(SocketAddr) -> F,
    F: Future<Output = Result<(), PeerError>> + Send + 'static,
{
    let mut sessions: JoinSet<(SocketAddr, Result<(), PeerError>)> = JoinSet::new();
    let mut seen = HashSet::new();
    let mut pending = VecDeque::new();
    let mut poll = tokio::time::interval(settings.peer_poll_interval);

    while !store.is_complete() {
        tokio::select! {
            _ = poll.tick() => {
                let peers = match trackers.get_peers() {
                    Ok(peers) => peers,
                    Err(e) => {
                        sessions.abort_all();
                        return Err(e).context("Download cannot continue");
                    }
                };
                pending.extend(peers.into_iter().filter(|address| seen.insert(*address)));

                tracing::info!(
                    "Download: {}/{} pieces, {} peers connected, {} queued",
                    store.downloaded_count(),
                    store.piece_count(),
                    sessions.len(),
                    pending.len()
                );
            }
            Some(joined) = sessions.join_next() => {
                match joined {
                    Ok((address, Ok(()))) => tracing::debug!("Download: session with {address} finished"),
                    Ok((address, Err(e))) => tracing::debug!("Download: session with {address} ended: {e}"),
                    Err(e) => tracing::warn!("Download: session task failed: {e}"),
                }
            }
        }

        while sessions.len() < settings.max_peers {
            let Some(address) = pending.pop_front() else {
                break;
            };
            let session = dial(address);
            sessions.spawn(async move { (address, session.await) });
        }
    }

    sessions.abort_all();
    if tokio::time::timeout(settings.stop_timeout, trackers.stop())
        .await
        .is_err()
    {
        tracing::warn!("Download: trackers did not stop in time");
    }
    Ok(())
}
