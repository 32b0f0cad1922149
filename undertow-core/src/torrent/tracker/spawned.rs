//! Tracker conversations running as background tasks
//!
//! Each tracker URL gets a tokio task that drives its `TrackerClient` and
//! transport. The owning side keeps a `SpawnedTracker` handle to collect
//! peers, request a stop and observe the final status.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::schedule::{Clock, TrackerClient, TrackerPhase};
use super::types::{AnnounceEvent, AnnounceResponse, ProgressSource, TrackerError, TrackerTransport};
use crate::config::TrackerConfig;
use crate::torrent::InfoHash;
use crate::torrent::protocol::PeerId;

/// Status of a tracker task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerStatus {
    Running,
    Stopped,
    Failed(TrackerError),
}

/// Control surface the manager uses for one tracker.
pub trait TrackerHandle: Send {
    fn url(&self) -> &str;

    /// Drains peers received since the last call.
    ///
    /// # Errors
    ///
    /// Returns the task's failure once no buffered peers remain.
    fn take_peers(&mut self) -> Result<Vec<SocketAddr>, TrackerError>;

    /// Asks the task to send its final announce and exit.
    fn stop(&self);

    fn has_stopped(&self) -> bool;
}

/// Everything a tracker task needs besides its transport.
#[derive(Clone)]
pub struct TrackerContext {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub total_size: u64,
    pub progress: Arc<dyn ProgressSource>,
    pub config: TrackerConfig,
    pub clock: Arc<dyn Clock>,
}

/// Handle to a running tracker task.
pub struct SpawnedTracker {
    url: String,
    peers_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
    stop_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<TrackerStatus>,
}

impl SpawnedTracker {
    /// Spawns the announce loop for `transport` on the current runtime.
    pub fn spawn<T: TrackerTransport + 'static>(transport: T, context: &TrackerContext) -> Self {
        let url = transport.url().to_string();
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(TrackerStatus::Running);

        let client = TrackerClient::new(
            context.info_hash,
            context.peer_id,
            context.port,
            context.total_size,
            &context.config,
            Arc::clone(&context.clock),
        );
        let task = TrackerTask {
            transport,
            client,
            progress: Arc::clone(&context.progress),
            config: context.config.clone(),
            peers_tx,
            stop_rx,
            status_tx,
        };
        tokio::spawn(task.run());

        Self {
            url,
            peers_rx,
            stop_tx,
            status_rx,
        }
    }

    pub fn status(&self) -> TrackerStatus {
        self.status_rx.borrow().clone()
    }
}

impl TrackerHandle for SpawnedTracker {
    fn url(&self) -> &str {
        &self.url
    }

    fn take_peers(&mut self) -> Result<Vec<SocketAddr>, TrackerError> {
        let mut peers = Vec::new();
        while let Ok(batch) = self.peers_rx.try_recv() {
            peers.extend(batch);
        }

        if peers.is_empty() {
            if let TrackerStatus::Failed(e) = &*self.status_rx.borrow() {
                return Err(e.clone());
            }
        }
        Ok(peers)
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn has_stopped(&self) -> bool {
        let finished = matches!(
            *self.status_rx.borrow(),
            TrackerStatus::Stopped | TrackerStatus::Failed(_)
        );
        finished || self.status_rx.has_changed().is_err()
    }
}

struct TrackerTask<T> {
    transport: T,
    client: TrackerClient,
    progress: Arc<dyn ProgressSource>,
    config: TrackerConfig,
    peers_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    stop_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<TrackerStatus>,
}

impl<T: TrackerTransport> TrackerTask<T> {
    async fn run(mut self) {
        let status = self.drive().await;
        match &status {
            TrackerStatus::Failed(e) => {
                tracing::warn!("Tracker {} failed: {}", self.transport.url(), e);
            }
            _ => tracing::debug!("Tracker {} stopped", self.transport.url()),
        }
        let _ = self.status_tx.send(status);
    }

    async fn drive(&mut self) -> TrackerStatus {
        let mut response: Option<AnnounceResponse> = None;
        let mut connection_error = false;
        let mut stop_requested = false;

        loop {
            let still_downloading = !(stop_requested || self.progress.bytes_left() == 0);
            let update = self.client.update(
                self.progress.bytes_uploaded(),
                self.progress.bytes_downloaded(),
                connection_error,
                response.take().as_ref(),
                still_downloading,
            );
            connection_error = false;

            let request = match update {
                Ok(Some(request)) => request,
                Ok(None) => {
                    if self.client.phase() == TrackerPhase::Completed {
                        return TrackerStatus::Stopped;
                    }
                    let wait = self
                        .client
                        .next_announce_in()
                        .unwrap_or(self.config.peer_poll_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = self.stop_rx.changed() => {
                            if changed.is_err() || *self.stop_rx.borrow() {
                                stop_requested = true;
                            }
                        }
                    }
                    continue;
                }
                Err(e) => return TrackerStatus::Failed(e),
            };

            let is_final = request.event == AnnounceEvent::Completed;
            match self.transport.announce(&request, !is_final).await {
                Ok(Some(reply)) => {
                    tracing::debug!(
                        "Tracker {} returned {} peers, next announce in {}s",
                        self.transport.url(),
                        reply.peers.len(),
                        reply.interval
                    );
                    if !reply.peers.is_empty() {
                        let _ = self.peers_tx.send(reply.peers.clone());
                    }
                    response = Some(reply);
                }
                Ok(None) => {}
                Err(e) if e.is_permanent() => return TrackerStatus::Failed(e),
                Err(e) => {
                    tracing::warn!("Announce to {} failed: {}", self.transport.url(), e);
                    connection_error = true;
                }
            }

            if is_final {
                return TrackerStatus::Stopped;
            }
        }
    }
}
