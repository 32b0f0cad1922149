//! Tracker management for handling multiple tracker URLs per torrent

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

use super::http::HttpTracker;
use super::spawned::{SpawnedTracker, TrackerContext, TrackerHandle};
use super::types::TrackerError;
use super::udp::UdpTracker;

/// Creates a running tracker for one announce URL.
pub trait TrackerFactory: Send + Sync {
    /// # Errors
    ///
    /// - `TrackerError::InvalidUrl` - If the URL cannot be parsed
    /// - `TrackerError::UnsupportedScheme` - If no transport handles the scheme
    fn create(&self, url: &str) -> Result<Box<dyn TrackerHandle>, TrackerError>;
}

/// Factory spawning HTTP and UDP trackers on the current runtime.
pub struct NetworkTrackerFactory {
    context: TrackerContext,
}

impl NetworkTrackerFactory {
    pub fn new(context: TrackerContext) -> Self {
        Self { context }
    }
}

impl TrackerFactory for NetworkTrackerFactory {
    fn create(&self, url: &str) -> Result<Box<dyn TrackerHandle>, TrackerError> {
        let parsed = Url::parse(url).map_err(|e| TrackerError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let handle = match parsed.scheme() {
            "http" | "https" => {
                SpawnedTracker::spawn(HttpTracker::new(url, &self.context.config)?, &self.context)
            }
            "udp" => SpawnedTracker::spawn(UdpTracker::new(url, &self.context.config)?, &self.context),
            _ => {
                return Err(TrackerError::UnsupportedScheme {
                    url: url.to_string(),
                });
            }
        };
        Ok(Box::new(handle))
    }
}

/// Manages every tracker of one torrent.
///
/// Aggregates peers across trackers and drops trackers that failed for
/// good. The download cannot continue once none are left.
pub struct TrackerManager {
    handles: Vec<Box<dyn TrackerHandle>>,
    stop_poll_interval: Duration,
}

impl TrackerManager {
    /// Starts one tracker per usable URL.
    ///
    /// URLs the factory rejects are skipped.
    ///
    /// # Errors
    ///
    /// - `TrackerError::NoTrackerLeft` - If no URL produced a tracker
    pub fn start(
        urls: &[String],
        factory: &dyn TrackerFactory,
        stop_poll_interval: Duration,
    ) -> Result<Self, TrackerError> {
        let handles: Vec<_> = urls
            .iter()
            .filter_map(|url| match factory.create(url) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!("TrackerManager: skipping {}: {}", url, e);
                    None
                }
            })
            .collect();

        tracing::info!(
            "TrackerManager: started {} of {} trackers",
            handles.len(),
            urls.len()
        );
        Self::from_handles(handles, stop_poll_interval)
    }

    /// Manages already running trackers.
    ///
    /// # Errors
    ///
    /// - `TrackerError::NoTrackerLeft` - If `handles` is empty
    pub fn from_handles(
        handles: Vec<Box<dyn TrackerHandle>>,
        stop_poll_interval: Duration,
    ) -> Result<Self, TrackerError> {
        if handles.is_empty() {
            return Err(TrackerError::NoTrackerLeft);
        }
        Ok(Self {
            handles,
            stop_poll_interval,
        })
    }

    /// Collects peers from every tracker, first occurrence wins.
    ///
    /// Trackers that report a failure are dropped.
    ///
    /// # Errors
    ///
    /// - `TrackerError::NoTrackerLeft` - If every tracker has failed
    pub fn get_peers(&mut self) -> Result<Vec<SocketAddr>, TrackerError> {
        let mut seen = HashSet::new();
        let mut peers = Vec::new();

        self.handles.retain_mut(|handle| match handle.take_peers() {
            Ok(batch) => {
                peers.extend(batch.into_iter().filter(|peer| seen.insert(*peer)));
                true
            }
            Err(e) => {
                tracing::warn!("TrackerManager: dropping {}: {}", handle.url(), e);
                false
            }
        });

        if self.handles.is_empty() {
            return Err(TrackerError::NoTrackerLeft);
        }
        Ok(peers)
    }

    /// Signals every tracker to send its final announce and waits until
    /// all of them have stopped.
    pub async fn stop(&mut self) {
        for handle in &self.handles {
            handle.stop();
        }

        while !self.handles.iter().all(|handle| handle.has_stopped()) {
            tokio::time::sleep(self.stop_poll_interval).await;
        }
        tracing::info!("TrackerManager: all {} trackers stopped", self.handles.len());
    }

    pub fn tracker_count(&self) -> usize {
        self.handles.len()
    }
}
