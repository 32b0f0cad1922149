//! Announce scheduling for one tracker
//!
//! `TrackerClient` decides when the next announce is due and which event it
//! carries. It performs no I/O; the spawned tracker task feeds it responses
//! and failures and sends whatever request it hands back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerError};
use crate::config::TrackerConfig;
use crate::torrent::InfoHash;
use crate::torrent::protocol::PeerId;

/// Time source for announce deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Lifecycle phase of a tracker conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    /// No response received yet
    Started,
    /// Announcing on the tracker's interval
    Polling,
    /// Final announce handed out
    Completed,
    /// Too many consecutive failures
    Failed,
}

/// Announce state machine for one tracker URL.
pub struct TrackerClient {
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    total_size: u64,
    failure_base_interval: Duration,
    max_failures: u32,
    min_interval: Duration,
    clock: Arc<dyn Clock>,
    phase: TrackerPhase,
    failure_count: u32,
    deadline: Option<Instant>,
}

impl TrackerClient {
    /// Creates a client whose first announce is due immediately.
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        total_size: u64,
        config: &TrackerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let deadline = Some(clock.now());
        Self {
            info_hash,
            peer_id,
            port,
            total_size,
            failure_base_interval: config.failure_base_interval,
            max_failures: config.max_failures,
            min_interval: config.peer_poll_interval,
            clock,
            phase: TrackerPhase::Started,
            failure_count: 0,
            deadline,
        }
    }

    /// Advances the schedule and returns the announce to send, if one is due.
    ///
    /// A `response` restarts the interval, floored at the peer poll interval,
    /// and clears the failure count. A
    /// `connection_error` backs off by `2^failures * base`. Once
    /// `still_downloading` is false a single Completed request is returned
    /// and every later call yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - `TrackerError::TooManyFailures` - If consecutive failures exceed the limit
    pub fn update(
        &mut self,
        uploaded: u64,
        downloaded: u64,
        connection_error: bool,
        response: Option<&AnnounceResponse>,
        still_downloading: bool,
    ) -> Result<Option<AnnounceRequest>, TrackerError> {
        match self.phase {
            TrackerPhase::Completed => return Ok(None),
            TrackerPhase::Failed => {
                return Err(TrackerError::TooManyFailures {
                    failures: self.failure_count,
                });
            }
            TrackerPhase::Started | TrackerPhase::Polling => {}
        }

        let now = self.clock.now();
        if let Some(response) = response {
            self.phase = TrackerPhase::Polling;
            self.failure_count = 0;
            let interval = Duration::from_secs(u64::from(response.interval));
            self.deadline = Some(now + interval.max(self.min_interval));
        }

        if connection_error {
            let backoff = self
                .failure_base_interval
                .saturating_mul(1u32 << self.failure_count.min(16));
            self.deadline = Some(now + backoff);
            self.failure_count += 1;
            if self.failure_count > self.max_failures {
                self.phase = TrackerPhase::Failed;
                self.deadline = None;
                return Err(TrackerError::TooManyFailures {
                    failures: self.failure_count,
                });
            }
        }

        if !still_downloading {
            self.phase = TrackerPhase::Completed;
            self.deadline = None;
            return Ok(Some(self.request(uploaded, downloaded, AnnounceEvent::Completed)));
        }

        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                let event = if self.phase == TrackerPhase::Started {
                    AnnounceEvent::Started
                } else {
                    AnnounceEvent::None
                };
                Ok(Some(self.request(uploaded, downloaded, event)))
            }
            _ => Ok(None),
        }
    }

    fn request(&self, uploaded: u64, downloaded: u64, event: AnnounceEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded,
            downloaded,
            left: self.total_size.saturating_sub(downloaded),
            event,
        }
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Time left until the next announce, `None` while waiting on a reply.
    pub fn next_announce_in(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(self.clock.now()))
    }
}
