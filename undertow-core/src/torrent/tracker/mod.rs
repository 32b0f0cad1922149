//! BitTorrent tracker communication.
//!
//! HTTP (BEP 3) and UDP (BEP 15) transports behind `TrackerTransport`, an
//! announce scheduler, one background task per tracker and a manager that
//! aggregates their peers.

pub mod http;
pub mod manager;
pub mod protocol;
pub mod schedule;
pub mod spawned;
pub mod types;
pub mod udp;
pub mod udp_codec;

pub use http::HttpTracker;
pub use manager::{NetworkTrackerFactory, TrackerFactory, TrackerManager};
pub use schedule::{Clock, SystemClock, TrackerClient, TrackerPhase};
pub use spawned::{SpawnedTracker, TrackerContext, TrackerHandle, TrackerStatus};
pub use types::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, ProgressSource, TrackerError,
    TrackerTransport,
};
pub use udp::UdpTracker;
pub use udp_codec::{UdpResponse, UdpTrackerCodec};
