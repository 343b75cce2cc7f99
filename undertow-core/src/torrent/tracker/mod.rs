//! HTTP tracker announces and peer discovery

pub mod client;
pub mod types;

pub use client::HttpTracker;
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
