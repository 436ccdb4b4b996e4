//! Local-network discovery seams.
//!
//! Receivers publish a [`ServiceRecord`] through an [`Advertiser`]; senders
//! consume [`DiscoveryEvent`]s from a [`Browser`]. Both are backed by mDNS in
//! the shipped binaries and by in-memory fakes in tests.

use futures::stream::BoxStream;
use thiserror::Error;

use crate::record::ServiceRecord;

/// Proof that a record was published; needed to withdraw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementHandle {
    fullname: String,
}

impl AdvertisementHandle {
    pub fn new(fullname: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
        }
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Added(ServiceRecord),
    Removed { instance_id: String },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery service unavailable: {0}")]
    Unavailable(String),
    #[error("failed to publish record: {0}")]
    Publish(String),
    #[error("failed to withdraw record: {0}")]
    Withdraw(String),
    #[error("failed to browse: {0}")]
    Browse(String),
}

pub trait Advertiser: Send + Sync {
    fn publish(&self, record: &ServiceRecord) -> Result<AdvertisementHandle, DiscoveryError>;

    fn withdraw(&self, handle: &AdvertisementHandle) -> Result<(), DiscoveryError>;
}

pub trait Browser: Send + Sync {
    /// Starts a fresh browse. The stream is unbounded; drop it to stop.
    fn browse(&self) -> Result<BoxStream<'static, DiscoveryEvent>, DiscoveryError>;
}
