//! aquascan-client library interface
//!
//! Client-side synchronization with the detection service: the transport
//! gateway, result cache, loading coordinator, job poller and paginated
//! collection fetcher, all sharing one explicitly built `SyncContext`.

pub mod api;
pub mod cache;
pub mod collection;
pub mod context;
pub mod gateway;
pub mod loading;
pub mod poller;
pub mod render;
pub mod statistics;

pub use crate::api::{DetectOutcome, DetectionApi, ImageKind, ImageUpload};
pub use crate::cache::ResultCache;
pub use crate::collection::{CollectionFetcher, ListEnvelope};
pub use crate::context::{CallOptions, SyncContext};
pub use crate::gateway::{Body, Gateway, Payload, RequestOptions};
pub use crate::loading::{LoadingCoordinator, LoadingGuard, LoadingSnapshot, Subscription};
pub use crate::poller::{JobPoller, JobSource, PollPhase, PollSession, PollSnapshot};

use aquascan_common::{ApiError, ClientConfig};
use std::sync::Arc;

/// Everything a front end needs, built from one configuration
#[derive(Clone)]
pub struct Client {
    pub api: DetectionApi,
    pub poller: JobPoller,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let interval = config.poll_interval();
        let api = DetectionApi::new(SyncContext::new(config)?);
        let poller = JobPoller::new(Arc::new(api.clone()), interval);
        Ok(Self { api, poller })
    }

    pub fn context(&self) -> &SyncContext {
        self.api.context()
    }

    /// A list fetcher starting at page 1 with the configured page size
    pub fn collection(&self) -> CollectionFetcher {
        CollectionFetcher::new(self.api.clone(), self.context().config().page_size)
    }
}
