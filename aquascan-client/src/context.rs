//! Explicitly constructed client context
//!
//! Bundles the gateway with the shared result cache, loading coordinator and
//! notification bus. Components receive a `SyncContext` instead of reaching
//! for process-wide state, so tests build isolated instances.

use crate::cache::ResultCache;
use crate::gateway::Gateway;
use crate::loading::LoadingCoordinator;
use aquascan_common::models::JobStatus;
use aquascan_common::{ApiError, ClientConfig, NotificationBus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Cache key of one detection job
pub fn detection_key(id: &str) -> String {
    format!("detection:{id}")
}

/// Prefix shared by every cached detection list page
pub const DETECTIONS_PREFIX: &str = "detections:";

/// Cache key of one detection list page
pub fn detections_page_key(page: u32, per_page: u32) -> String {
    format!("{DETECTIONS_PREFIX}page={page}:per_page={per_page}")
}

/// Cache and loading key of the statistics resource
pub const STATISTICS_KEY: &str = "statistics";

/// How `call_api` should treat one call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Serve from and store into the result cache under this key
    pub cache_key: Option<String>,
    /// Hold this loading key for the duration of the call
    pub loading_key: Option<String>,
}

impl CallOptions {
    pub fn loading(key: impl Into<String>) -> Self {
        Self {
            cache_key: None,
            loading_key: Some(key.into()),
        }
    }

    pub fn cached(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

/// Shared collaborators of every synchronization component
#[derive(Clone)]
pub struct SyncContext {
    gateway: Gateway,
    cache: Arc<ResultCache>,
    loading: LoadingCoordinator,
    config: Arc<ClientConfig>,
}

impl SyncContext {
    /// Build a context from configuration with fresh collaborators
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let notifier = NotificationBus::with_dedup_window(64, config.notification_dedup_window());
        let gateway = Gateway::new(&config, notifier)?;
        let cache = Arc::new(ResultCache::new(config.cache_ttl()));
        Ok(Self::from_parts(config, gateway, cache, LoadingCoordinator::new()))
    }

    pub fn from_parts(
        config: ClientConfig,
        gateway: Gateway,
        cache: Arc<ResultCache>,
        loading: LoadingCoordinator,
    ) -> Self {
        Self {
            gateway,
            cache,
            loading,
            config: Arc::new(config),
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn loading(&self) -> &LoadingCoordinator {
        &self.loading
    }

    pub fn notifier(&self) -> &NotificationBus {
        self.gateway.notifier()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run one service call under the given cache and loading policy
    ///
    /// A fresh cached value short-circuits the call entirely. Otherwise the
    /// loading key is held until the call settles, and a successful result is
    /// stored under the cache key.
    pub async fn call_api<T, F>(&self, options: CallOptions, call: F) -> Result<T, ApiError>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T, ApiError>>,
    {
        if let Some(key) = &options.cache_key {
            if let Some(hit) = self.cache.get(key) {
                match serde_json::from_value(hit) {
                    Ok(value) => {
                        debug!(key = %key, "Cache hit");
                        return Ok(value);
                    }
                    Err(e) => {
                        debug!(key = %key, error = %e, "Dropping undecodable cache entry");
                        self.cache.delete(key);
                    }
                }
            }
        }

        let _busy = options.loading_key.as_deref().map(|key| self.loading.begin(key));
        let value = call.await?;

        if let Some(key) = options.cache_key {
            if let Ok(json) = serde_json::to_value(&value) {
                self.cache.set(key, json);
            }
        }
        Ok(value)
    }

    /// Drop every cached copy of a job: its own entry, every list page, and
    /// the statistics that may list it among the latest detections
    pub fn invalidate_detection(&self, id: &str) {
        self.cache.delete(&detection_key(id));
        self.cache.delete(STATISTICS_KEY);
        let pages = self.cache.delete_prefix(DETECTIONS_PREFIX);
        debug!(id, pages, "Invalidated cached detection");
    }

    /// Drop every cached copy of a job that shows a status other than `status`
    ///
    /// Called with each freshly fetched job, so a list page can never keep
    /// showing a job as running once its detail has been seen to finish.
    /// Returns whether anything was invalidated.
    pub fn reconcile_job_status(&self, id: &str, status: JobStatus) -> bool {
        let differs = |cached: Option<JobStatus>| cached.is_some_and(|cached| cached != status);
        let stale_detail = self
            .cache
            .get(&detection_key(id))
            .is_some_and(|job| differs(cached_status(&job)));
        let stale_page = self.cache.any_fresh(DETECTIONS_PREFIX, |page| {
            differs(row_of(page, id).and_then(cached_status))
        });

        if stale_detail || stale_page {
            debug!(id, status = %status, "Cached copies of job are out of date");
            self.invalidate_detection(id);
        }
        stale_detail || stale_page
    }
}

/// Row for `id` in a cached list page
fn row_of<'a>(page: &'a Value, id: &str) -> Option<&'a Value> {
    page.get("items")?
        .as_array()?
        .iter()
        .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
}

fn cached_status(value: &Value) -> Option<JobStatus> {
    value
        .get("status")
        .and_then(|status| serde_json::from_value(status.clone()).ok())
}
