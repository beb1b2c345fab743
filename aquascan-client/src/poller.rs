//! Job poller
//!
//! Re-fetches one detection job on a fixed interval until it reaches a
//! terminal status. Transient fetch failures are retried on the same
//! schedule; any other failure ends the session. Each `PollSession` owns a single spawned task with a
//! single timer; fetches within a session never overlap, and ticks that fall
//! inside an outstanding fetch are skipped rather than queued.
//!
//! Destroying a session (explicitly, or by dropping it) cancels the task and
//! aborts the outstanding fetch. A result that races destruction is
//! discarded before it reaches the published state.

use async_trait::async_trait;
use aquascan_common::models::DetectionJob;
use aquascan_common::ApiError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default re-fetch interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// Where a poll session gets its job from
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_job(&self, id: &str) -> Result<DetectionJob, ApiError>;

    /// Turn a server-relative image reference into an absolute locator
    fn resolve_image_ref(&self, image_ref: &str) -> String;
}

/// Lifecycle phase of a poll session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Fetching,
    RetryWait,
    Terminal,
    /// Stopped after a failure that retrying cannot fix
    Abandoned,
    Destroyed,
}

impl PollPhase {
    /// No further network activity will happen in this phase
    pub fn is_final(self) -> bool {
        matches!(
            self,
            PollPhase::Terminal | PollPhase::Abandoned | PollPhase::Destroyed
        )
    }
}

/// Absolute image locators of a completed job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedImages {
    pub original: Option<String>,
    pub processed: Option<String>,
}

/// State published to observers of a session
#[derive(Debug, Clone, PartialEq)]
pub struct PollSnapshot {
    pub job_id: String,
    pub phase: PollPhase,
    /// Latest successfully fetched job
    pub job: Option<DetectionJob>,
    /// Set once the job is terminal
    pub images: Option<ResolvedImages>,
    /// Most recent fetch failure, cleared by the next success
    pub last_error: Option<ApiError>,
    /// Fetches started so far
    pub fetches: u32,
}

impl PollSnapshot {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            phase: PollPhase::Idle,
            job: None,
            images: None,
            last_error: None,
            fetches: 0,
        }
    }
}

/// Starts poll sessions against one job source
#[derive(Clone)]
pub struct JobPoller {
    source: Arc<dyn JobSource>,
    interval: Duration,
}

impl JobPoller {
    pub fn new(source: Arc<dyn JobSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling `job_id`; the first fetch happens immediately
    pub fn watch(&self, job_id: impl Into<String>) -> PollSession {
        PollSession::start(Arc::clone(&self.source), job_id.into(), self.interval)
    }
}

/// One job being polled
///
/// Must be destroyed on teardown; dropping it does so.
pub struct PollSession {
    id: Uuid,
    job_id: String,
    cancel: CancellationToken,
    state: Arc<watch::Sender<PollSnapshot>>,
    task: JoinHandle<()>,
}

impl PollSession {
    pub fn start(source: Arc<dyn JobSource>, job_id: String, interval: Duration) -> Self {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, _rx) = watch::channel(PollSnapshot::new(&job_id));
        let state = Arc::new(tx);

        debug!(session = %id, job_id = %job_id, interval_ms = interval.as_millis() as u64, "Poll session started");

        let task = tokio::spawn(run_session(
            source,
            job_id.clone(),
            interval,
            cancel.clone(),
            Arc::clone(&state),
        ));

        Self {
            id,
            job_id,
            cancel,
            state,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.state.subscribe()
    }

    /// True until the session reaches a final phase
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.state.borrow().phase.is_final()
    }

    /// Stop polling; safe to call any number of times
    ///
    /// A terminal session keeps its final state. Otherwise the published
    /// phase becomes `Destroyed` before this returns.
    pub fn destroy(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let changed = self.state.send_if_modified(|snapshot| {
            if snapshot.phase.is_final() {
                return false;
            }
            snapshot.phase = PollPhase::Destroyed;
            true
        });
        if changed {
            debug!(session = %self.id, job_id = %self.job_id, "Poll session destroyed");
        }
    }

    /// Wait until the session is terminal, abandoned or destroyed
    pub async fn settled(&self) -> PollSnapshot {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let settled = match rx.wait_for(|snapshot| snapshot.phase.is_final()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }

    /// Whether the background task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn run_session(
    source: Arc<dyn JobSource>,
    job_id: String,
    interval: Duration,
    cancel: CancellationToken,
    state: Arc<watch::Sender<PollSnapshot>>,
) {
    // `interval` panics on a zero period
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let started = state.send_if_modified(|snapshot| {
            if cancel.is_cancelled() {
                return false;
            }
            snapshot.phase = PollPhase::Fetching;
            snapshot.fetches += 1;
            true
        });
        if !started {
            return;
        }

        // Dropping the fetch future on cancellation aborts the request
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = source.fetch_job(&job_id) => result,
        };

        let mut finished = false;
        let published = state.send_if_modified(|snapshot| {
            // Liveness check under the channel lock; `destroy` takes the same lock
            if cancel.is_cancelled() {
                return false;
            }
            match &result {
                Ok(job) if job.is_terminal() => {
                    snapshot.images = Some(ResolvedImages {
                        original: job
                            .original_image_ref
                            .as_deref()
                            .map(|r| source.resolve_image_ref(r)),
                        processed: job
                            .processed_image_ref
                            .as_deref()
                            .map(|r| source.resolve_image_ref(r)),
                    });
                    snapshot.job = Some(job.clone());
                    snapshot.last_error = None;
                    snapshot.phase = PollPhase::Terminal;
                    finished = true;
                }
                Ok(job) => {
                    snapshot.job = Some(job.clone());
                    snapshot.last_error = None;
                    snapshot.phase = PollPhase::RetryWait;
                }
                Err(err) if err.is_transient() => {
                    snapshot.last_error = Some(err.clone());
                    snapshot.phase = PollPhase::RetryWait;
                }
                Err(err) => {
                    snapshot.last_error = Some(err.clone());
                    snapshot.phase = PollPhase::Abandoned;
                    finished = true;
                }
            }
            true
        });

        if !published {
            debug!(job_id = %job_id, "Discarding poll result after destroy");
            return;
        }

        match result {
            Ok(job) if finished => {
                info!(job_id = %job_id, status = %job.status, "Detection job reached terminal status");
                return;
            }
            Ok(job) => debug!(job_id = %job_id, status = %job.status, "Job still running"),
            Err(err) if finished => {
                warn!(job_id = %job_id, error = %err, "Poll fetch failed permanently, giving up");
                return;
            }
            Err(err) => warn!(job_id = %job_id, error = %err, "Poll fetch failed, retrying on next tick"),
        }
    }
}
