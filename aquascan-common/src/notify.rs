//! User-visible notification channel
//!
//! Provides the `NotificationBus` every component reports through. One
//! notification corresponds to one toast/banner in a front end.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Default suppression window for repeated identical notifications
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// A single user-visible message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

struct LastEmitted {
    level: NotificationLevel,
    message: String,
    at: Instant,
}

/// Broadcast bus for user-visible notifications
///
/// Uses tokio::broadcast internally, so publishing never blocks and any number
/// of front-end regions may listen.
///
/// A notification identical (same level and message) to the last one emitted
/// is dropped while the suppression window is open. Each dropped duplicate
/// slides the window forward, so a failure repeating on a fixed schedule is
/// shown once until something else is said.
///
/// # Examples
///
/// ```
/// use aquascan_common::notify::{NotificationBus, NotificationLevel};
///
/// let bus = NotificationBus::new(16);
/// let mut rx = bus.subscribe();
///
/// assert!(bus.error("Cannot connect to server"));
/// assert!(!bus.error("Cannot connect to server")); // suppressed duplicate
///
/// let first = rx.try_recv().unwrap();
/// assert_eq!(first.level, NotificationLevel::Error);
/// assert!(rx.try_recv().is_err());
/// ```
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
    capacity: usize,
    dedup_window: Duration,
    last: Arc<Mutex<Option<LastEmitted>>>,
}

impl NotificationBus {
    /// Creates a bus with the default suppression window
    pub fn new(capacity: usize) -> Self {
        Self::with_dedup_window(capacity, DEFAULT_DEDUP_WINDOW)
    }

    /// Creates a bus with an explicit suppression window
    ///
    /// A zero window disables duplicate suppression.
    pub fn with_dedup_window(capacity: usize, dedup_window: Duration) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity,
            dedup_window,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to all future notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish a notification
    ///
    /// Returns `false` when the notification was suppressed as a duplicate.
    /// Having no subscribers is not an error.
    pub fn publish(&self, level: NotificationLevel, message: impl Into<String>) -> bool {
        let message = message.into();
        let now = Instant::now();

        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = last.as_mut() {
                if prev.level == level
                    && prev.message == message
                    && now.duration_since(prev.at) < self.dedup_window
                {
                    prev.at = now;
                    tracing::trace!(%message, "Suppressed duplicate notification");
                    return false;
                }
            }
            *last = Some(LastEmitted {
                level,
                message: message.clone(),
                at: now,
            });
        }

        let _ = self.tx.send(Notification {
            level,
            message,
            timestamp: chrono::Utc::now(),
        });
        true
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.publish(NotificationLevel::Error, message)
    }

    pub fn success(&self, message: impl Into<String>) -> bool {
        self.publish(NotificationLevel::Success, message)
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.publish(NotificationLevel::Info, message)
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(64)
    }
}
