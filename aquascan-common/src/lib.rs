//! # AquaScan Common Library
//!
//! Shared code for the AquaScan detection client:
//! - Detection job, list row and statistics models
//! - The closed `ApiError` failure vocabulary
//! - User-visible notification bus
//! - Layered client configuration

pub mod config;
pub mod error;
pub mod models;
pub mod notify;

pub use config::ClientConfig;
pub use error::{ApiError, Error, Result};
pub use notify::{Notification, NotificationBus, NotificationLevel};
