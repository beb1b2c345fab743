//! Text rendering for the command-line client
//!
//! All output goes through a `RenderBoundary`: a panic while rendering a view
//! is caught, reported as a notification, and the view is rendered once more
//! before a fallback message is shown.

use crate::poller::{PollPhase, PollSnapshot};
use aquascan_common::models::{DetectionJob, DetectionSummary, EmailStatus, Page, Statistics};
use aquascan_common::NotificationBus;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::warn;

/// Shown when a view cannot be rendered even after a reload
pub const RENDER_FALLBACK: &str =
    "Something went wrong while displaying this view. Run the command again to reload.";

/// A view failed to render
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("rendering panicked: {0}")]
    Panicked(String),
}

/// Isolates rendering failures from the rest of the client
#[derive(Clone)]
pub struct RenderBoundary {
    notifier: NotificationBus,
}

impl RenderBoundary {
    pub fn new(notifier: NotificationBus) -> Self {
        Self { notifier }
    }

    /// Run `view` once, turning a panic into an error
    pub fn try_render<F>(&self, view: F) -> Result<String, RenderError>
    where
        F: Fn() -> String,
    {
        panic::catch_unwind(AssertUnwindSafe(&view)).map_err(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            RenderError::Panicked(message)
        })
    }

    /// Render `view`, reloading once after a failure
    pub fn render<F>(&self, view: F) -> String
    where
        F: Fn() -> String,
    {
        match self.try_render(&view) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "View failed to render, reloading");
                self.notifier.error("Something went wrong while displaying results");
                self.try_render(&view).unwrap_or_else(|err| {
                    warn!(error = %err, "View failed again after reload");
                    RENDER_FALLBACK.to_string()
                })
            }
        }
    }
}

/// One-line progress note for a poll snapshot
pub fn poll_status_line(snapshot: &PollSnapshot) -> String {
    let status = snapshot
        .job
        .as_ref()
        .map(|job| job.status.as_str())
        .unwrap_or("pending");
    match (&snapshot.phase, &snapshot.last_error) {
        (PollPhase::RetryWait, Some(err)) => format!(
            "Detection {}: {} (retrying after error: {})",
            snapshot.job_id,
            status,
            err.user_message()
        ),
        (PollPhase::Abandoned, Some(err)) => format!(
            "Detection {}: stopped polling ({})",
            snapshot.job_id,
            err.user_message()
        ),
        (PollPhase::Destroyed, _) => format!("Detection {}: stopped watching", snapshot.job_id),
        _ => format!("Detection {}: {}", snapshot.job_id, status),
    }
}

/// Full result view of a job
pub fn render_job(job: &DetectionJob, snapshot: Option<&PollSnapshot>) -> String {
    let mut lines = vec![format!("Detection {} [{}]", job.id, job.status)];
    if let Some(filename) = &job.filename {
        lines.push(format!("File: {filename}"));
    }
    if let Some(at) = job.submitted_at {
        lines.push(format!("Submitted: {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    if let Some(message) = &job.error_message {
        lines.push(format!("Error: {message}"));
    }

    if job.status.is_terminal() && job.error_message.is_none() {
        if job.organisms.is_empty() {
            lines.push("No microorganisms detected.".to_string());
        } else {
            lines.push("Organisms:".to_string());
            for organism in &job.organisms {
                let mut line = format!("  - {}", organism.display_name());
                if let Some(scientific) = &organism.scientific_name {
                    if Some(scientific.as_str()) != organism.name.as_deref() {
                        line.push_str(&format!(" ({scientific})"));
                    }
                }
                if let Some(risk) = organism.risk() {
                    line.push_str(&format!(", risk: {risk}"));
                }
                line.push_str(&format!(", confidence: {}", organism.confidence_label()));
                lines.push(line);
                if let Some(effects) = &organism.health_effects {
                    lines.push(format!("      Health effects: {effects}"));
                }
            }
        }
    }

    if let Some(rec) = &job.recommendations {
        lines.push(format!(
            "Water safety: {}",
            rec.risk_level.as_deref().unwrap_or("unknown risk")
        ));
        for (label, uses) in [
            ("Safe uses", &rec.safe_uses),
            ("Unsafe uses", &rec.unsafe_uses),
            ("Treatment required", &rec.treatment_required),
        ] {
            if !uses.is_empty() {
                lines.push(format!("  {label}: {}", uses.join(", ")));
            }
        }
    }

    if let Some(images) = snapshot.and_then(|s| s.images.as_ref()) {
        if let Some(url) = &images.original {
            lines.push(format!("Original image: {url}"));
        }
        if let Some(url) = &images.processed {
            lines.push(format!("Processed image: {url}"));
        }
    }

    lines.push(email_line(job.email.status, job.email.recipient.as_deref()));
    lines.join("\n")
}

fn email_line(status: EmailStatus, recipient: Option<&str>) -> String {
    match (status, recipient) {
        (EmailStatus::Success, Some(to)) => format!("Results e-mailed to {to}"),
        (EmailStatus::Success, None) => "Results e-mailed".to_string(),
        (EmailStatus::Failure, Some(to)) => format!("E-mail to {to} failed; resend available"),
        (EmailStatus::Failure, None) => "E-mail delivery failed".to_string(),
        (EmailStatus::NeverSent, _) => "Results not e-mailed".to_string(),
    }
}

fn summary_line(row: &DetectionSummary) -> String {
    let status = row.status.map(|s| s.as_str()).unwrap_or("unknown");
    let when = row
        .submitted_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let organisms = if row.organism_types.is_empty() {
        row.organism_count.to_string()
    } else {
        format!("{} ({})", row.organism_count, row.organism_types.join(", "))
    };
    format!(
        "{:>8}  {:<10}  {:<16}  {}  organisms: {}",
        row.id,
        status,
        when,
        row.label(),
        organisms
    )
}

/// One page of the detection list
pub fn render_page(page: &Page) -> String {
    let mut lines = Vec::with_capacity(page.items.len() + 2);
    if page.items.is_empty() {
        lines.push("No detections yet.".to_string());
    } else {
        lines.extend(page.items.iter().map(summary_line));
    }
    lines.push(format!(
        "Page {} of {} ({} detections)",
        page.page_number,
        page.total_pages.max(1),
        page.total_items
    ));
    lines.join("\n")
}

/// Aggregate statistics view
pub fn render_statistics(stats: &Statistics) -> String {
    let mut lines = vec![
        format!("Total detections: {}", stats.total_detections),
        format!("Completed: {}", stats.completed),
        format!("Failed: {}", stats.failed),
        format!("Processing: {}", stats.processing),
        format!("Success rate: {:.1}%", stats.success_rate),
    ];
    if !stats.organism_counts.is_empty() {
        lines.push("Organisms found:".to_string());
        lines.extend(
            stats
                .organism_counts
                .iter()
                .map(|(name, count)| format!("  {name}: {count}")),
        );
    }
    if !stats.latest.is_empty() {
        lines.push("Latest detections:".to_string());
        lines.extend(stats.latest.iter().map(summary_line));
    }
    lines.join("\n")
}
