//! Detection service domain model
//!
//! Wire records (`DetectionRecord`) are deserialized leniently and converted
//! into `DetectionJob`, which enforces the completed-only visibility of
//! results and image references.

use crate::error::ApiError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle status of a detection job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `Completed` and `Failed` admit no further transition
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Results e-mail delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    #[default]
    NeverSent,
    Success,
    Failure,
}

/// Latest results e-mail for a job (wire fields `email_*`)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmailDelivery {
    #[serde(rename = "email_status", default, deserialize_with = "lenient_email_status")]
    pub status: EmailStatus,
    #[serde(rename = "email_recipient", default)]
    pub recipient: Option<String>,
    #[serde(rename = "email_sent_at", default, deserialize_with = "lenient_timestamp")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl EmailDelivery {
    /// A resend is offered when a previous recipient exists and the last
    /// attempt did not succeed
    pub fn can_resend(&self) -> bool {
        self.recipient.is_some() && self.status != EmailStatus::Success
    }
}

/// One organism identified in a sample
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrganismFinding {
    #[serde(default)]
    pub name: Option<String>,
    /// Detector class label, e.g. `e_coli`
    #[serde(rename = "class", default)]
    pub class_label: Option<String>,
    #[serde(default)]
    pub scientific_name: Option<String>,
    #[serde(default)]
    pub gram_type: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    /// Older payloads call the risk level `risk`
    #[serde(default, skip_serializing)]
    risk: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub health_effects: Option<String>,
}

impl OrganismFinding {
    /// Best available display name
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.class_label.as_deref())
            .unwrap_or("Unknown organism")
    }

    /// Risk level under either wire name
    pub fn risk(&self) -> Option<&str> {
        self.risk_level.as_deref().or(self.risk.as_deref())
    }

    /// Confidence as a percentage with one decimal, e.g. `0.87` → `87.0%`
    pub fn confidence_label(&self) -> String {
        match self.confidence {
            Some(c) => format!("{:.1}%", c * 100.0),
            None => "Confidence not available".to_string(),
        }
    }

    fn normalized(mut self) -> Self {
        if self.risk_level.is_none() {
            self.risk_level = self.risk.take();
        }
        self.confidence = self.confidence.map(|c| c.clamp(0.0, 1.0));
        self
    }
}

/// Water usage guidance derived from the findings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WaterRecommendations {
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub safe_uses: Vec<String>,
    #[serde(default)]
    pub unsafe_uses: Vec<String>,
    #[serde(default)]
    pub treatment_required: Vec<String>,
}

/// Detection job as sent by `GET /api/detection/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub original_image_path: Option<String>,
    #[serde(default)]
    pub processed_image_path: Option<String>,
    #[serde(default)]
    pub organisms: Option<Value>,
    #[serde(default)]
    pub recommendations: Option<Value>,
    #[serde(default)]
    pub water_recommendations: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub email: EmailDelivery,
}

/// Client-side view of one detection job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionJob {
    pub id: String,
    pub status: JobStatus,
    pub filename: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub original_image_ref: Option<String>,
    pub processed_image_ref: Option<String>,
    pub organisms: Vec<OrganismFinding>,
    pub recommendations: Option<WaterRecommendations>,
    pub error_message: Option<String>,
    pub email: EmailDelivery,
}

impl DetectionJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl TryFrom<DetectionRecord> for DetectionJob {
    type Error = ApiError;

    fn try_from(record: DetectionRecord) -> Result<Self, Self::Error> {
        let completed = record.status == JobStatus::Completed;

        let (organisms, recommendations, original, processed) = if completed {
            let organisms = match record.organisms {
                Some(value) => parse_organisms(value)?,
                None => Vec::new(),
            };
            let recommendations = record
                .recommendations
                .or(record.water_recommendations)
                .and_then(parse_recommendations);
            (
                organisms,
                recommendations,
                record.original_image_path,
                record.processed_image_path,
            )
        } else {
            (Vec::new(), None, None, None)
        };

        Ok(DetectionJob {
            id: record.id,
            status: record.status,
            filename: record.filename,
            submitted_at: record.timestamp,
            original_image_ref: original,
            processed_image_ref: processed,
            organisms,
            recommendations,
            error_message: record.error_message,
            email: record.email,
        })
    }
}

impl DetectionJob {
    /// Decode a `GET /api/detection/{id}` body
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        let record: DetectionRecord = serde_json::from_value(value)
            .map_err(|e| ApiError::FormatError(format!("detection payload: {e}")))?;
        record.try_into()
    }
}

fn parse_organisms(value: Value) -> Result<Vec<OrganismFinding>, ApiError> {
    // Some payloads wrap the list as {"organisms": [...]}
    let list = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("organisms") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Null => Vec::new(),
        other => {
            return Err(ApiError::FormatError(format!(
                "organisms must be a list, got {other}"
            )))
        }
    };

    list.into_iter()
        .map(|item| match item {
            Value::String(label) => Ok(OrganismFinding {
                class_label: Some(label),
                ..Default::default()
            }),
            other => serde_json::from_value::<OrganismFinding>(other)
                .map(OrganismFinding::normalized)
                .map_err(|e| ApiError::FormatError(format!("organism entry: {e}"))),
        })
        .collect()
}

fn parse_recommendations(value: Value) -> Option<WaterRecommendations> {
    // An empty list stands for "no recommendations" in older payloads
    match value {
        Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    }
}

/// One row of the detection list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(rename = "timestamp", default, deserialize_with = "lenient_timestamp")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub organism_count: u32,
    #[serde(default)]
    pub organism_types: Vec<String>,
    #[serde(flatten)]
    pub email: EmailDelivery,
}

impl DetectionSummary {
    /// List label, falling back to the id when the filename is unknown
    pub fn label(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("Detection #{}", self.id))
    }
}

/// One page of the detection list, normalized from any recognized envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based
    pub page_number: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub items: Vec<DetectionSummary>,
}

impl Page {
    pub fn is_first(&self) -> bool {
        self.page_number <= 1
    }

    pub fn is_last(&self) -> bool {
        self.page_number >= self.total_pages
    }
}

/// Aggregate counts from `GET /api/statistics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_detections: u64,
    pub completed: u64,
    pub failed: u64,
    pub processing: u64,
    /// Percentage in [0, 100]
    pub success_rate: f64,
    pub organism_counts: BTreeMap<String, u64>,
    pub latest: Vec<DetectionSummary>,
}

/// Accepts `"17"` or `17`
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Integer(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Integer(n) => n.to_string(),
    })
}

/// Parse an RFC 3339 or naive ISO-8601 timestamp
///
/// Naive timestamps are taken as UTC. Unparseable values become `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

fn lenient_email_status<'de, D>(deserializer: D) -> Result<EmailStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(match raw.as_deref() {
        Some("success") => EmailStatus::Success,
        Some("failure") => EmailStatus::Failure,
        _ => EmailStatus::NeverSent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completed_payload() -> Value {
        json!({
            "id": 42,
            "filename": "sample_01.png",
            "timestamp": "2024-05-01T12:30:00.123456",
            "status": "completed",
            "original_image_path": "uploads/sample_01.png",
            "processed_image_path": "processed/sample_01.png",
            "organisms": [{
                "class": "e_coli",
                "name": "Escherichia coli",
                "scientific_name": "Escherichia coli",
                "gram_type": "negative",
                "risk": "High",
                "confidence": 0.87,
                "description": "Rod-shaped coliform bacterium.",
                "health_effects": "Can cause diarrhea."
            }],
            "water_recommendations": {
                "risk_level": "high",
                "safe_uses": [],
                "unsafe_uses": ["Drinking"],
                "treatment_required": ["Boil before use"]
            }
        })
    }

    #[test]
    fn test_completed_job_exposes_results() {
        let job = DetectionJob::from_value(completed_payload()).unwrap();
        assert_eq!(job.id, "42");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.organisms.len(), 1);
        assert_eq!(job.organisms[0].display_name(), "Escherichia coli");
        assert_eq!(job.organisms[0].risk(), Some("High"));
        assert_eq!(job.organisms[0].confidence_label(), "87.0%");
        assert_eq!(job.original_image_ref.as_deref(), Some("uploads/sample_01.png"));
        let rec = job.recommendations.unwrap();
        assert_eq!(rec.unsafe_uses, vec!["Drinking".to_string()]);
        assert_eq!(job.email.status, EmailStatus::NeverSent);
    }

    #[test]
    fn test_processing_job_hides_results_and_images() {
        let mut payload = completed_payload();
        payload["status"] = json!("processing");
        let job = DetectionJob::from_value(payload).unwrap();
        assert!(job.organisms.is_empty());
        assert!(job.recommendations.is_none());
        assert!(job.original_image_ref.is_none());
        assert!(job.processed_image_ref.is_none());
    }

    #[test]
    fn test_failed_job_has_no_results() {
        let mut payload = completed_payload();
        payload["status"] = json!("failed");
        let job = DetectionJob::from_value(payload).unwrap();
        assert!(job.is_terminal());
        assert!(job.organisms.is_empty());
        assert!(job.processed_image_ref.is_none());
    }

    #[test]
    fn test_unknown_status_is_format_error() {
        let err = DetectionJob::from_value(json!({"id": "x", "status": "exploded"})).unwrap_err();
        assert!(matches!(err, ApiError::FormatError(_)));
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let job = DetectionJob::from_value(completed_payload()).unwrap();
        let ts = job.submitted_at.unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T12:30:00.123456+00:00");
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("2024-05-01T12:30:00Z").is_some());
    }

    #[test]
    fn test_empty_recommendation_list_is_none() {
        let mut payload = completed_payload();
        payload["water_recommendations"] = json!([]);
        let job = DetectionJob::from_value(payload).unwrap();
        assert!(job.recommendations.is_none());
    }

    #[test]
    fn test_string_organisms_are_accepted() {
        let mut payload = completed_payload();
        payload["organisms"] = json!(["vibrio_cholerae"]);
        let job = DetectionJob::from_value(payload).unwrap();
        assert_eq!(job.organisms[0].display_name(), "vibrio_cholerae");
        assert_eq!(job.organisms[0].confidence_label(), "Confidence not available");
    }

    #[test]
    fn test_summary_email_fields() {
        let row: DetectionSummary = serde_json::from_value(json!({
            "id": 7,
            "timestamp": "2024-05-01T08:00:00",
            "status": "failed",
            "email_status": "failure",
            "email_recipient": "lab@example.org",
            "email_sent_at": null
        }))
        .unwrap();
        assert_eq!(row.label(), "Detection #7");
        assert_eq!(row.organism_count, 0);
        assert_eq!(row.email.status, EmailStatus::Failure);
        assert!(row.email.can_resend());
    }
}
