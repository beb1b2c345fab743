//! Statistics normalization
//!
//! The service has answered `GET /api/statistics` in two shapes over time:
//! flat `*_detections` counters with `organism_statistics`, and a nested
//! `status_counts` object with `organism_counts`. Both become `Statistics`.

use aquascan_common::models::{DetectionSummary, Statistics};
use aquascan_common::ApiError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Normalize a statistics response body
pub fn normalize(body: &Value) -> Result<Statistics, ApiError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ApiError::FormatError("statistics response is not an object".into()))?;
    let total = obj
        .get("total_detections")
        .and_then(as_count)
        .ok_or_else(|| ApiError::FormatError("statistics response lacks total_detections".into()))?;

    let status_counts = obj.get("status_counts").and_then(Value::as_object);
    let count = |flat: &str, nested: &str| -> Option<u64> {
        obj.get(flat)
            .and_then(as_count)
            .or_else(|| status_counts.and_then(|c| c.get(nested)).and_then(as_count))
    };

    let completed = count("completed_detections", "completed").unwrap_or(0);
    let failed = count("failed_detections", "failed").unwrap_or(0);
    let processing = count("processing_detections", "processing")
        .unwrap_or_else(|| total.saturating_sub(completed + failed));

    let rate = obj
        .get("success_rate")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| success_rate(completed, total));

    let organism_counts = obj
        .get("organism_statistics")
        .or_else(|| obj.get("organism_counts"))
        .and_then(Value::as_object)
        .map(parse_organism_counts)
        .unwrap_or_default();

    let latest = obj
        .get("latest_detections")
        .and_then(Value::as_array)
        .map(|rows| latest_rows(rows))
        .unwrap_or_default();

    Ok(Statistics {
        total_detections: total,
        completed,
        failed,
        processing,
        success_rate: rate.clamp(0.0, 100.0),
        organism_counts,
        latest,
    })
}

/// `completed / total` as a percentage, 0 for an empty history
pub fn success_rate(completed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    }
}

fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
}

fn parse_organism_counts(map: &Map<String, Value>) -> BTreeMap<String, u64> {
    map.iter()
        .filter_map(|(name, count)| as_count(count).map(|c| (name.clone(), c)))
        .collect()
}

fn latest_rows(rows: &[Value]) -> Vec<DetectionSummary> {
    rows.iter()
        .filter_map(|row| match serde_json::from_value::<DetectionSummary>(row.clone()) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable latest detection row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_shape() {
        let stats = normalize(&json!({
            "total_detections": 8,
            "completed_detections": 6,
            "failed_detections": 1,
            "success_rate": 75.0,
            "organism_statistics": {"e_coli": 4, "giardia": 2},
            "latest_detections": [
                {"id": 9, "filename": "s9.png", "status": "completed",
                 "timestamp": "2024-05-01T08:00:00", "organism_count": 2}
            ]
        }))
        .unwrap();

        assert_eq!(stats.total_detections, 8);
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.success_rate, 75.0);
        assert_eq!(stats.organism_counts.get("e_coli"), Some(&4));
        assert_eq!(stats.latest.len(), 1);
        assert_eq!(stats.latest[0].id, "9");
    }

    #[test]
    fn test_nested_shape_computes_rate() {
        let stats = normalize(&json!({
            "total_detections": 4,
            "status_counts": {"completed": 3, "failed": 0, "processing": 1},
            "organism_counts": {"cryptosporidium": 1}
        }))
        .unwrap();

        assert_eq!(stats.completed, 3);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.success_rate, 75.0);
        assert_eq!(stats.organism_counts.len(), 1);
        assert!(stats.latest.is_empty());
    }

    #[test]
    fn test_empty_history_rate_is_zero() {
        let stats = normalize(&json!({"total_detections": 0})).unwrap();
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.processing, 0);
    }

    #[test]
    fn test_unreadable_latest_row_skipped() {
        let stats = normalize(&json!({
            "total_detections": 2,
            "completed_detections": 2,
            "latest_detections": [{"id": 1, "status": "archived"}, {"id": 2}]
        }))
        .unwrap();
        assert_eq!(stats.latest.len(), 1);
        assert_eq!(stats.latest[0].id, "2");
    }

    #[test]
    fn test_unrecognized_shape_is_format_error() {
        assert!(matches!(normalize(&json!([1, 2])), Err(ApiError::FormatError(_))));
        assert!(matches!(
            normalize(&json!({"total": 3})),
            Err(ApiError::FormatError(_))
        ));
        assert!(matches!(
            normalize(&json!({"total_detections": "many"})),
            Err(ApiError::FormatError(_))
        ));
    }
}
