//! Paginated collection fetcher
//!
//! Fetches bounded pages of the detection list and keeps the page the user is
//! looking at. Whatever envelope the service answers with is normalized into
//! a `Page`; an envelope that cannot be recognized is a `FormatError`, never
//! an empty page.

use crate::api::DetectionApi;
use crate::context::{detections_page_key, CallOptions};
use aquascan_common::models::{DetectionSummary, Page};
use aquascan_common::ApiError;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Loading key held while any list page is in flight
pub const DETECTIONS_LOADING_KEY: &str = "detections";

/// Pagination block of the flat and nested envelopes
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPagination {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default, alias = "pages")]
    pub total_pages: Option<u32>,
    #[serde(default, alias = "total")]
    pub total_items: Option<u64>,
}

/// Every list envelope the service has been seen to send
#[derive(Debug, Clone, PartialEq)]
pub enum ListEnvelope {
    /// `{detections, pagination}`
    Flat {
        rows: Vec<DetectionSummary>,
        pagination: RawPagination,
    },
    /// `{success, data: {detections, pagination}}`
    Nested {
        rows: Vec<DetectionSummary>,
        pagination: RawPagination,
    },
    /// `{success?, detections, total, pages, page?}`
    Legacy {
        rows: Vec<DetectionSummary>,
        pagination: RawPagination,
    },
}

impl ListEnvelope {
    pub fn rows(&self) -> &[DetectionSummary] {
        match self {
            ListEnvelope::Flat { rows, .. }
            | ListEnvelope::Nested { rows, .. }
            | ListEnvelope::Legacy { rows, .. } => rows,
        }
    }

    /// Normalize into a page, filling gaps from the request
    pub fn into_page(self, requested_page: u32, requested_size: u32) -> Result<Page, ApiError> {
        let (rows, pagination) = match self {
            ListEnvelope::Flat { rows, pagination }
            | ListEnvelope::Nested { rows, pagination }
            | ListEnvelope::Legacy { rows, pagination } => (rows, pagination),
        };

        let page_size = pagination.per_page.unwrap_or(requested_size).max(1);
        let (total_items, total_pages) = match (pagination.total_items, pagination.total_pages) {
            (Some(items), Some(pages)) => (items, pages),
            (Some(items), None) => (items, pages_for(items, page_size)),
            (None, Some(pages)) => (rows.len() as u64, pages),
            (None, None) => {
                return Err(ApiError::FormatError(
                    "list pagination has neither total_items nor total_pages".into(),
                ))
            }
        };

        Ok(Page {
            page_number: pagination.page.unwrap_or(requested_page).max(1),
            page_size,
            total_items,
            total_pages,
            items: rows,
        })
    }
}

/// Recognize a list response body by its shape
pub fn parse_envelope(body: &Value) -> Result<ListEnvelope, ApiError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ApiError::FormatError("list response is not an object".into()))?;

    if obj.get("success").and_then(Value::as_bool) == Some(false) {
        let message = obj
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("The server could not list detections");
        return Err(ApiError::ServerError {
            status: None,
            message: message.to_string(),
        });
    }

    if let Some(data) = obj.get("data").and_then(Value::as_object) {
        if let (Some(rows), Some(pagination)) = (data.get("detections"), data.get("pagination")) {
            return Ok(ListEnvelope::Nested {
                rows: parse_rows(rows)?,
                pagination: parse_pagination(pagination)?,
            });
        }
    }

    let rows = obj.get("detections");
    if let (Some(rows), Some(pagination)) = (rows, obj.get("pagination")) {
        return Ok(ListEnvelope::Flat {
            rows: parse_rows(rows)?,
            pagination: parse_pagination(pagination)?,
        });
    }

    if let Some(rows) = rows {
        let has_totals = obj.get("total").is_some_and(Value::is_u64)
            || obj.get("pages").is_some_and(Value::is_u64);
        if has_totals {
            // Top-level keys carry the same names as a pagination block
            return Ok(ListEnvelope::Legacy {
                rows: parse_rows(rows)?,
                pagination: parse_pagination(body)?,
            });
        }
    }

    Err(ApiError::FormatError(
        "unrecognized detection list envelope".into(),
    ))
}

fn parse_rows(rows: &Value) -> Result<Vec<DetectionSummary>, ApiError> {
    serde_json::from_value(rows.clone())
        .map_err(|e| ApiError::FormatError(format!("detection list rows: {e}")))
}

fn parse_pagination(value: &Value) -> Result<RawPagination, ApiError> {
    RawPagination::deserialize(value)
        .map_err(|e| ApiError::FormatError(format!("detection list pagination: {e}")))
}

/// Number of pages needed for `total_items`
pub fn pages_for(total_items: u64, page_size: u32) -> u32 {
    let size = u64::from(page_size.max(1));
    u32::try_from(total_items.div_ceil(size)).unwrap_or(u32::MAX)
}

/// Bring a page number into `[1, total_pages]`
///
/// An empty collection still has page 1.
pub fn clamp_page(page_number: u32, total_pages: u32) -> u32 {
    page_number.max(1).min(total_pages.max(1))
}

/// Page state of the detection list
pub struct CollectionFetcher {
    api: DetectionApi,
    page_number: u32,
    page_size: u32,
    current: Option<Page>,
}

impl CollectionFetcher {
    pub fn new(api: DetectionApi, page_size: u32) -> Self {
        Self {
            api,
            page_number: 1,
            page_size: page_size.max(1),
            current: None,
        }
    }

    pub fn page_number(&self) -> u32 {
        self.page_number
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Last page fetched, if any
    pub fn current(&self) -> Option<&Page> {
        self.current.as_ref()
    }

    /// Fetch one page and make it current
    ///
    /// When the requested page lies beyond the last page the service reports,
    /// the number is clamped down and the clamped page fetched instead.
    pub async fn fetch_page(&mut self, page_number: u32, page_size: u32) -> Result<Page, ApiError> {
        let page_size = page_size.max(1);
        let requested = page_number.max(1);

        let mut page = self.load(requested, page_size).await?;
        let clamped = clamp_page(requested, page.total_pages);
        if clamped != requested {
            debug!(
                requested,
                clamped,
                total_pages = page.total_pages,
                "Requested page out of range, clamping"
            );
            page = self.load(clamped, page_size).await?;
        }

        self.page_number = page.page_number;
        self.page_size = page_size;
        self.current = Some(page.clone());
        Ok(page)
    }

    /// Advance one page; `Ok(None)` on the last page or before any fetch
    pub async fn next(&mut self) -> Result<Option<Page>, ApiError> {
        match &self.current {
            Some(page) if !page.is_last() => {
                let target = page.page_number + 1;
                self.fetch_page(target, self.page_size).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Go back one page; `Ok(None)` on the first page or before any fetch
    pub async fn previous(&mut self) -> Result<Option<Page>, ApiError> {
        match &self.current {
            Some(page) if !page.is_first() => {
                let target = page.page_number - 1;
                self.fetch_page(target, self.page_size).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Re-fetch the current page from the network
    pub async fn refresh(&mut self) -> Result<Page, ApiError> {
        self.api
            .context()
            .cache()
            .delete(&detections_page_key(self.page_number, self.page_size));
        self.fetch_page(self.page_number, self.page_size).await
    }

    /// Delete one job, then re-fetch the page the user was on
    pub async fn delete(&mut self, id: &str) -> Result<Page, ApiError> {
        self.api.delete_detection(id).await?;
        self.fetch_page(self.page_number, self.page_size).await
    }

    async fn load(&self, page_number: u32, page_size: u32) -> Result<Page, ApiError> {
        let ctx = self.api.context();
        let options = CallOptions::loading(DETECTIONS_LOADING_KEY)
            .cached(detections_page_key(page_number, page_size));

        ctx.call_api(options, async {
            let body = self.api.list_detections(page_number, page_size).await?;
            parse_envelope(&body)
                .and_then(|envelope| envelope.into_page(page_number, page_size))
                .map_err(|err| {
                    warn!(page_number, error = %err, "Unusable detection list response");
                    ctx.notifier().error(err.user_message());
                    err
                })
        })
        .await
    }
}
