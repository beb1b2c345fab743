//! Detection service API
//!
//! Typed operations over the detection service endpoints. This is the only
//! module that knows request paths, payload shapes and cache keys; the
//! poller and the collection fetcher build on it.

use crate::context::{detection_key, CallOptions, SyncContext, STATISTICS_KEY};
use crate::gateway::{path_segment, Payload, RequestOptions};
use crate::poller::JobSource;
use crate::statistics;
use async_trait::async_trait;
use aquascan_common::models::{DetectionJob, Statistics};
use aquascan_common::ApiError;
use reqwest::{multipart, Method};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Largest image the service accepts
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

const ALLOWED_TYPES_MESSAGE: &str = "Please upload PNG, JPG, JPEG, TIFF, or BMP files only.";
const TOO_LARGE_MESSAGE: &str = "File size must be less than 16MB.";

/// Which rendition of a sample image to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Original,
    Processed,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Original => "original",
            ImageKind::Processed => "processed",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "original" => Ok(ImageKind::Original),
            "processed" => Ok(ImageKind::Processed),
            other => Err(format!(
                "unknown image type '{other}' (expected 'original' or 'processed')"
            )),
        }
    }
}

/// An image about to be submitted for detection
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Read an image from disk
    pub async fn from_path(path: &Path) -> Result<Self, ApiError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ApiError::RequestSetupError(format!("cannot read {}: {e}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        Ok(Self { file_name, bytes })
    }

    /// MIME type by extension, `None` for unsupported files
    pub fn content_type(&self) -> Option<&'static str> {
        let ext = Path::new(&self.file_name)
            .extension()?
            .to_str()?
            .to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "tif" | "tiff" => Some("image/tiff"),
            "bmp" => Some("image/bmp"),
            _ => None,
        }
    }

    /// Check type and size before anything goes on the wire
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.content_type().is_none() {
            return Err(ApiError::RequestSetupError(ALLOWED_TYPES_MESSAGE.to_string()));
        }
        if self.bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ApiError::RequestSetupError(TOO_LARGE_MESSAGE.to_string()));
        }
        Ok(())
    }

    fn into_part(self) -> Result<multipart::Part, ApiError> {
        let mime = self
            .content_type()
            .ok_or_else(|| ApiError::RequestSetupError(ALLOWED_TYPES_MESSAGE.to_string()))?;
        multipart::Part::bytes(self.bytes)
            .file_name(self.file_name)
            .mime_str(mime)
            .map_err(|e| ApiError::RequestSetupError(e.to_string()))
    }
}

/// Result of `POST /api/detect`
#[derive(Debug, Clone, PartialEq)]
pub struct DetectOutcome {
    /// Job id, when the service returned one
    pub detection_id: Option<String>,
    /// Full response body
    pub payload: Value,
}

/// Client for the detection service
#[derive(Clone)]
pub struct DetectionApi {
    ctx: SyncContext,
}

impl DetectionApi {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Liveness probe
    pub async fn health(&self) -> Result<Value, ApiError> {
        self.ctx.gateway().get("/api/health", RequestOptions::default()).await
    }

    /// Submit an image for asynchronous detection; returns the job id
    pub async fn upload_image(
        &self,
        upload: ImageUpload,
        name: &str,
        email: &str,
    ) -> Result<String, ApiError> {
        upload.validate().map_err(|e| self.fail_with(e, None))?;
        let file_name = upload.file_name.clone();
        let form = multipart::Form::new()
            .part("image", upload.into_part().map_err(|e| self.fail(e))?)
            .text("name", name.to_string())
            .text("email", email.to_string());

        let body = self
            .ctx
            .gateway()
            .send(Method::POST, "/api/upload", Some(Payload::Multipart(form)), RequestOptions::default())
            .await?
            .into_json()
            .map_err(|e| self.fail(e))?;

        check_success(&body).map_err(|e| self.fail(e))?;
        let id = extract_id(&body, &["detection_id", "id"]).ok_or_else(|| {
            self.fail(ApiError::FormatError("upload response without detection_id".into()))
        })?;

        info!(detection_id = %id, file = %file_name, "Image submitted for detection");
        Ok(id)
    }

    /// Submit an image to the synchronous detection endpoint
    pub async fn detect(
        &self,
        upload: ImageUpload,
        email: Option<&str>,
    ) -> Result<DetectOutcome, ApiError> {
        upload.validate().map_err(|e| self.fail_with(e, None))?;
        let mut form = multipart::Form::new().part("image", upload.into_part().map_err(|e| self.fail(e))?);
        if let Some(email) = email {
            form = form.text("email", email.to_string());
        }

        let payload = self
            .ctx
            .gateway()
            .send(Method::POST, "/api/detect", Some(Payload::Multipart(form)), RequestOptions::default())
            .await?
            .into_json()
            .map_err(|e| self.fail(e))?;
        check_success(&payload).map_err(|e| self.fail(e))?;

        let detection_id = extract_id(&payload, &["detection_id", "id"]);
        info!(detection_id = ?detection_id, "Detection request processed");
        Ok(DetectOutcome {
            detection_id,
            payload,
        })
    }

    /// Current state of one job, always from the network
    ///
    /// Cached list pages or detail entries that disagree with the fetched
    /// status are invalidated.
    pub async fn get_detection(&self, id: &str) -> Result<DetectionJob, ApiError> {
        let path = self.detection_path(id)?;
        let job = self
            .ctx
            .call_api(CallOptions::loading(detection_key(id)), async {
                let body = self.ctx.gateway().get(&path, RequestOptions::default()).await?;
                DetectionJob::from_value(body).map_err(|e| self.fail(e))
            })
            .await?;
        self.ctx.reconcile_job_status(id, job.status);
        Ok(job)
    }

    /// Job state, served from the cache when a terminal copy is fresh
    ///
    /// Only terminal jobs are cached; a running job is always re-fetched.
    pub async fn get_detection_cached(&self, id: &str) -> Result<DetectionJob, ApiError> {
        let key = detection_key(id);
        if let Some(hit) = self.ctx.cache().get(&key) {
            if let Ok(job) = serde_json::from_value::<DetectionJob>(hit) {
                debug!(id, "Detection served from cache");
                return Ok(job);
            }
        }

        let job = self.get_detection(id).await?;
        if job.is_terminal() {
            if let Ok(value) = serde_json::to_value(&job) {
                self.ctx.cache().set(key, value);
            }
        }
        Ok(job)
    }

    /// Raw list envelope for one page
    pub async fn list_detections(&self, page: u32, per_page: u32) -> Result<Value, ApiError> {
        let options = RequestOptions::default()
            .query("page", page)
            .query("per_page", per_page);
        self.ctx.gateway().get("/api/detections", options).await
    }

    /// Delete one job and drop every cached copy of it
    pub async fn delete_detection(&self, id: &str) -> Result<(), ApiError> {
        let path = self.detection_path(id)?;
        let body = self
            .ctx
            .call_api(CallOptions::loading(detection_key(id)), async {
                self.ctx
                    .gateway()
                    .send(Method::DELETE, &path, None, RequestOptions::default())
                    .await?
                    .into_json()
                    .map_err(|e| self.fail(e))
            })
            .await?;

        check_success(&body).map_err(|e| self.fail(e))?;
        self.ctx.invalidate_detection(id);

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Detection deleted successfully");
        self.ctx.notifier().success(message);
        info!(id, "Detection deleted");
        Ok(())
    }

    /// Aggregate counts, cached for the cache TTL
    pub async fn statistics(&self) -> Result<Statistics, ApiError> {
        self.ctx
            .call_api(
                CallOptions::loading(STATISTICS_KEY).cached(STATISTICS_KEY),
                async {
                    let body = self
                        .ctx
                        .gateway()
                        .get("/api/statistics", RequestOptions::default())
                        .await?;
                    statistics::normalize(&body).map_err(|e| self.fail(e))
                },
            )
            .await
    }

    /// Ask the service to e-mail a job's results; returns the server message
    pub async fn send_results_email(&self, email: &str, id: &str) -> Result<String, ApiError> {
        let payload = json!({ "email": email, "detection_id": id });
        let body = self
            .ctx
            .gateway()
            .send(
                Method::POST,
                "/api/send-results-email",
                Some(Payload::Json(payload)),
                RequestOptions::default(),
            )
            .await?
            .into_json()
            .map_err(|e| self.fail(e))?;

        // Email status is part of the job and list rows
        self.ctx.invalidate_detection(id);

        if let Some(message) = body.get("message").and_then(Value::as_str) {
            self.ctx.notifier().success(message);
            info!(id, recipient = email, "Results e-mail sent");
            return Ok(message.to_string());
        }
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(self.fail(ApiError::ServerError {
                status: None,
                message: error.to_string(),
            }));
        }
        Err(self.fail(ApiError::FormatError(
            "send-results-email response has neither message nor error".into(),
        )))
    }

    /// Raw bytes of one sample image
    pub async fn fetch_image(&self, id: &str, kind: ImageKind) -> Result<Vec<u8>, ApiError> {
        let path = self.image_path(id, kind)?;
        let body = self
            .ctx
            .gateway()
            .send(Method::GET, &path, None, RequestOptions::default().binary())
            .await?;
        Ok(body.into_bytes())
    }

    /// Direct locator of one sample image
    pub fn image_url(&self, id: &str, kind: ImageKind) -> Result<String, ApiError> {
        let path = self.image_path(id, kind)?;
        self.ctx.gateway().url_for(&path).map(String::from)
    }

    /// Absolute locator for an image reference from a job payload
    ///
    /// References that already start with `http` are returned unchanged;
    /// anything else is taken relative to the service base URL.
    pub fn resolve_image_ref(&self, image_ref: &str) -> String {
        resolve_against(self.ctx.gateway().base_url().as_str(), image_ref)
    }

    fn detection_path(&self, id: &str) -> Result<String, ApiError> {
        let id = path_segment(id).map_err(|e| self.fail(e))?;
        Ok(format!("/api/detection/{id}"))
    }

    fn image_path(&self, id: &str, kind: ImageKind) -> Result<String, ApiError> {
        let id = path_segment(id).map_err(|e| self.fail(e))?;
        Ok(format!("/api/image/{id}/{kind}"))
    }

    /// Publish a locally detected failure and hand it back
    fn fail(&self, err: ApiError) -> ApiError {
        let message = err.user_message();
        self.fail_with(err, Some(message))
    }

    fn fail_with(&self, err: ApiError, message: Option<String>) -> ApiError {
        warn!(kind = err.kind(), error = %err, "Detection API call failed");
        let message = message.unwrap_or_else(|| match &err {
            ApiError::RequestSetupError(detail) => detail.clone(),
            other => other.user_message(),
        });
        self.ctx.notifier().error(message);
        err
    }
}

#[async_trait]
impl JobSource for DetectionApi {
    async fn fetch_job(&self, id: &str) -> Result<DetectionJob, ApiError> {
        self.get_detection(id).await
    }

    fn resolve_image_ref(&self, image_ref: &str) -> String {
        DetectionApi::resolve_image_ref(self, image_ref)
    }
}

fn resolve_against(base: &str, image_ref: &str) -> String {
    if image_ref.starts_with("http") {
        return image_ref.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        image_ref.trim_start_matches('/')
    )
}

/// `success: false` in an otherwise successful response
fn check_success(body: &Value) -> Result<(), ApiError> {
    match body.get("success").and_then(Value::as_bool) {
        Some(false) => {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("The server reported a failure")
                .to_string();
            Err(ApiError::ServerError {
                status: None,
                message,
            })
        }
        _ => Ok(()),
    }
}

/// First of `fields` holding a string or integer id
fn extract_id(body: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match body.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
