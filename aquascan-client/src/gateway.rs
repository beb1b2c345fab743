//! Transport gateway
//!
//! Wraps every outbound request to the detection service: appends the
//! anti-cache `_t` parameter, applies the overall timeout, decodes bodies, and
//! classifies failures into `ApiError`. Each classified failure is reported
//! once on the notification bus before being returned to the caller.
//!
//! The gateway never retries.

use aquascan_common::{ApiError, ClientConfig, NotificationBus};
use reqwest::{multipart, Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("AquaScan/", env!("CARGO_PKG_VERSION"));

/// Name of the cache-defeating query parameter
pub const CACHE_BUSTER_PARAM: &str = "_t";

/// Request body
pub enum Payload {
    Json(Value),
    Multipart(multipart::Form),
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Extra query parameters, appended before `_t`
    pub query: Vec<(String, String)>,
    /// Return the raw body instead of decoding JSON
    pub expect_binary: bool,
    /// Skip the failure notification (the caller reports on its own)
    pub silent: bool,
}

impl RequestOptions {
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn binary(mut self) -> Self {
        self.expect_binary = true;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Body {
    pub fn into_json(self) -> Result<Value, ApiError> {
        match self {
            Body::Json(value) => Ok(value),
            Body::Bytes(_) => Err(ApiError::FormatError(
                "expected a JSON body, got binary".to_string(),
            )),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Body::Bytes(bytes) => bytes,
            Body::Json(value) => value.to_string().into_bytes(),
        }
    }
}

/// HTTP gateway to the detection service
#[derive(Clone)]
pub struct Gateway {
    http: reqwest::Client,
    base_url: Url,
    notifier: NotificationBus,
}

impl Gateway {
    pub fn new(config: &ClientConfig, notifier: NotificationBus) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiError::RequestSetupError(e.to_string()))?;

        // A trailing slash makes `join` append rather than replace the last segment
        let mut base = config.api_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ApiError::RequestSetupError(format!("invalid base URL '{base}': {e}")))?;

        Ok(Self {
            http,
            base_url,
            notifier,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn notifier(&self) -> &NotificationBus {
        &self.notifier
    }

    /// Absolute URL for a service path, without the anti-cache parameter
    pub fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::RequestSetupError(format!("invalid path '{path}': {e}")))
    }

    /// Send one request
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        payload: Option<Payload>,
        options: RequestOptions,
    ) -> Result<Body, ApiError> {
        let silent = options.silent;
        self.execute(method, path, payload, options)
            .await
            .map_err(|err| self.report(err, silent))
    }

    /// Send and deserialize a JSON response
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: Option<Payload>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let silent = options.silent;
        let value = self.send(method, path, payload, options).await?.into_json();
        value
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| ApiError::FormatError(format!("{path}: {e}")))
            })
            .map_err(|err| self.report(err, silent))
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<Value, ApiError> {
        self.send(Method::GET, path, None, options).await?.into_json()
    }

    /// Publish a failure once and hand it back
    fn report(&self, err: ApiError, silent: bool) -> ApiError {
        warn!(kind = err.kind(), error = %err, "Request failed");
        if !silent {
            self.notifier.error(err.user_message());
        }
        err
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: Option<Payload>,
        options: RequestOptions,
    ) -> Result<Body, ApiError> {
        let mut url = self.url_for(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &options.query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair(CACHE_BUSTER_PARAM, &cache_buster().to_string());
        }

        debug!(method = %method, url = %url, "Sending request");

        let mut builder = self.http.request(method.clone(), url.clone());
        builder = match payload {
            Some(Payload::Json(body)) => builder.json(&body),
            Some(Payload::Multipart(form)) => builder.multipart(form),
            None => builder,
        };
        let request = builder
            .build()
            .map_err(|e| ApiError::RequestSetupError(e.to_string()))?;

        let response = self
            .http
            .execute(request)
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        debug!(method = %method, url = %url, status = status.as_u16(), "Received response");

        let bytes = response
            .bytes()
            .await
            .map_err(classify_transport_error)?;

        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), error_field(&bytes)));
        }

        if options.expect_binary {
            return Ok(Body::Bytes(bytes.to_vec()));
        }
        if bytes.is_empty() {
            return Ok(Body::Json(Value::Null));
        }
        serde_json::from_slice(&bytes)
            .map(Body::Json)
            .map_err(|e| ApiError::FormatError(format!("{path}: invalid JSON body: {e}")))
    }
}

/// Percent-encode an opaque value so it occupies exactly one path segment
///
/// `/`, `?`, `#` and `%` are escaped, so an id can never reach a different
/// endpoint, query or fragment. Dot segments would be collapsed by URL
/// resolution and are rejected outright.
pub fn path_segment(raw: &str) -> Result<String, ApiError> {
    if matches!(raw, "" | "." | "..") {
        return Err(ApiError::RequestSetupError(format!(
            "'{raw}' is not a valid identifier"
        )));
    }
    let mut scratch = Url::parse("http://localhost/")
        .map_err(|e| ApiError::RequestSetupError(e.to_string()))?;
    scratch
        .path_segments_mut()
        .map_err(|_| ApiError::RequestSetupError("URL cannot hold a path".to_string()))?
        .pop_if_empty()
        .push(raw);
    Ok(scratch.path().trim_start_matches('/').to_string())
}

/// Failures without a usable response
fn classify_transport_error(err: reqwest::Error) -> ApiError {
    if err.is_builder() {
        ApiError::RequestSetupError(err.to_string())
    } else if err.is_timeout() {
        ApiError::NetworkUnreachable(format!("request timed out: {err}"))
    } else {
        ApiError::NetworkUnreachable(err.to_string())
    }
}

/// `error` string of a JSON error body, if there is one
fn error_field(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn cache_buster() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
