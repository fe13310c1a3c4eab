//! Microsoft Graph transport: the directory-client port and its reqwest adapter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::operation::GraphRequest;
use crate::{GraphResult, GraphSyncConfig, GraphSyncError};

/// `OData` error response from Microsoft Graph.
#[derive(Debug, Deserialize)]
pub struct ODataError {
    /// The error payload Graph nests under `error`.
    pub error: ODataErrorBody,
}

/// `OData` error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ODataErrorBody {
    /// Machine-readable code, e.g. `Request_ResourceNotFound`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Diagnostic details such as `request-id`.
    #[serde(rename = "innerError")]
    pub inner_error: Option<serde_json::Value>,
}

/// Response wrapper for paginated Graph API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ODataResponse<T> {
    /// Records on this page.
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    /// Link to the next page; absent on the last page.
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    /// Resumption link, present on the last page of a delta read.
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

/// One sub-request of a `$batch` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestItem {
    /// Correlation id, unique within the envelope.
    pub id: String,
    /// The sub-request, flattened into the item.
    #[serde(flatten)]
    pub request: GraphRequest,
}

/// One sub-response of a `$batch` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponseItem {
    /// Correlation id of the matching request.
    pub id: String,
    /// HTTP status of the sub-request.
    pub status: u16,
    /// Sub-response headers, including `Retry-After` when throttled.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Sub-response body; an `OData` error for failed items.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl BatchResponseItem {
    /// Header value, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parsed `Retry-After` hint.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("Retry-After")
            .and_then(parse_retry_after)
            .map(Duration::from_secs)
    }

    /// Graph error carried in the body, if any.
    #[must_use]
    pub fn error(&self) -> Option<ODataErrorBody> {
        self.body
            .as_ref()
            .and_then(|body| serde_json::from_value::<ODataError>(body.clone()).ok())
            .map(|e| e.error)
    }
}

#[derive(Serialize)]
struct BatchEnvelope<'a> {
    requests: &'a [BatchRequestItem],
}

#[derive(Deserialize)]
struct BatchResponseEnvelope {
    responses: Vec<BatchResponseItem>,
}

/// Parses the Retry-After header value.
///
/// Only the delay-seconds form is supported; HTTP dates yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

/// Directory client port consumed by the traffic-control layer.
///
/// Implementations perform exactly one network exchange per call; retries,
/// rate limiting and batching live above this trait.
#[async_trait]
pub trait GraphTransport: Send + Sync {
    /// Sends one `$batch` envelope and returns the per-item responses.
    async fn send_batch(
        &self,
        requests: Vec<BatchRequestItem>,
    ) -> GraphResult<Vec<BatchResponseItem>>;

    /// Reads one page of a list or delta query. `url` is either absolute
    /// (a next/delta link) or relative to the API root.
    async fn get_page(&self, url: &str) -> GraphResult<ODataResponse<serde_json::Value>>;

    /// Sends a single non-batched request. Returns `None` for empty bodies.
    async fn send(&self, request: &GraphRequest) -> GraphResult<Option<serde_json::Value>>;
}

/// Source of bearer tokens. Token acquisition belongs to the host.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Returns a currently valid access token.
    async fn access_token(&self) -> GraphResult<String>;
}

/// Provider returning a fixed token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wraps a pre-acquired bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> GraphResult<String> {
        Ok(self.token.clone())
    }
}

/// reqwest-backed [`GraphTransport`].
pub struct HttpGraphTransport {
    http_client: reqwest::Client,
    base_url: String,
    token_provider: Arc<dyn AccessTokenProvider>,
}

impl fmt::Debug for HttpGraphTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGraphTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpGraphTransport {
    /// Creates a new transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        config: &GraphSyncConfig,
        token_provider: Arc<dyn AccessTokenProvider>,
    ) -> GraphResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GraphSyncError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            token_provider,
        })
    }

    /// Returns the base URL for Graph API requests.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("https://") || url.starts_with("http://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&serde_json::Value>,
        headers: &[(&str, &str)],
    ) -> GraphResult<reqwest::Response> {
        let token = self.token_provider.access_token().await?;
        let url = self.resolve(url);

        let mut request = self.http_client.request(method, &url).bearer_auth(&token);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(b) = body {
            trace!(%url, body = %b, "Graph request body");
            request = request.json(b);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    async fn error_from_response(response: reqwest::Response) -> GraphSyncError {
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let error_body = response.text().await.unwrap_or_default();
        if let Ok(odata_error) = serde_json::from_str::<ODataError>(&error_body) {
            return GraphSyncError::GraphApi {
                status,
                code: odata_error.error.code,
                message: odata_error.error.message,
                retry_after_secs,
            };
        }

        GraphSyncError::GraphApi {
            status,
            code: status.to_string(),
            message: error_body,
            retry_after_secs,
        }
    }
}

#[async_trait]
impl GraphTransport for HttpGraphTransport {
    #[instrument(skip(self, requests), fields(items = requests.len()))]
    async fn send_batch(
        &self,
        requests: Vec<BatchRequestItem>,
    ) -> GraphResult<Vec<BatchResponseItem>> {
        let envelope = serde_json::to_value(BatchEnvelope {
            requests: &requests,
        })?;
        let response = self
            .execute(reqwest::Method::POST, "/$batch", Some(&envelope), &[])
            .await?;

        let parsed: BatchResponseEnvelope = response.json().await?;
        debug!(
            responses = parsed.responses.len(),
            "Batch response received"
        );
        Ok(parsed.responses)
    }

    #[instrument(skip(self))]
    async fn get_page(&self, url: &str) -> GraphResult<ODataResponse<serde_json::Value>> {
        let response = self.execute(reqwest::Method::GET, url, None, &[]).await?;
        response.json().await.map_err(GraphSyncError::from)
    }

    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &GraphRequest) -> GraphResult<Option<serde_json::Value>> {
        let headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("Content-Type"))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        let response = self
            .execute(
                request.method.into(),
                &request.url,
                request.body.as_ref(),
                &headers,
            )
            .await?;

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }
}
