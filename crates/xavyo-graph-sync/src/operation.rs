//! Graph requests and the named operations that produce them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// HTTP method of a Graph request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Upper-case method name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A single Graph request, addressed relative to the API version root
/// (e.g. `/groups/{id}/members/$ref`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API version root.
    pub url: String,
    /// JSON body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl GraphRequest {
    /// Creates a request without body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: BTreeMap::new(),
        }
    }

    /// GET without body.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// POST with a JSON body.
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Post, url).with_body(body)
    }

    /// PATCH with a JSON body.
    pub fn patch(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Patch, url).with_body(body)
    }

    /// DELETE without body.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Attaches a JSON body and the matching content type.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self.headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Deferred request builder. Invoked again for every attempt, so it must
/// build the same request each time.
pub type RequestFactory = Arc<dyn Fn() -> GraphRequest + Send + Sync>;

/// A named operation: correlation id plus request factory.
#[derive(Clone)]
pub struct Operation {
    id: String,
    factory: RequestFactory,
}

impl Operation {
    /// Creates an operation from a factory closure.
    pub fn new<F>(id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> GraphRequest + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            factory: Arc::new(factory),
        }
    }

    /// Creates an operation that rebuilds a clone of `request` on every attempt.
    pub fn from_request(id: impl Into<String>, request: GraphRequest) -> Self {
        Self::new(id, move || request.clone())
    }

    /// Correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Builds a fresh request.
    #[must_use]
    pub fn build(&self) -> GraphRequest {
        (self.factory)()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
