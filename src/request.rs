//! Request spec: the immutable description of one HTTP transfer to issue.

use serde::{Deserialize, Serialize};

/// HTTP method of a request spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Where an API-key credential is placed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyLocation {
    Header,
    Query,
}

/// Auth descriptor attached to a request spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDescriptor {
    None,
    Bearer { token: String },
    Basic { user: String, pass: String },
    ApiKey {
        name: String,
        value: String,
        location: ApiKeyLocation,
    },
}

impl Default for AuthDescriptor {
    fn default() -> Self {
        AuthDescriptor::None
    }
}

/// Declared MIME family of an optional request body. Kept coarse-grained:
/// the body is always opaque bytes, this only picks the Content-Type header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyMime {
    Json,
    Text,
    Bytes,
}

impl BodyMime {
    pub fn content_type(self) -> &'static str {
        match self {
            BodyMime::Json => "application/json",
            BodyMime::Text => "text/plain; charset=utf-8",
            BodyMime::Bytes => "application/octet-stream",
        }
    }
}

/// Immutable description of one request to issue, shared (via `Arc`) across
/// every transfer admitted for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub body_mime: Option<BodyMime>,
    #[serde(default)]
    pub auth: AuthDescriptor,
    pub timeout_ms: u64,
}

impl RequestSpec {
    /// Hostname extracted from `url`, used for worker-affinity hashing and
    /// DNS-cache lookups. `None` if the URL cannot be parsed.
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}
