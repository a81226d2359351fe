//! Request, response and cache key types shared by every component.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};

/// What the requesting page intends to do with the response.
///
/// Mirrors the values of the `Sec-Fetch-Dest` header that matter for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Destination {
    /// A top-level navigation (full document).
    Document,
    /// Scripts, including worker scripts.
    Script,
    /// Stylesheets.
    Style,
    Image,
    /// Web fonts.
    Font,
    /// The web app manifest.
    Manifest,
    /// `fetch()`/XHR with no rendering destination, usually data.
    #[default]
    Empty,
    /// Any other destination (audio, video, frames and so on).
    Other,
}

impl Destination {
    /// Parses a `Sec-Fetch-Dest` header value. Unknown values map to `Other`.
    #[must_use]
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" => Self::Document,
            "script" | "worker" | "sharedworker" => Self::Script,
            "style" => Self::Style,
            "image" => Self::Image,
            "font" => Self::Font,
            "manifest" => Self::Manifest,
            "" | "empty" => Self::Empty,
            _ => Self::Other,
        }
    }
}

/// An outbound request from the site, as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
    /// Only `GET` requests are ever cached.
    pub method: Method,
    /// Absolute target URL.
    pub url: Url,
    /// Drives partition classification and the offline fallback.
    pub destination: Destination,
    /// Headers forwarded to the network unchanged.
    pub headers: HeaderMap,
    /// Request body; empty for `GET`.
    pub body: Bytes,
}

impl Request {
    /// Creates a request with no headers and an empty body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            destination: Destination::Empty,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a plain GET request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Creates a GET navigation request for a full document.
    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_destination(Destination::Document)
    }

    #[must_use]
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns true if this is a GET for a full document.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.method == Method::GET && self.destination == Destination::Document
    }

    /// Returns the cache key for this request, or `None` for methods that
    /// never participate in caching.
    #[must_use]
    pub fn key(&self) -> Option<RequestKey> {
        (self.method == Method::GET).then(|| RequestKey::get(&self.url))
    }
}

/// Normalized `(method, absolute URL)` pair identifying a cache entry.
///
/// Only GET keys can be constructed; fragments are not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: Url,
}

impl RequestKey {
    /// Builds the GET key for a URL.
    #[must_use]
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET,
            url,
        }
    }

    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Where a response handed back to the caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Built by the degradation layer.
    Synthesized,
}

impl ResponseSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::Synthesized => "synthesized",
        }
    }
}

/// A response delivered to the requesting page.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Full body, buffered.
    pub body: Bytes,
    /// Whether this came from the network, a partition or the degradation
    /// layer.
    pub source: ResponseSource,
}

impl Response {
    /// Creates a network response with no headers.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Rebuilds a caller-facing response from a stored entry.
    #[must_use]
    pub fn from_stored(stored: StoredResponse) -> Self {
        Self {
            status: stored.status,
            headers: stored.headers,
            body: stored.body,
            source: ResponseSource::Cache,
        }
    }
}

/// A response as held by a cache partition.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// True if the entry came from the network without error.
    pub fresh: bool,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
    /// Snapshots a response for storage. The body is reference-counted, so
    /// this does not copy the payload.
    #[must_use]
    pub fn from_response(response: &Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            fresh: response.source == ResponseSource::Network && response.is_success(),
            stored_at: Utc::now(),
        }
    }

    /// Payload size in bytes, used for quota accounting.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn only_get_requests_have_keys() {
        let get = Request::get(url("https://site.test/app.css"));
        assert!(get.key().is_some());

        let post = Request::new(Method::POST, url("https://site.test/form"));
        assert!(post.key().is_none());
        let head = Request::new(Method::HEAD, url("https://site.test/"));
        assert!(head.key().is_none());
    }

    #[test]
    fn key_ignores_fragment() {
        let a = RequestKey::get(&url("https://site.test/page#top"));
        let b = RequestKey::get(&url("https://site.test/page"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://site.test/page");
    }

    #[test]
    fn key_keeps_query() {
        let a = RequestKey::get(&url("https://site.test/list?page=2"));
        let b = RequestKey::get(&url("https://site.test/list?page=3"));
        assert_ne!(a, b);
    }

    #[test]
    fn navigation_requires_get_document() {
        assert!(Request::navigate(url("https://site.test/")).is_navigation());
        assert!(!Request::get(url("https://site.test/")).is_navigation());
        let post_doc = Request::new(Method::POST, url("https://site.test/"))
            .with_destination(Destination::Document);
        assert!(!post_doc.is_navigation());
    }

    #[test]
    fn destination_from_header() {
        assert_eq!(Destination::from_header("document"), Destination::Document);
        assert_eq!(Destination::from_header("Style"), Destination::Style);
        assert_eq!(Destination::from_header("empty"), Destination::Empty);
        assert_eq!(Destination::from_header("iframe"), Destination::Other);
    }

    #[test]
    fn stored_response_freshness() {
        let ok = Response::new(StatusCode::OK, "body");
        assert!(StoredResponse::from_response(&ok).fresh);

        let cached = ok.clone().with_source(ResponseSource::Cache);
        assert!(!StoredResponse::from_response(&cached).fresh);

        let missing = Response::new(StatusCode::NOT_FOUND, "");
        assert!(!StoredResponse::from_response(&missing).fresh);
    }

    #[test]
    fn from_stored_marks_cache_source() {
        let ok = Response::new(StatusCode::OK, "cached bytes").with_content_type("text/css");
        let restored = Response::from_stored(StoredResponse::from_response(&ok));
        assert_eq!(restored.source, ResponseSource::Cache);
        assert_eq!(restored.text(), "cached bytes");
        assert_eq!(restored.headers[CONTENT_TYPE], "text/css");
    }
}
