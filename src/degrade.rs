//! Degraded-mode responses for when both network and cache have failed.

use std::fmt::Write as _;
use std::sync::Arc;

use reqwest::header::{CACHE_CONTROL, HeaderValue};
use reqwest::{StatusCode, Url};

use crate::emergency::{EMERGENCY_RECORD_PATH, EmergencyRecord};
use crate::error::{Error, Result};
use crate::partition::{CachePartitionRegistry, PartitionPurpose};
use crate::request::{Request, RequestKey, Response, ResponseSource};
use crate::routing::RoutePolicy;

/// Turns serving failures into the least-bad response available.
#[derive(Debug, Clone)]
pub struct DegradationLayer {
    registry: CachePartitionRegistry,
    policy: Arc<RoutePolicy>,
    record: EmergencyRecord,
    root_key: RequestKey,
    record_key: RequestKey,
}

impl DegradationLayer {
    /// Creates the layer for a site.
    ///
    /// # Errors
    ///
    /// Returns an error if the well-known paths cannot be resolved against
    /// the site origin.
    pub fn new(
        registry: CachePartitionRegistry,
        policy: Arc<RoutePolicy>,
        record: EmergencyRecord,
    ) -> Result<Self> {
        let join = |path: &str| -> Result<Url> {
            policy.origin().join(path).map_err(|e| Error::InvalidUrl {
                url: path.to_string(),
                reason: e.to_string(),
            })
        };
        let root_key = RequestKey::get(&join("/")?);
        let record_key = RequestKey::get(&join(EMERGENCY_RECORD_PATH)?);
        Ok(Self {
            registry,
            policy,
            record,
            root_key,
            record_key,
        })
    }

    /// Key under which the emergency record is cached.
    #[must_use]
    pub const fn record_key(&self) -> &RequestKey {
        &self.record_key
    }

    #[must_use]
    pub const fn record(&self) -> &EmergencyRecord {
        &self.record
    }

    /// Recovers from a failed request.
    ///
    /// Navigations get the cached root document, or the synthesized offline
    /// page. Emergency/contact requests get the emergency record. Anything
    /// else gets `error` back unchanged.
    ///
    /// # Errors
    ///
    /// Returns `error` for requests with no degraded form.
    pub async fn recover(&self, request: &Request, error: Error) -> Result<Response> {
        if request.is_navigation() {
            log::warn!("Navigation to {} failed ({error}), serving fallback", request.url);
            return Ok(self.navigation_fallback().await);
        }
        if request.key().is_some() && self.policy.is_emergency(&request.url) {
            log::warn!("{} failed ({error}), serving emergency record", request.url);
            return self.emergency_response().await;
        }
        Err(error)
    }

    async fn navigation_fallback(&self) -> Response {
        match self
            .registry
            .lookup(&self.root_key, PartitionPurpose::Critical)
            .await
        {
            Ok(Some((_, stored))) => return Response::from_stored(stored),
            Ok(None) => {}
            Err(e) => log::warn!("Root document lookup failed: {e}"),
        }
        self.offline_document()
    }

    /// The synthesized offline page.
    #[must_use]
    pub fn offline_document(&self) -> Response {
        let mut response = Response::new(
            StatusCode::SERVICE_UNAVAILABLE,
            render_offline_page(&self.record),
        )
        .with_content_type("text/html; charset=utf-8")
        .with_source(ResponseSource::Synthesized);
        response
            .headers
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }

    /// The emergency record as JSON, preferring the copy stored at install.
    ///
    /// # Errors
    ///
    /// Returns an error only if the in-memory record cannot be serialized.
    pub async fn emergency_response(&self) -> Result<Response> {
        match self
            .registry
            .get(PartitionPurpose::Ephemeral, &self.record_key)
            .await
        {
            Ok(Some(stored)) => return Ok(Response::from_stored(stored)),
            Ok(None) => {}
            Err(e) => log::warn!("Emergency record lookup failed: {e}"),
        }
        Ok(Response::new(StatusCode::OK, self.record.to_json()?)
            .with_content_type("application/json")
            .with_source(ResponseSource::Synthesized))
    }
}

/// Renders the self-contained offline page. Styling is inline and nothing
/// is loaded from the network.
#[must_use]
pub fn render_offline_page(record: &EmergencyRecord) -> String {
    let mut services = String::new();
    for service in &record.services {
        let _ = write!(services, "<li>{}</li>", escape_html(service));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline - {business}</title>
<style>
  body {{ font-family: system-ui, sans-serif; max-width: 480px; margin: 60px auto; padding: 0 16px; color: #1f2933; background: #f5f7fa; }}
  h1 {{ font-size: 1.4rem; }}
  p {{ line-height: 1.5; }}
  a.call {{
    display: inline-block; padding: 12px 24px; margin: 16px 0;
    background: #c62828; color: #fff; border-radius: 6px;
    text-decoration: none; font-weight: bold; font-size: 1.2rem;
  }}
  ul {{ padding-left: 20px; }}
</style>
</head>
<body>
<h1>You are offline</h1>
<p>This page could not be loaded. {business} is still reachable by phone.</p>
<a class="call" href="tel:{dial}">Call {phone}</a>
<p>Available: {availability}<br>Expected response: {response_time}</p>
<p>Email: <a href="mailto:{email}">{email}</a></p>
<ul>{services}</ul>
</body>
</html>"#,
        business = escape_html(&record.business),
        dial = escape_html(&record.dial_string()),
        phone = escape_html(&record.phone),
        availability = escape_html(&record.availability),
        response_time = escape_html(&record.response_time),
        email = escape_html(&record.email),
    )
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::request::StoredResponse;
    use crate::store::{CacheStore, MemoryCacheStore};

    fn layer() -> DegradationLayer {
        let config = WorkerConfig::new().with_origin("https://site.test");
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let registry = CachePartitionRegistry::new("site", "v1", store);
        let policy = Arc::new(RoutePolicy::from_config(&config).unwrap());
        DegradationLayer::new(registry, policy, config.emergency).unwrap()
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://site.test{path}")).unwrap()
    }

    fn offline() -> Error {
        Error::Network("offline".to_string())
    }

    #[tokio::test]
    async fn navigation_without_cache_gets_offline_page_with_phone() {
        let layer = layer();
        let resp = layer
            .recover(&Request::navigate(url("/pricing")), offline())
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.source, ResponseSource::Synthesized);
        let html = resp.text();
        assert!(html.contains("+1-555-010-0000"));
        assert!(html.contains("href=\"tel:+15550100000\""));
        assert!(!html.contains("<script"));
        assert!(!html.contains("<link"));
    }

    #[tokio::test]
    async fn navigation_prefers_cached_root() {
        let layer = layer();
        let root = Response::new(StatusCode::OK, "<html>home</html>");
        layer
            .registry
            .put(
                PartitionPurpose::Critical,
                &RequestKey::get(&url("/")),
                StoredResponse::from_response(&root),
            )
            .await
            .unwrap();

        let resp = layer
            .recover(&Request::navigate(url("/pricing")), offline())
            .await
            .unwrap();
        assert_eq!(resp.source, ResponseSource::Cache);
        assert_eq!(resp.text(), "<html>home</html>");
    }

    #[tokio::test]
    async fn emergency_request_gets_json_record() {
        let layer = layer();
        let resp = layer
            .recover(&Request::get(url("/api/emergency")), offline())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(json["phone"], "+1-555-010-0000");
        assert_eq!(resp.headers["content-type"], "application/json");
    }

    #[tokio::test]
    async fn other_failures_propagate() {
        let layer = layer();
        let err = layer
            .recover(&Request::get(url("/missing.js")), offline())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn offline_page_escapes_record_fields() {
        let record = EmergencyRecord {
            business: "Smith & <Sons>".to_string(),
            ..EmergencyRecord::default()
        };
        let html = render_offline_page(&record);
        assert!(html.contains("Smith &amp; &lt;Sons&gt;"));
        assert!(!html.contains("<Sons>"));
    }
}
