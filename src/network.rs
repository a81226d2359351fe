//! Network abstraction for testability.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONNECTION, HOST, HeaderMap, TRANSFER_ENCODING};

use crate::error::{Error, Result};
use crate::request::{Request, Response};

/// Abstraction over the network the worker fetches through.
///
/// `fetch` returns `Ok` for any HTTP status; judging success is the caller's
/// business (see [`fetch_with_timeout`]).
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs the request.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Builds a configured HTTP client for upstream requests.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// Default network implementation using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Creates a network over an existing client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Headers that describe the hop, not the resource.
fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in [HOST, CONNECTION, TRANSFER_ENCODING] {
        out.remove(name);
    }
    out
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let upstream = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(forwardable(&request.headers))
            .body(request.body.clone())
            .send()
            .await?;

        let status = upstream.status();
        let headers = forwardable(upstream.headers());
        let body = upstream.bytes().await?;

        Ok(Response {
            headers,
            ..Response::new(status, body)
        })
    }
}

/// Fetches through `network`, racing the fixed `timeout`.
///
/// A non-success status or an elapsed timeout is a failure. On timeout the
/// in-flight future is dropped; underlying I/O is abandoned best-effort.
///
/// # Errors
///
/// Returns `Error::Timeout`, `Error::Status`, or the network's own error.
pub async fn fetch_with_timeout(
    network: &dyn Network,
    request: &Request,
    timeout: Duration,
) -> Result<Response> {
    let response = tokio::time::timeout(timeout, network.fetch(request))
        .await
        .map_err(|_| Error::Timeout {
            url: request.url.to_string(),
            after: timeout,
        })??;

    if response.is_success() {
        Ok(response)
    } else {
        Err(Error::Status {
            url: request.url.to_string(),
            status: response.status,
        })
    }
}
