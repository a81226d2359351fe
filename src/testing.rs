//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{Error, Result};
use crate::network::Network;
use crate::request::{Request, Response};

/// Scripted behavior for one URL.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with this status and body.
    Respond(StatusCode, &'static str),
    /// Fail as if offline.
    Offline,
    /// Never answer (until the test's timeout fires).
    Hang,
    /// Answer with 200 and this body after a delay.
    Delayed(Duration, &'static str),
}

impl MockReply {
    pub const fn ok(body: &'static str) -> Self {
        Self::Respond(StatusCode::OK, body)
    }

    pub const fn status(status: StatusCode) -> Self {
        Self::Respond(status, "")
    }
}

/// A mock network with per-URL replies and call counters.
///
/// Unscripted URLs behave as `Offline`.
#[derive(Debug, Default)]
pub struct MockNetwork {
    replies: Mutex<HashMap<String, MockReply>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(self, url: &str, reply: MockReply) -> Self {
        self.set(url, reply);
        self
    }

    pub fn set(&self, url: &str, reply: MockReply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    /// Makes every URL fail from now on.
    pub fn go_offline(&self) {
        for reply in self.replies.lock().unwrap().values_mut() {
            *reply = MockReply::Offline;
        }
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.url.to_string();
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(url.clone()).or_default() += 1;

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or(MockReply::Offline);

        match reply {
            MockReply::Respond(status, body) => Ok(Response::new(status, body)),
            MockReply::Offline => Err(Error::Network(format!("offline: {url}"))),
            MockReply::Delayed(delay, body) => {
                tokio::time::sleep(delay).await;
                Ok(Response::new(StatusCode::OK, body))
            }
            MockReply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Network("hung".to_string()))
            }
        }
    }
}
