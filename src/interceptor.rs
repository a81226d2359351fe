//! The request interceptor: decides per request between cache and network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use crate::degrade::DegradationLayer;
use crate::error::{Error, Result};
use crate::network::{Network, fetch_with_timeout};
use crate::partition::{CachePartitionRegistry, PartitionPurpose};
use crate::request::{Request, RequestKey, Response, StoredResponse};
use crate::routing::{Route, RoutePolicy};
use crate::stats::WorkerStats;

/// Serves intercepted requests.
///
/// Cheap to clone; clones share the registry, network, stats, the write
/// gate and the tracker of background refreshes and in-flight writes.
#[derive(Clone)]
pub struct Interceptor {
    registry: CachePartitionRegistry,
    network: Arc<dyn Network>,
    policy: Arc<RoutePolicy>,
    degrade: Arc<DegradationLayer>,
    stats: Arc<WorkerStats>,
    timeout: Duration,
    background: TaskTracker,
    writable: Arc<AtomicBool>,
    settling: Arc<Mutex<()>>,
}

impl Interceptor {
    #[must_use]
    pub fn new(
        registry: CachePartitionRegistry,
        network: Arc<dyn Network>,
        policy: Arc<RoutePolicy>,
        degrade: Arc<DegradationLayer>,
        stats: Arc<WorkerStats>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            network,
            policy,
            degrade,
            stats,
            timeout,
            background: TaskTracker::new(),
            writable: Arc::new(AtomicBool::new(true)),
            settling: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Serves one request.
    ///
    /// # Errors
    ///
    /// Bypassed requests return the network's own error. Cacheable requests
    /// only fail when neither cache, network nor the degradation layer can
    /// answer, in which case the original network error is returned.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        match self.policy.decide(&request) {
            Route::Bypass(reason) => {
                log::debug!("Bypassing {} {} ({reason:?})", request.method, request.url);
                self.stats.record_bypass();
                self.stats.record_network_fetch();
                self.network.fetch(&request).await
            }
            Route::NetworkOnly => {
                self.stats.record_network_fetch();
                match fetch_with_timeout(self.network.as_ref(), &request, self.timeout).await {
                    Ok(response) => Ok(response),
                    Err(e) => self.fallback(&request, e).await,
                }
            }
            Route::CacheFirst {
                partition,
                revalidate,
            } => self.cache_first(request, partition, revalidate).await,
        }
    }

    async fn cache_first(
        &self,
        request: Request,
        partition: PartitionPurpose,
        revalidate: bool,
    ) -> Result<Response> {
        let Some(key) = request.key() else {
            return self.network.fetch(&request).await;
        };

        match self.registry.lookup(&key, partition).await {
            Ok(Some((found_in, stored))) => {
                self.stats.record_hit();
                if revalidate {
                    self.spawn_revalidation(request, key, found_in);
                }
                return Ok(Response::from_stored(stored));
            }
            Ok(None) => self.stats.record_miss(),
            Err(e) => {
                log::warn!("Cache read for {key} failed: {e}");
                self.stats.record_miss();
            }
        }

        self.stats.record_network_fetch();
        match fetch_with_timeout(self.network.as_ref(), &request, self.timeout).await {
            Ok(response) => {
                self.store(partition, &key, &response).await;
                Ok(response)
            }
            Err(e) => self.fallback(&request, e).await,
        }
    }

    /// Writes one entry unless writes were stopped. The write is tracked, so
    /// [`settle_background`](Self::settle_background) also waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Retired`] after [`stop_writes`](Self::stop_writes),
    /// or the store's error.
    pub async fn write(
        &self,
        partition: PartitionPurpose,
        key: &RequestKey,
        stored: StoredResponse,
    ) -> Result<()> {
        self.background
            .track_future(async {
                if !self.writes_enabled() {
                    return Err(Error::Retired(self.registry.version().to_string()));
                }
                self.registry.put(partition, key, stored).await
            })
            .await
    }

    #[must_use]
    pub fn writes_enabled(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    /// Makes every later write fail with [`Error::Retired`]. Writes already
    /// past the gate finish; settle afterwards to wait for them.
    pub fn stop_writes(&self) {
        self.writable.store(false, Ordering::SeqCst);
    }

    pub fn resume_writes(&self) {
        self.writable.store(true, Ordering::SeqCst);
    }

    /// Best-effort write; failures are logged and counted, never returned.
    async fn store(&self, partition: PartitionPurpose, key: &RequestKey, response: &Response) {
        let stored = StoredResponse::from_response(response);
        match self.write(partition, key, stored).await {
            Ok(()) => {}
            Err(Error::Retired(version)) => {
                log::debug!("Not caching {key}: worker {version} is retired");
            }
            Err(e) => {
                log::warn!("Could not cache {key} in {partition}: {e}");
                self.stats.record_cache_write_failure();
            }
        }
    }

    async fn fallback(&self, request: &Request, error: Error) -> Result<Response> {
        let result = self.degrade.recover(request, error).await;
        if result.is_ok() {
            self.stats.record_fallback();
        }
        result
    }

    /// Refreshes an entry after it was served. The caller never waits on
    /// this, and a failed refresh leaves the entry untouched.
    fn spawn_revalidation(&self, request: Request, key: RequestKey, partition: PartitionPurpose) {
        let this = self.clone();
        self.background.spawn(async move {
            this.stats.record_network_fetch();
            match fetch_with_timeout(this.network.as_ref(), &request, this.timeout).await {
                Ok(response) => {
                    let stored = StoredResponse::from_response(&response);
                    match this.write(partition, &key, stored).await {
                        Ok(()) => this.stats.record_revalidation(true),
                        Err(Error::Retired(version)) => {
                            log::debug!("Dropping refresh of {key}: worker {version} is retired");
                            this.stats.record_revalidation(false);
                        }
                        Err(e) => {
                            log::warn!("Could not store refreshed {key}: {e}");
                            this.stats.record_cache_write_failure();
                            this.stats.record_revalidation(false);
                        }
                    }
                }
                Err(e) => {
                    log::debug!("Background refresh of {key} failed: {e}");
                    this.stats.record_revalidation(false);
                }
            }
        });
    }

    /// Waits for every outstanding background refresh and tracked write.
    ///
    /// Concurrent callers are serialized, so one caller reopening the
    /// tracker can never cut another caller's wait short. Work spawned while
    /// a settle is in progress is still tracked and waited for.
    pub async fn settle_background(&self) {
        let _settling = self.settling.lock().await;
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}
