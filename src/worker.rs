//! One deployed worker version and its event handlers.
//!
//! Events are routed through [`Worker::dispatch`], which maps each event kind
//! to its handler and hands back the handler's task. The caller keeps the
//! worker alive by awaiting that task; nothing runs detached except the
//! interceptor's background refreshes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, join_all};
use reqwest::StatusCode;
use tokio::sync::oneshot;

use crate::config::WorkerConfig;
use crate::control::{ControlMessage, ControlReply, ReplyPort};
use crate::degrade::DegradationLayer;
use crate::error::{Error, Result};
use crate::interceptor::Interceptor;
use crate::lifecycle::ClientRegistry;
use crate::network::{Network, fetch_with_timeout};
use crate::partition::{CachePartitionRegistry, PartitionPurpose};
use crate::request::{Request, RequestKey, Response, StoredResponse};
use crate::routing::{Route, RoutePolicy};
use crate::stats::{StatsSnapshot, WorkerStats};
use crate::store::CacheStore;

/// Lifecycle state of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting for the previous version to let go.
    Installed,
    Activating,
    Activated,
    /// Replaced by a newer version.
    Redundant,
}

/// Result of fetching one URL into a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetOutcome {
    pub url: String,
    /// `None` on success.
    pub error: Option<String>,
}

impl AssetOutcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

fn count_ok(outcomes: &[AssetOutcome]) -> usize {
    outcomes.iter().filter(|o| o.is_ok()).count()
}

/// Per-sub-task outcome of an install. Install never fails as a whole.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// One outcome per configured critical asset, in order.
    pub critical: Vec<AssetOutcome>,
    /// One outcome per trusted external resource, in order.
    pub external: Vec<AssetOutcome>,
    /// `None` if the emergency record was stored.
    pub emergency_error: Option<String>,
}

impl InstallReport {
    /// Number of sub-task failures across all three sub-tasks.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.critical.len() - count_ok(&self.critical) + self.external.len()
            - count_ok(&self.external)
            + usize::from(self.emergency_error.is_some())
    }
}

/// What activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Stale partitions deleted.
    pub deleted: Vec<String>,
    /// Open clients now controlled by this version.
    pub claimed: usize,
}

/// An event delivered to a worker.
pub enum WorkerEvent {
    /// Precache the new version's partitions.
    Install,
    /// Purge stale partitions and claim the open clients.
    Activate {
        clients: Arc<ClientRegistry>,
    },
    /// Serve one intercepted request; the response goes to `respond_with`.
    Fetch {
        request: Request,
        respond_with: oneshot::Sender<Result<Response>>,
    },
    /// Handle a control command; the reply goes through `reply`.
    Message {
        message: ControlMessage,
        reply: ReplyPort,
    },
}

impl fmt::Debug for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => f.write_str("Install"),
            Self::Activate { .. } => f.write_str("Activate"),
            Self::Fetch { request, .. } => write!(f, "Fetch({} {})", request.method, request.url),
            Self::Message { message, .. } => write!(f, "Message({})", message.kind()),
        }
    }
}

/// What an event's task produced.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(Result<ActivateReport>),
    /// The response was sent through `respond_with`.
    Responded,
    /// The reply was sent through the reply port.
    Replied,
}

/// The task returned by [`Worker::dispatch`]. The host must drive it to
/// completion before it may consider the event handled.
pub type EventTask = BoxFuture<'static, EventOutcome>;

/// One worker version: its partitions, interceptor and handlers.
pub struct Worker {
    config: WorkerConfig,
    registry: CachePartitionRegistry,
    network: Arc<dyn Network>,
    interceptor: Interceptor,
    policy: Arc<RoutePolicy>,
    degrade: Arc<DegradationLayer>,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Builds a worker version over a partition store and a network.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let registry =
            CachePartitionRegistry::new(config.cache_prefix.clone(), config.version.clone(), store);
        let policy = Arc::new(RoutePolicy::from_config(&config)?);
        let degrade = Arc::new(DegradationLayer::new(
            registry.clone(),
            Arc::clone(&policy),
            config.emergency.clone(),
        )?);
        let interceptor = Interceptor::new(
            registry.clone(),
            Arc::clone(&network),
            Arc::clone(&policy),
            Arc::clone(&degrade),
            Arc::new(WorkerStats::new()),
            config.network_timeout(),
        );

        Ok(Arc::new(Self {
            config,
            registry,
            network,
            interceptor,
            policy,
            degrade,
            state: Mutex::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.config.version
    }

    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &CachePartitionRegistry {
        &self.registry
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!("Worker {} {:?} -> {state:?}", self.config.version, *current);
        *current = state;
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.interceptor.stats().snapshot()
    }

    /// True once a `SKIP_WAITING` message reached this version.
    #[must_use]
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Waits for outstanding background refreshes and cache writes.
    pub async fn settle_background(&self) {
        self.interceptor.settle_background().await;
    }

    /// Stops every later write to this version's partitions and waits for
    /// the ones already in flight. Called before a successor purges them.
    pub(crate) async fn retire(&self) {
        self.interceptor.stop_writes();
        self.interceptor.settle_background().await;
    }

    /// Undoes [`retire`](Self::retire) when the successor failed to activate.
    pub(crate) fn reinstate(&self) {
        self.interceptor.resume_writes();
    }

    /// Maps an event to its handler and returns the handler's task.
    #[must_use]
    pub fn dispatch(self: &Arc<Self>, event: WorkerEvent) -> EventTask {
        let worker = Arc::clone(self);
        match event {
            WorkerEvent::Install => {
                Box::pin(async move { EventOutcome::Installed(worker.on_install().await) })
            }
            WorkerEvent::Activate { clients } => Box::pin(async move {
                EventOutcome::Activated(worker.on_activate(&clients).await)
            }),
            WorkerEvent::Fetch {
                request,
                respond_with,
            } => Box::pin(async move {
                let _ = respond_with.send(worker.on_fetch(request).await);
                EventOutcome::Responded
            }),
            WorkerEvent::Message { message, reply } => Box::pin(async move {
                worker.on_message(message, reply).await;
                EventOutcome::Replied
            }),
        }
    }

    /// Populates the partitions. The three sub-tasks run concurrently and
    /// every one settles; individual failures are logged and reported, never
    /// fatal.
    pub async fn on_install(&self) -> InstallReport {
        self.set_state(WorkerState::Installing);

        if let Err(e) = self.registry.open_current().await {
            log::warn!("Could not create partitions for {}: {e}", self.version());
        }

        let (critical, external, emergency) = futures::join!(
            self.precache(PartitionPurpose::Critical, &self.config.critical_assets),
            self.precache(PartitionPurpose::External, &self.config.external_resources),
            self.store_emergency_record(),
        );

        let report = InstallReport {
            critical,
            external,
            emergency_error: emergency.err().map(|e| {
                log::warn!("Could not store emergency record: {e}");
                e.to_string()
            }),
        };

        log::info!(
            "Installed {}: {}/{} critical, {}/{} external, {} failure(s)",
            self.version(),
            count_ok(&report.critical),
            report.critical.len(),
            count_ok(&report.external),
            report.external.len(),
            report.failures()
        );
        self.set_state(WorkerState::Installed);
        report
    }

    /// Deletes stale partitions, then claims the open clients. The worker is
    /// only `Activated` once deletion has finished.
    ///
    /// # Errors
    ///
    /// Returns an error if stale partitions cannot be listed or deleted; the
    /// worker then stays `Installed`.
    pub async fn on_activate(&self, clients: &ClientRegistry) -> Result<ActivateReport> {
        self.set_state(WorkerState::Activating);

        let deleted = match self.registry.purge_stale().await {
            Ok(deleted) => deleted,
            Err(e) => {
                log::error!("Activation of {} failed: {e}", self.version());
                self.set_state(WorkerState::Installed);
                return Err(e);
            }
        };
        let claimed = clients.claim(self.version());

        self.set_state(WorkerState::Activated);
        log::info!(
            "Activated {}: deleted {} stale partition(s), claimed {claimed} client(s)",
            self.version(),
            deleted.len()
        );
        Ok(ActivateReport { deleted, claimed })
    }

    /// Serves one intercepted request.
    ///
    /// # Errors
    ///
    /// See [`Interceptor::handle`].
    pub async fn on_fetch(&self, request: Request) -> Result<Response> {
        self.interceptor.handle(request).await
    }

    /// Handles a control command. Always replies exactly once.
    pub async fn on_message(&self, message: ControlMessage, reply: ReplyPort) {
        log::info!("Control message {} for {}", message.kind(), self.version());
        match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting.store(true, Ordering::SeqCst);
                reply.send(ControlReply::ok());
            }
            ControlMessage::UpdateCache { urls } => {
                let outcomes = self.update_cache(&urls).await;
                log::info!(
                    "UPDATE_CACHE stored {}/{} URL(s)",
                    count_ok(&outcomes),
                    outcomes.len()
                );
                reply.send(ControlReply::ok());
            }
            ControlMessage::ClearCache => {
                reply.complete(self.registry.clear_all().await.map(|_| ()));
            }
        }
    }

    /// Fetches caller-supplied URLs into the critical partition, best effort.
    /// URLs the interceptor would never cache (other origins, excluded
    /// paths) are reported as failures without touching the network.
    pub async fn update_cache(&self, urls: &[String]) -> Vec<AssetOutcome> {
        self.precache(PartitionPurpose::Critical, urls).await
    }

    async fn precache(&self, purpose: PartitionPurpose, entries: &[String]) -> Vec<AssetOutcome> {
        join_all(entries.iter().map(|entry| async move {
            let result = self.fetch_into(purpose, entry).await;
            if let Err(ref e) = result {
                log::warn!("Could not cache {entry} in {purpose}: {e}");
            }
            AssetOutcome {
                url: entry.clone(),
                error: result.err().map(|e| e.to_string()),
            }
        }))
        .await
    }

    async fn fetch_into(&self, purpose: PartitionPurpose, entry: &str) -> Result<()> {
        let url = self.config.resolve(entry)?;
        let request = Request::get(url);
        if !matches!(self.policy.decide(&request), Route::CacheFirst { .. }) {
            return Err(Error::InvalidUrl {
                url: request.url.to_string(),
                reason: "not cacheable by this site".to_string(),
            });
        }
        let response =
            fetch_with_timeout(self.network.as_ref(), &request, self.config.network_timeout())
                .await?;
        let key = request.key().ok_or_else(|| Error::InvalidUrl {
            url: entry.to_string(),
            reason: "not cacheable".to_string(),
        })?;
        self.interceptor
            .write(purpose, &key, StoredResponse::from_response(&response))
            .await
    }

    async fn store_emergency_record(&self) -> Result<()> {
        let response = Response::new(StatusCode::OK, self.degrade.record().to_json()?)
            .with_content_type("application/json");
        let key: &RequestKey = self.degrade.record_key();
        self.interceptor
            .write(
                PartitionPurpose::Ephemeral,
                key,
                StoredResponse::from_response(&response),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::EMERGENCY_RECORD_PATH;
    use crate::request::ResponseSource;
    use crate::store::MemoryCacheStore;
    use crate::testing::{MockNetwork, MockReply};
    use reqwest::Url;
    use std::time::Duration;

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig::new()
            .with_version(version)
            .with_origin("https://site.test")
            .with_critical_assets(["/", "/app.css"])
            .with_external_resources(["https://fonts.gstatic.com/inter.woff2"])
            .with_trusted_origins(["https://fonts.gstatic.com"])
            .with_network_timeout(Duration::from_millis(50))
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://site.test{path}")).unwrap()
    }

    fn site_network() -> MockNetwork {
        MockNetwork::new()
            .with("https://site.test/", MockReply::ok("<html>home</html>"))
            .with("https://site.test/app.css", MockReply::ok("body{}"))
            .with("https://fonts.gstatic.com/inter.woff2", MockReply::ok("font"))
    }

    fn worker(config: WorkerConfig, network: MockNetwork) -> (Arc<Worker>, Arc<MockNetwork>) {
        let network = Arc::new(network);
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let worker = Worker::new(config, store, Arc::clone(&network) as Arc<dyn Network>).unwrap();
        (worker, network)
    }

    async fn message(worker: &Arc<Worker>, message: ControlMessage) -> ControlReply {
        let (reply, rx) = ReplyPort::channel();
        worker.dispatch(WorkerEvent::Message { message, reply }).await;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn install_populates_all_three_partitions() {
        let (worker, _) = worker(config("v1"), site_network());

        let EventOutcome::Installed(report) = worker.dispatch(WorkerEvent::Install).await else {
            panic!("expected install outcome");
        };

        assert_eq!(report.failures(), 0);
        assert_eq!(worker.state(), WorkerState::Installed);
        let reg = worker.registry();
        assert!(reg.contains(PartitionPurpose::Critical, &RequestKey::get(&url("/"))).await.unwrap());
        assert!(reg.contains(PartitionPurpose::Critical, &RequestKey::get(&url("/app.css"))).await.unwrap());
        assert_eq!(reg.entry_count(PartitionPurpose::External).await.unwrap(), 1);
        assert!(
            reg.contains(PartitionPurpose::Ephemeral, &RequestKey::get(&url(EMERGENCY_RECORD_PATH)))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn install_tolerates_partial_failure() {
        let network = site_network().with("https://site.test/app.css", MockReply::Offline);
        let (worker, _) = worker(config("v1"), network);

        let report = worker.on_install().await;

        assert_eq!(report.failures(), 1);
        assert_eq!(report.critical.len(), 2);
        let failed: Vec<_> = report.critical.iter().filter(|o| !o.is_ok()).collect();
        assert_eq!(failed[0].url, "/app.css");
        assert_eq!(worker.state(), WorkerState::Installed);
        assert_eq!(worker.registry().entry_count(PartitionPurpose::Critical).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn activate_purges_old_version_and_claims_clients() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let network: Arc<dyn Network> = Arc::new(site_network());
        let v1 = Worker::new(config("v1"), Arc::clone(&store), Arc::clone(&network)).unwrap();
        let v2 = Worker::new(config("v2"), Arc::clone(&store), network).unwrap();
        v1.on_install().await;
        v2.on_install().await;

        let clients = Arc::new(ClientRegistry::default());
        clients.open(Some("v1"));
        clients.open(None);

        let EventOutcome::Activated(result) = v2
            .dispatch(WorkerEvent::Activate {
                clients: Arc::clone(&clients),
            })
            .await
        else {
            panic!("expected activate outcome");
        };
        let report = result.unwrap();

        assert!(report.deleted.contains(&"site-v1-critical".to_string()));
        assert_eq!(report.claimed, 2);
        assert_eq!(clients.controlled_by("v2"), 2);
        assert_eq!(v2.state(), WorkerState::Activated);
        let names = store.names().await.unwrap();
        assert!(names.contains(&"site-v2-critical".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("site-v1-")));
    }

    #[tokio::test]
    async fn fetch_event_responds_through_channel() {
        let (worker, network) = worker(config("v1"), site_network());
        worker.on_install().await;
        let calls_after_install = network.total_calls();

        let (tx, rx) = oneshot::channel();
        let outcome = worker
            .dispatch(WorkerEvent::Fetch {
                request: Request::get(url("/app.css")),
                respond_with: tx,
            })
            .await;

        assert!(matches!(outcome, EventOutcome::Responded));
        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.source, ResponseSource::Cache);
        assert_eq!(resp.text(), "body{}");
        assert_eq!(network.total_calls(), calls_after_install);
    }

    #[tokio::test]
    async fn update_cache_is_best_effort() {
        let network = MockNetwork::new().with("https://site.test/a.js", MockReply::ok("a"));
        let (worker, _) = worker(config("v1"), network);

        let reply = message(
            &worker,
            ControlMessage::UpdateCache {
                urls: vec!["/a.js".to_string(), "/b.js".to_string()],
            },
        )
        .await;

        assert_eq!(reply, ControlReply::ok());
        let reg = worker.registry();
        assert!(reg.contains(PartitionPurpose::Critical, &RequestKey::get(&url("/a.js"))).await.unwrap());
        assert!(!reg.contains(PartitionPurpose::Critical, &RequestKey::get(&url("/b.js"))).await.unwrap());
    }

    #[tokio::test]
    async fn update_cache_refuses_urls_outside_the_site() {
        let network = MockNetwork::new()
            .with("https://site.test/a.js", MockReply::ok("a"))
            .with("http://169.254.169.254/latest/meta-data", MockReply::ok("secret"))
            .with("https://cdn.evil.test/x.js", MockReply::ok("x"));
        let (worker, network) = worker(config("v1"), network);

        let outcomes = worker
            .update_cache(&[
                "/a.js".to_string(),
                "http://169.254.169.254/latest/meta-data".to_string(),
                "https://cdn.evil.test/x.js".to_string(),
            ])
            .await;

        assert_eq!(count_ok(&outcomes), 1);
        assert!(outcomes[0].is_ok());
        assert!(!outcomes[1].is_ok());
        assert!(!outcomes[2].is_ok());
        assert_eq!(network.calls("http://169.254.169.254/latest/meta-data"), 0);
        assert_eq!(network.calls("https://cdn.evil.test/x.js"), 0);
        assert_eq!(worker.registry().entry_count(PartitionPurpose::Critical).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_cache_removes_every_entry() {
        let (worker, network) = worker(config("v1"), site_network());
        worker.on_install().await;

        let reply = message(&worker, ControlMessage::ClearCache).await;
        assert!(reply.success);

        for path in ["/", "/app.css", EMERGENCY_RECORD_PATH] {
            let key = RequestKey::get(&url(path));
            assert!(
                worker
                    .registry()
                    .lookup(&key, PartitionPurpose::Critical)
                    .await
                    .unwrap()
                    .is_none()
            );
        }

        // A later fetch goes back to the network.
        network.go_offline();
        let err = worker
            .on_fetch(Request::get(url("/app.css")).with_destination(crate::request::Destination::Style))
            .await
            .unwrap_err();
        assert!(err.is_network_failure());
    }

    #[tokio::test]
    async fn skip_waiting_sets_flag() {
        let (worker, _) = worker(config("v2"), site_network());
        assert!(!worker.skip_waiting_requested());
        let reply = message(&worker, ControlMessage::SkipWaiting).await;
        assert!(reply.success);
        assert!(worker.skip_waiting_requested());
    }

    #[tokio::test]
    async fn emergency_request_offline_returns_installed_record() {
        let (worker, network) = worker(config("v1"), site_network());
        worker.on_install().await;
        network.go_offline();

        let resp = worker
            .on_fetch(Request::get(url("/api/contact")))
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(json["phone"], worker.config().emergency.phone);
    }

    #[tokio::test]
    async fn retired_worker_stops_writing() {
        let network = site_network().with("https://site.test/late.js", MockReply::ok("late"));
        let (worker, _) = worker(config("v1"), network);
        worker.on_install().await;
        worker.retire().await;

        let outcomes = worker.update_cache(&["/late.js".to_string()]).await;
        assert!(!outcomes[0].is_ok());
        let resp = worker
            .on_fetch(Request::get(url("/late.js")).with_destination(crate::request::Destination::Script))
            .await
            .unwrap();
        assert_eq!(resp.text(), "late");
        let late = RequestKey::get(&url("/late.js"));
        assert!(!worker.registry().contains(PartitionPurpose::Critical, &late).await.unwrap());

        worker.reinstate();
        let outcomes = worker.update_cache(&["/late.js".to_string()]).await;
        assert!(outcomes[0].is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let network: Arc<dyn Network> = Arc::new(MockNetwork::new());
        let result = Worker::new(
            WorkerConfig::new().with_version("no spaces"),
            Arc::clone(&store),
            Arc::clone(&network),
        );
        assert!(matches!(result, Err(Error::Config(_))));
        let result = Worker::new(config("v1").with_cache_prefix("site-blog"), store, network);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
