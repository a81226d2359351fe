//! Worker registration, two-phase updates and the clients they control.
//!
//! A new version installs next to the active one and waits. It takes over
//! once no open client is controlled by the old version, or as soon as a
//! `SKIP_WAITING` arrives. Transitions are serialized; fetches never wait on
//! them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::control::{ControlMessage, ControlReply, ReplyPort, WireMessage};
use crate::error::{Error, Result};
use crate::request::{Request, Response};
use crate::stats::StatsSnapshot;
use crate::worker::{EventOutcome, InstallReport, Worker, WorkerEvent, WorkerState};

/// Identifies one open host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Open clients and the worker version controlling each.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Option<String>>>,
}

impl ClientRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, Option<String>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a new client, controlled by `controller` if any.
    pub fn open(&self, controller: Option<&str>) -> ClientId {
        let id = ClientId::new();
        self.lock().insert(id, controller.map(str::to_string));
        id
    }

    /// Forgets a client. Returns false if it was not open.
    pub fn close(&self, id: ClientId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Puts every open client under `version`. Returns how many there are.
    pub fn claim(&self, version: &str) -> usize {
        let mut clients = self.lock();
        for controller in clients.values_mut() {
            *controller = Some(version.to_string());
        }
        clients.len()
    }

    /// Number of clients controlled by `version`.
    #[must_use]
    pub fn controlled_by(&self, version: &str) -> usize {
        self.lock()
            .values()
            .filter(|c| c.as_deref() == Some(version))
            .count()
    }

    #[must_use]
    pub fn controller_of(&self, id: ClientId) -> Option<String> {
        self.lock().get(&id).cloned().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Where a registered version ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    /// Installed and now serving.
    Activated,
    /// Installed and waiting for the old version's clients to go away.
    Waiting,
    /// This version is already active or waiting; nothing was done.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub version: String,
    pub state: RegistrationState,
    /// `None` when nothing was installed.
    pub install: Option<InstallReport>,
}

#[derive(Default)]
struct Slots {
    active: Option<Arc<Worker>>,
    waiting: Option<Arc<Worker>>,
    /// Replaced versions that may still be finishing a request.
    retired: Vec<Weak<Worker>>,
}

impl Slots {
    fn retire(&mut self, worker: &Arc<Worker>) {
        self.retired.retain(|w| w.strong_count() > 0);
        self.retired.push(Arc::downgrade(worker));
    }
}

/// Sends one control message to a worker and waits for its reply.
async fn deliver(worker: &Arc<Worker>, message: ControlMessage) -> ControlReply {
    let (reply, rx) = ReplyPort::channel();
    worker.dispatch(WorkerEvent::Message { message, reply }).await;
    rx.await
        .unwrap_or_else(|_| ControlReply::failed("reply port closed"))
}

/// Owns the active worker and at most one pending update.
#[derive(Default)]
pub struct LifecycleController {
    slots: Mutex<Slots>,
    clients: Arc<ClientRegistry>,
    transitions: tokio::sync::Mutex<()>,
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("active", &self.active().map(|w| w.version().to_string()))
            .field("waiting", &self.waiting().map(|w| w.version().to_string()))
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl LifecycleController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn active(&self) -> Option<Arc<Worker>> {
        self.slots().active.clone()
    }

    /// The pending update, if one is installed and waiting.
    #[must_use]
    pub fn waiting(&self) -> Option<Arc<Worker>> {
        self.slots().waiting.clone()
    }

    #[must_use]
    pub const fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Stats of the active worker.
    #[must_use]
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.active().map(|w| w.stats())
    }

    /// Installs a worker version and activates it if nothing stands in the
    /// way.
    ///
    /// # Errors
    ///
    /// Returns an error if activation fails. Install failures are reported in
    /// the returned [`InstallReport`] instead.
    pub async fn register(&self, worker: Arc<Worker>) -> Result<Registration> {
        let _transition = self.transitions.lock().await;
        let version = worker.version().to_string();

        let known = {
            let slots = self.slots();
            [&slots.active, &slots.waiting]
                .into_iter()
                .flatten()
                .any(|w| w.version() == version)
        };
        if known {
            log::info!("Worker {version} is already registered");
            return Ok(Registration {
                version,
                state: RegistrationState::Unchanged,
                install: None,
            });
        }

        let report = match worker.dispatch(WorkerEvent::Install).await {
            EventOutcome::Installed(report) => report,
            other => return Err(Error::Control(format!("unexpected install outcome {other:?}"))),
        };

        let replaced = self.slots().waiting.replace(worker);
        if let Some(old) = replaced {
            log::info!("Pending update {} replaced by {version}", old.version());
            old.retire().await;
            old.set_state(WorkerState::Redundant);
            self.slots().retire(&old);
        }

        let state = if self.promote_locked().await? {
            RegistrationState::Activated
        } else {
            RegistrationState::Waiting
        };
        Ok(Registration {
            version,
            state,
            install: Some(report),
        })
    }

    /// Activates the pending update if its old version has no clients left
    /// or it was told to skip waiting. Returns true if it was activated.
    ///
    /// # Errors
    ///
    /// Returns an error if activation fails; the update keeps waiting.
    pub async fn try_promote(&self) -> Result<bool> {
        let _transition = self.transitions.lock().await;
        self.promote_locked().await
    }

    async fn promote_locked(&self) -> Result<bool> {
        let Some(next) = self.waiting() else {
            return Ok(false);
        };
        let current = self.active();

        let ready = next.skip_waiting_requested()
            || current
                .as_ref()
                .is_none_or(|c| self.clients.controlled_by(c.version()) == 0);
        if !ready {
            log::info!(
                "Worker {} waiting for {} client(s) of {}",
                next.version(),
                current.as_ref().map_or(0, |c| self.clients.controlled_by(c.version())),
                current.as_ref().map_or("-", |c| c.version())
            );
            return Ok(false);
        }

        // The outgoing version must not write into partitions the purge is
        // about to delete.
        if let Some(old) = &current {
            old.retire().await;
        }

        let activate = WorkerEvent::Activate {
            clients: Arc::clone(&self.clients),
        };
        let activated = match next.dispatch(activate).await {
            EventOutcome::Activated(result) => result.map(|_| ()),
            other => Err(Error::Control(format!("unexpected activate outcome {other:?}"))),
        };
        if let Err(e) = activated {
            if let Some(old) = &current {
                old.reinstate();
            }
            return Err(e);
        }

        {
            let mut slots = self.slots();
            slots.active = Some(Arc::clone(&next));
            slots.waiting = None;
            if let Some(old) = &current {
                slots.retire(old);
            }
        }
        if let Some(old) = current {
            old.set_state(WorkerState::Redundant);
            log::info!("Worker {} replaced by {}", old.version(), next.version());
        }
        Ok(true)
    }

    /// Forces the pending update to activate now.
    pub async fn skip_waiting(&self) -> ControlReply {
        self.post_message(WireMessage::from(ControlMessage::SkipWaiting))
            .await
    }

    /// Delivers a control message and returns its reply.
    ///
    /// `SKIP_WAITING` goes to the pending update (or the active worker when
    /// there is none); everything else goes to the active worker.
    pub async fn post_message(&self, wire: WireMessage) -> ControlReply {
        let message = match ControlMessage::try_from(wire) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Rejected control message: {e}");
                return ControlReply::failed(e);
            }
        };
        if message == ControlMessage::SkipWaiting {
            return self.skip_waiting_locked(message).await;
        }

        let Some(worker) = self.active() else {
            return ControlReply::failed(Error::NoActiveWorker);
        };
        deliver(&worker, message).await
    }

    /// Flags and promotes the pending update as one transition, so the
    /// worker that acknowledged the message is the one that gets activated.
    async fn skip_waiting_locked(&self, message: ControlMessage) -> ControlReply {
        let _transition = self.transitions.lock().await;
        let Some(target) = self.waiting().or_else(|| self.active()) else {
            return ControlReply::failed(Error::NoActiveWorker);
        };

        let reply = deliver(&target, message).await;
        if !reply.success || target.state() == WorkerState::Activated {
            return reply;
        }
        match self.promote_locked().await {
            Ok(true) => reply,
            Ok(false) => ControlReply::failed(format!("worker {} was not activated", target.version())),
            Err(e) => {
                log::error!("Forced activation failed: {e}");
                ControlReply::failed(e)
            }
        }
    }

    /// Registers a host page, controlled by the active version.
    pub fn open_client(&self) -> ClientId {
        let active = self.active();
        self.clients.open(active.as_ref().map(|w| w.version()))
    }

    /// Releases a host page. Closing the last client of the old version
    /// lets a pending update activate.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting activation fails.
    pub async fn close_client(&self, id: ClientId) -> Result<bool> {
        if !self.clients.close(id) {
            return Ok(false);
        }
        self.try_promote().await?;
        Ok(true)
    }

    /// Serves a request through the active worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveWorker`] before the first activation, or the
    /// worker's own error.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        let worker = self.active().ok_or(Error::NoActiveWorker)?;
        let (respond_with, rx) = oneshot::channel();
        worker
            .dispatch(WorkerEvent::Fetch {
                request,
                respond_with,
            })
            .await;
        rx.await
            .map_err(|_| Error::Control("fetch handler dropped its response".to_string()))?
    }

    /// Waits for background work of every live worker, replaced versions
    /// still finishing a request included.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = {
            let slots = self.slots();
            [&slots.active, &slots.waiting]
                .into_iter()
                .flatten()
                .cloned()
                .chain(slots.retired.iter().filter_map(Weak::upgrade))
                .collect()
        };
        for worker in workers {
            worker.settle_background().await;
        }
    }
}
