//! Sync engine: schedules friend pulls, fans out pushes, serves friends.
//!
//! The engine:
//! - keeps one fixed-rate pull timer per friend,
//! - pushes Self status to every friend when it changes,
//! - (re)starts the transport + web server when Self identity changes,
//! - answers inbound pull/push requests routed to it by the transport,
//! - runs the local status monitor.
//!
//! Every reaction that does I/O runs on the worker pool, never on the event
//! dispatcher. Failures of background work are logged and
//! dropped: a failed push is covered by the friend's next pull, a failed
//! pull by the next tick.
//!
//! Exclusion scopes:
//! - `lifecycle`: start / stop / reload take it for writing; inbound
//!   requests and transport restarts or retries hold it for reading.
//! - `pulls`: the friend id → timer map; every schedule change goes through it.
//! - `sharing`: the running transport handle.
//!
//! None of them is held across an outbound friend request.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::events::{Event, FriendChange, Subscription};
use crate::identity::{FriendId, SelfIdentity};
use crate::model::{Friend, Status};
use crate::monitor::{LocationSource, StatusMonitor};
use crate::pool::{PoolClosed, WorkerPool};
use crate::protocol::{
    self, PULL_STATUS_REQUEST_PATH, PUSH_STATUS_REQUEST_PATH, WEB_SERVER_VIRTUAL_PORT,
};
use crate::store::{DataStore, StoreError};
use crate::transport::{
    PeerClient, PeerRequest, RequestHandler, SharingHandle, SharingService, TransportError,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Inbound request from a certificate that belongs to no friend
    #[error("request from unknown certificate rejected")]
    Rejected,

    #[error("malformed status payload: {0}")]
    Protocol(#[source] serde_json::Error),

    #[error("unknown request path {0}")]
    UnknownPath(String),

    #[error("engine is not running")]
    NotRunning,

    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
}

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub sharing: Arc<dyn SharingService>,
    pub client: Arc<dyn PeerClient>,
    /// Optional: without one, Self status only changes through the store
    pub location: Option<Arc<dyn LocationSource>>,
}

struct PullSchedule {
    generation: u64,
    timer: JoinHandle<()>,
}

impl Drop for PullSchedule {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

#[derive(Default)]
struct Background {
    dispatcher: Option<JoinHandle<()>>,
    monitor: Option<StatusMonitor>,
}

struct Inner {
    store: Arc<DataStore>,
    collaborators: Collaborators,
    config: parking_lot::RwLock<EngineConfig>,
    state: parking_lot::Mutex<EngineState>,
    lifecycle: tokio::sync::RwLock<()>,
    pool: parking_lot::RwLock<Option<Arc<WorkerPool>>>,
    /// `None` while stopped
    pulls: parking_lot::Mutex<Option<HashMap<FriendId, PullSchedule>>>,
    sharing: tokio::sync::Mutex<Option<Box<dyn SharingHandle>>>,
    background: parking_lot::Mutex<Background>,
    next_generation: AtomicU64,
}

/// Handle to the sync engine. Cheap to clone; all clones drive one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(store: Arc<DataStore>, config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                collaborators,
                config: parking_lot::RwLock::new(config),
                state: parking_lot::Mutex::new(EngineState::Stopped),
                lifecycle: tokio::sync::RwLock::new(()),
                pool: parking_lot::RwLock::new(None),
                pulls: parking_lot::Mutex::new(None),
                sharing: tokio::sync::Mutex::new(None),
                background: parking_lot::Mutex::new(Background::default()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.inner.store
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    pub fn config(&self) -> EngineConfig {
        self.inner.config.read().clone()
    }

    fn set_state(&self, state: EngineState) {
        *self.inner.state.lock() = state;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start serving and syncing. A no-op when already running.
    ///
    /// Fails if Self is missing or the transport does not start; everything
    /// started so far is torn down again and the engine stays stopped.
    pub async fn start(&self) -> Result<(), EngineError> {
        let _lifecycle = self.inner.lifecycle.write().await;
        self.startup().await
    }

    /// Stop everything. Safe to call when already stopped.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.write().await;
        self.shutdown().await;
    }

    /// Apply a changed configuration: stop, then start with `config`.
    pub async fn reload(&self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate()?;
        let _lifecycle = self.inner.lifecycle.write().await;
        info!("Reloading engine configuration");
        self.shutdown().await;
        if config.data_dir.as_path() != self.inner.store.dir() {
            warn!(
                data_dir = %config.data_dir.display(),
                "Data directory change needs a new store; keeping the open one"
            );
        }
        *self.inner.config.write() = config;
        self.startup().await
    }

    async fn startup(&self) -> Result<(), EngineError> {
        if self.state() != EngineState::Stopped {
            debug!("Engine already running");
            return Ok(());
        }
        let config = self.config();
        config.validate()?;
        self.set_state(EngineState::Starting);

        // Subscribe first so nothing published while starting is missed.
        let subscription = self.inner.store.events().subscribe();
        *self.inner.pool.write() = Some(Arc::new(WorkerPool::new(config.worker_count)));
        *self.inner.pulls.lock() = Some(HashMap::new());
        self.inner.background.lock().monitor = self.inner.collaborators.location.as_ref().map(
            |source| {
                StatusMonitor::start(
                    source.as_ref(),
                    self.inner.store.clone(),
                    config.location_precision,
                )
            },
        );

        if let Err(e) = self.start_running(&config, subscription).await {
            error!(error = %e, "Engine failed to start");
            self.shutdown().await;
            return Err(e);
        }

        self.set_state(EngineState::Running);
        info!(
            workers = config.worker_count,
            pull_period_ms = config.pull_period.as_millis() as u64,
            "Engine started"
        );
        Ok(())
    }

    async fn start_running(
        &self,
        config: &EngineConfig,
        subscription: Subscription,
    ) -> Result<(), EngineError> {
        let me = self.inner.store.get_self().await?;
        let handle = self.start_sharing(&me, config.listen_port).await?;
        *self.inner.sharing.lock().await = Some(handle);

        for friend in self.inner.store.get_friends().await? {
            self.schedule_pull(&friend.id, Duration::ZERO);
        }

        self.inner.background.lock().dispatcher = Some(self.spawn_dispatcher(subscription));
        Ok(())
    }

    async fn shutdown(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }

        let background = std::mem::take(&mut *self.inner.background.lock());
        if let Some(dispatcher) = background.dispatcher {
            dispatcher.abort();
        }

        // Dropping the schedules aborts their timers.
        let cancelled = self.inner.pulls.lock().take().map_or(0, |p| p.len());

        if let Some(mut handle) = self.inner.sharing.lock().await.take() {
            handle.stop().await;
        }

        drop(background.monitor);

        if let Some(pool) = self.inner.pool.write().take() {
            pool.shutdown();
        }

        self.set_state(EngineState::Stopped);
        info!(cancelled_pulls = cancelled, "Engine stopped");
    }

    async fn start_sharing(
        &self,
        me: &SelfIdentity,
        listen_port: u16,
    ) -> Result<Box<dyn SharingHandle>, EngineError> {
        let handler: Arc<dyn RequestHandler> = Arc::new(InboundHandler {
            engine: Arc::downgrade(&self.inner),
        });
        let handle = self
            .inner
            .collaborators
            .sharing
            .start(me, listen_port, handler)
            .await?;
        info!(
            hostname = %me.public_identity.hidden_service_hostname,
            "Sharing service started"
        );
        Ok(handle)
    }

    /// Self identity changed: swap the transport over to it. Pulls stay as they are.
    async fn restart_sharing(&self) -> Result<(), EngineError> {
        let _lifecycle = self.inner.lifecycle.read().await;
        if self.state() != EngineState::Running {
            return Ok(());
        }
        let mut sharing = self.inner.sharing.lock().await;
        if let Some(mut old) = sharing.take() {
            old.stop().await;
        }
        self.resume_sharing(&mut sharing).await
    }

    /// Bring the transport back up if a restart left the engine without one.
    async fn ensure_sharing(&self) -> Result<(), EngineError> {
        let _lifecycle = self.inner.lifecycle.read().await;
        if self.state() != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        let mut sharing = self.inner.sharing.lock().await;
        if sharing.is_some() {
            return Ok(());
        }
        info!("Retrying sharing service start");
        self.resume_sharing(&mut sharing).await
    }

    /// Start the transport into an empty slot. On failure the slot stays
    /// empty and the next outbound exchange tries again.
    async fn resume_sharing(
        &self,
        sharing: &mut Option<Box<dyn SharingHandle>>,
    ) -> Result<(), EngineError> {
        let me = self.inner.store.get_self().await?;
        let listen_port = self.inner.config.read().listen_port;
        match self.start_sharing(&me, listen_port).await {
            Ok(handle) => {
                *sharing = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Sharing service down until the next exchange");
                Err(e)
            }
        }
    }

    /// Proxy port of the running transport.
    pub async fn proxy_port(&self) -> Result<u16, EngineError> {
        let sharing = self.inner.sharing.lock().await;
        let handle = sharing.as_ref().ok_or(TransportError::NoProxy)?;
        Ok(handle.proxy_port()?)
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    fn pool(&self) -> Result<Arc<WorkerPool>, EngineError> {
        self.inner.pool.read().clone().ok_or(EngineError::NotRunning)
    }

    /// Run `work` on the pool; its failure is logged and dropped.
    fn submit_task<F>(&self, task: &'static str, friend: Option<&FriendId>, work: F)
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let friend = friend.map(|id| id.to_string()).unwrap_or_default();
        let Ok(pool) = self.pool() else {
            debug!(task, friend = %friend, "Engine stopped, dropping task");
            return;
        };
        let submitted = pool.submit(async move {
            match work.await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(task, friend = %friend, "Task target gone");
                }
                Err(e) => {
                    warn!(task, friend = %friend, error = %e, "Background task failed");
                }
            }
        });
        if submitted.is_err() {
            debug!(task, "Worker pool closed, dropping task");
        }
    }

    fn spawn_dispatcher(&self, mut subscription: Subscription) -> JoinHandle<()> {
        let engine = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                Engine { inner }.on_event(event);
            }
        })
    }

    fn on_event(&self, event: Event) {
        match event {
            Event::StatusUpdated => {
                let engine = self.clone();
                self.submit_task("push fan-out", None, async move {
                    engine.push_to_friends().await
                });
            }
            Event::IdentityUpdated => {
                let engine = self.clone();
                self.submit_task("restart sharing", None, async move {
                    engine.restart_sharing().await
                });
            }
            // Schedule changes only touch the pull map, so they apply here
            // in event order.
            Event::FriendUpdated {
                id,
                change: FriendChange::Added | FriendChange::Replaced,
            } => self.schedule_pull(&id, Duration::ZERO),
            Event::FriendRemoved { id } => self.cancel_pull(&id, None),
            Event::FriendUpdated {
                change: FriendChange::Timestamps,
                ..
            }
            | Event::FriendStatusUpdated { .. } => {}
        }
    }

    // -----------------------------------------------------------------------
    // Pull scheduling
    // -----------------------------------------------------------------------

    /// (Re)start `id`'s fixed-rate pull, first run after `initial_delay`.
    /// Replacing the schedule aborts the previous timer.
    fn schedule_pull(&self, id: &FriendId, initial_delay: Duration) {
        let period = self.inner.config.read().pull_period;
        let mut pulls = self.inner.pulls.lock();
        let Some(pulls) = pulls.as_mut() else {
            return;
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::downgrade(&self.inner);
        let friend = id.clone();
        let timer = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                let engine = Engine { inner };
                let run = engine.clone();
                let target = friend.clone();
                engine.submit_task("pull", Some(&friend), async move {
                    run.pull_friend(&target, generation).await
                });
            }
        });

        pulls.insert(id.clone(), PullSchedule { generation, timer });
        debug!(
            friend = %id,
            delay_ms = initial_delay.as_millis() as u64,
            "Scheduled pull"
        );
    }

    /// Drop `id`'s schedule; with `generation`, only if it is still that one.
    fn cancel_pull(&self, id: &FriendId, generation: Option<u64>) {
        let mut pulls = self.inner.pulls.lock();
        let Some(pulls) = pulls.as_mut() else {
            return;
        };
        let matches = pulls
            .get(id)
            .is_some_and(|s| generation.map_or(true, |g| s.generation == g));
        if matches {
            pulls.remove(id);
            debug!(friend = %id, "Cancelled pull");
        }
    }

    /// Friends with an active pull schedule.
    pub fn scheduled_pulls(&self) -> Vec<FriendId> {
        let pulls = self.inner.pulls.lock();
        let mut ids: Vec<FriendId> = pulls
            .as_ref()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    async fn peer_request(
        &self,
        me: &SelfIdentity,
        friend: &Friend,
        path: &'static str,
    ) -> Result<PeerRequest, EngineError> {
        self.ensure_sharing().await?;
        Ok(PeerRequest {
            key_material: me.key_material(),
            peer_certificate: friend.public_identity.x509_certificate.clone(),
            proxy_port: self.proxy_port().await?,
            peer_hostname: friend.public_identity.hidden_service_hostname.clone(),
            virtual_port: WEB_SERVER_VIRTUAL_PORT,
            path,
        })
    }

    /// One pull run. A missing Self or friend ends the schedule quietly.
    async fn pull_friend(&self, id: &FriendId, generation: u64) -> Result<(), EngineError> {
        let store = &self.inner.store;
        let lookup = async { Ok::<_, StoreError>((store.get_self().await?, store.get_friend_by_id(id).await?)) };
        let (me, friend) = match lookup.await {
            Ok(found) => found,
            Err(e) => {
                if e.is_not_found() {
                    self.cancel_pull(id, Some(generation));
                }
                return Err(e.into());
            }
        };

        let request = self.peer_request(&me, &friend, PULL_STATUS_REQUEST_PATH).await?;
        let body = self.inner.collaborators.client.get(request).await?;
        let status = protocol::decode_status(&body).map_err(EngineError::Protocol)?;

        store.update_friend_status(id, status).await?;
        store.update_friend_last_received_status_timestamp(id).await?;
        debug!(friend = %id, "Pulled friend status");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Push fan-out
    // -----------------------------------------------------------------------

    /// Queue one push per friend. Individual failures fall back to the
    /// friend's own pull schedule.
    async fn push_to_friends(&self) -> Result<(), EngineError> {
        for friend in self.inner.store.get_friends().await? {
            let engine = self.clone();
            let id = friend.id.clone();
            self.submit_task("push", Some(&friend.id), async move {
                engine.push_to_friend(&id).await
            });
        }
        Ok(())
    }

    async fn push_to_friend(&self, id: &FriendId) -> Result<(), EngineError> {
        let store = &self.inner.store;
        let me = store.get_self().await?;
        let status = store.get_self_status().await?;
        let friend = store.get_friend_by_id(id).await?;

        let request = self.peer_request(&me, &friend, PUSH_STATUS_REQUEST_PATH).await?;
        let body = protocol::encode_status(&status).map_err(EngineError::Protocol)?;
        self.inner.collaborators.client.post(request, body).await?;

        store.update_friend_last_sent_status_timestamp(id).await?;
        debug!(friend = %id, "Pushed self status");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound requests
    // -----------------------------------------------------------------------

    async fn authenticate(&self, friend_certificate: &str) -> Result<Friend, EngineError> {
        match self
            .inner
            .store
            .get_friend_by_certificate(friend_certificate)
            .await
        {
            Ok(friend) => Ok(friend),
            Err(e) if e.is_not_found() => {
                warn!("Rejected request from unknown certificate");
                Err(EngineError::Rejected)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn serve_pull(&self, friend_certificate: &str) -> Result<Status, EngineError> {
        let friend = self.authenticate(friend_certificate).await?;
        let status = self.inner.store.get_self_status().await?;
        // Counted as sent once the response is produced.
        self.inner
            .store
            .update_friend_last_sent_status_timestamp(&friend.id)
            .await?;
        debug!(friend = %friend.id, "Served pull");
        Ok(status)
    }

    async fn serve_push(&self, friend_certificate: &str, status: Status) -> Result<(), EngineError> {
        let friend = self.authenticate(friend_certificate).await?;
        let store = &self.inner.store;
        store.update_friend_status(&friend.id, status).await?;
        store
            .update_friend_last_received_status_timestamp(&friend.id)
            .await?;

        // A fresh push makes the next pull redundant: restart its period.
        let period = self.inner.config.read().pull_period;
        self.schedule_pull(&friend.id, period);
        debug!(friend = %friend.id, "Accepted push");
        Ok(())
    }

    /// Run an inbound request on the pool. Refused while starting/stopping.
    async fn dispatch_inbound<F, T>(&self, work: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        let _lifecycle = self
            .inner
            .lifecycle
            .try_read()
            .map_err(|_| EngineError::NotRunning)?;
        if self.state() != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        self.pool()?.run(work).await?
    }
}

#[async_trait]
impl RequestHandler for Engine {
    async fn handle_pull_status_request(
        &self,
        friend_certificate: &str,
    ) -> Result<Status, EngineError> {
        let engine = self.clone();
        let certificate = friend_certificate.to_string();
        self.dispatch_inbound(async move { engine.serve_pull(&certificate).await })
            .await
    }

    async fn handle_push_status_request(
        &self,
        friend_certificate: &str,
        status: Status,
    ) -> Result<(), EngineError> {
        let engine = self.clone();
        let certificate = friend_certificate.to_string();
        self.dispatch_inbound(async move { engine.serve_push(&certificate, status).await })
            .await
    }
}

/// What the transport holds: does not keep the engine alive.
struct InboundHandler {
    engine: Weak<Inner>,
}

impl InboundHandler {
    fn engine(&self) -> Result<Engine, EngineError> {
        self.engine
            .upgrade()
            .map(|inner| Engine { inner })
            .ok_or(EngineError::NotRunning)
    }
}

#[async_trait]
impl RequestHandler for InboundHandler {
    async fn handle_pull_status_request(
        &self,
        friend_certificate: &str,
    ) -> Result<Status, EngineError> {
        self.engine()?
            .handle_pull_status_request(friend_certificate)
            .await
    }

    async fn handle_push_status_request(
        &self,
        friend_certificate: &str,
        status: Status,
    ) -> Result<(), EngineError> {
        self.engine()?
            .handle_push_status_request(friend_certificate, status)
            .await
    }
}
