//! In-process loopback network for engine tests.
//!
//! Nodes register their hostname + certificate when their sharing service
//! starts. Clients deliver requests straight into the target node's
//! handler through [`route_request`], so both sides run the real wire codec.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::engine::EngineError;
use crate::events::EventBus;
use crate::identity::{PrivateIdentity, PublicIdentity, SelfIdentity};
use crate::model::{self, Status, FULL_PRECISION};
use crate::store::{DataStore, StoreError};
use crate::transport::{
    route_request, PeerClient, PeerRequest, RequestHandler, SharingHandle, SharingService,
    TransportError,
};

pub const LOOPBACK_PROXY_PORT: u16 = 9050;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn self_identity(name: &str) -> SelfIdentity {
    SelfIdentity::new(
        PublicIdentity::new(name, format!("cert-{name}"), format!("{name}.onion")),
        PrivateIdentity::new(format!("key-{name}"), format!("hs-key-{name}")),
    )
}

pub fn status(longitude: f64, address: &str) -> Status {
    Status::new(model::now(), longitude, 45.0, FULL_PRECISION, address)
}

pub fn config(dir: &Path, pull_period: Duration) -> EngineConfig {
    EngineConfig {
        data_dir: dir.to_path_buf(),
        pull_period,
        worker_count: 4,
        ..EngineConfig::default()
    }
}

pub async fn open_store(dir: &Path) -> Arc<DataStore> {
    Arc::new(DataStore::open(dir, EventBus::new()).await.unwrap())
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub from_certificate: String,
    pub path: &'static str,
    pub delivered: bool,
}

#[derive(Clone)]
struct Node {
    certificate: String,
    handler: Arc<dyn RequestHandler>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<String, Node>,
    /// (sender certificate, path) pairs that fail to connect
    blocked: HashSet<(String, &'static str)>,
    requests: Vec<RequestRecord>,
}

#[derive(Default)]
pub struct Network {
    state: Mutex<NetworkState>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, hostname: &str, certificate: &str, handler: Arc<dyn RequestHandler>) {
        self.state.lock().nodes.insert(
            hostname.to_string(),
            Node {
                certificate: certificate.to_string(),
                handler,
            },
        );
    }

    pub fn unregister(&self, hostname: &str) {
        self.state.lock().nodes.remove(hostname);
    }

    pub fn is_serving(&self, hostname: &str) -> bool {
        self.state.lock().nodes.contains_key(hostname)
    }

    /// Make every `path` request sent with `from_certificate` fail.
    pub fn block(&self, from_certificate: &str, path: &'static str) {
        self.state
            .lock()
            .blocked
            .insert((from_certificate.to_string(), path));
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().requests.clone()
    }

    /// Attempts (delivered or not) sent with `from_certificate` to `path`.
    pub fn attempts(&self, from_certificate: &str, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.from_certificate == from_certificate && r.path == path)
            .count()
    }

    async fn deliver(
        &self,
        request: PeerRequest,
        body: Option<String>,
    ) -> Result<String, TransportError> {
        let from = request.key_material.certificate.clone();
        let handler = {
            let mut state = self.state.lock();
            let blocked = state.blocked.contains(&(from.clone(), request.path));
            let node = state.nodes.get(&request.peer_hostname).cloned();
            state.requests.push(RequestRecord {
                from_certificate: from.clone(),
                path: request.path,
                delivered: !blocked && node.is_some(),
            });
            if blocked {
                return Err(TransportError::ConnectionFailed("blocked".into()));
            }
            let node = node.ok_or_else(|| {
                TransportError::ConnectionFailed(format!("{} unreachable", request.peer_hostname))
            })?;
            if node.certificate != request.peer_certificate {
                return Err(TransportError::Authentication("certificate mismatch".into()));
            }
            node.handler
        };

        route_request(handler.as_ref(), &from, request.path, body.as_deref())
            .await
            .map_err(|e| {
                TransportError::HttpStatus(match e {
                    EngineError::Rejected => 403,
                    EngineError::UnknownPath(_) => 404,
                    EngineError::NotRunning => 503,
                    _ => 500,
                })
            })
    }
}

// ---------------------------------------------------------------------------
// Transport pair
// ---------------------------------------------------------------------------

pub struct LoopbackSharing {
    network: Arc<Network>,
    fail: AtomicBool,
    starts: AtomicUsize,
}

impl LoopbackSharing {
    pub fn new(network: Arc<Network>) -> Arc<Self> {
        Arc::new(Self {
            network,
            fail: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        })
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Successful starts so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharingService for LoopbackSharing {
    async fn start(
        &self,
        me: &SelfIdentity,
        _listen_port: u16,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Box<dyn SharingHandle>, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Startup("loopback configured to fail".into()));
        }
        let hostname = me.public_identity.hidden_service_hostname.clone();
        self.network
            .register(&hostname, &me.public_identity.x509_certificate, handler);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackHandle {
            network: self.network.clone(),
            hostname,
            running: true,
        }))
    }
}

struct LoopbackHandle {
    network: Arc<Network>,
    hostname: String,
    running: bool,
}

#[async_trait]
impl SharingHandle for LoopbackHandle {
    fn proxy_port(&self) -> Result<u16, TransportError> {
        if self.running {
            Ok(LOOPBACK_PROXY_PORT)
        } else {
            Err(TransportError::NoProxy)
        }
    }

    async fn stop(&mut self) {
        self.running = false;
        self.network.unregister(&self.hostname);
    }
}

pub struct LoopbackClient {
    network: Arc<Network>,
}

impl LoopbackClient {
    pub fn new(network: Arc<Network>) -> Arc<Self> {
        Arc::new(Self { network })
    }
}

#[async_trait]
impl PeerClient for LoopbackClient {
    async fn get(&self, request: PeerRequest) -> Result<String, TransportError> {
        assert_eq!(request.proxy_port, LOOPBACK_PROXY_PORT);
        self.network.deliver(request, None).await
    }

    async fn post(&self, request: PeerRequest, body: String) -> Result<String, TransportError> {
        assert_eq!(request.proxy_port, LOOPBACK_PROXY_PORT);
        self.network.deliver(request, Some(body)).await
    }
}

// ---------------------------------------------------------------------------
// Scripted peer
// ---------------------------------------------------------------------------

/// A friend that serves a fixed status and records what it is pushed.
#[derive(Default)]
pub struct StaticPeer {
    status: Mutex<Option<Status>>,
    pushes: Mutex<Vec<(String, Status)>>,
}

impl StaticPeer {
    pub fn new(status: Option<Status>) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            pushes: Mutex::new(Vec::new()),
        })
    }

    /// (sender certificate, status) per accepted push.
    pub fn pushes(&self) -> Vec<(String, Status)> {
        self.pushes.lock().clone()
    }
}

#[async_trait]
impl RequestHandler for StaticPeer {
    async fn handle_pull_status_request(
        &self,
        _friend_certificate: &str,
    ) -> Result<Status, EngineError> {
        self.status
            .lock()
            .clone()
            .ok_or(EngineError::Store(StoreError::NotFound))
    }

    async fn handle_push_status_request(
        &self,
        friend_certificate: &str,
        status: Status,
    ) -> Result<(), EngineError> {
        self.pushes
            .lock()
            .push((friend_certificate.to_string(), status));
        Ok(())
    }
}
