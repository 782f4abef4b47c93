//! Seams to the network collaborators.
//!
//! The engine never opens sockets itself. It talks to:
//! - a [`SharingService`] that publishes the local web server through the
//!   anonymizing network and authenticates inbound peers by certificate,
//! - a [`PeerClient`] that makes authenticated requests to a friend's
//!   hidden service through the local proxy.
//!
//! Inbound requests come back through [`RequestHandler`], which the engine
//! implements. [`route_request`] maps a request path to that handler and
//! applies the wire codec, so a server implementation only moves bytes.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::engine::EngineError;
use crate::identity::{KeyMaterial, SelfIdentity};
use crate::model::Status;
use crate::protocol::{self, PULL_STATUS_REQUEST_PATH, PUSH_STATUS_REQUEST_PATH};

/// Transport-related errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no proxy")]
    NoProxy,

    #[error("transport startup failed: {0}")]
    Startup(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("peer authentication failed: {0}")]
    Authentication(String),

    #[error("peer answered with HTTP {0}")]
    HttpStatus(u16),
}

/// Everything the client needs to reach one friend.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    /// Our certificate + key, presented for mutual authentication
    pub key_material: KeyMaterial,
    /// The only certificate the peer's server may present
    pub peer_certificate: String,
    /// Local SOCKS port of the running transport
    pub proxy_port: u16,
    pub peer_hostname: String,
    pub virtual_port: u16,
    pub path: &'static str,
}

/// Authenticated request client.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn get(&self, request: PeerRequest) -> Result<String, TransportError>;

    async fn post(&self, request: PeerRequest, body: String) -> Result<String, TransportError>;
}

/// Inbound side, implemented by the engine. `friend_certificate` is the
/// certificate the transport authenticated the caller with.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_pull_status_request(&self, friend_certificate: &str)
        -> Result<Status, EngineError>;

    async fn handle_push_status_request(
        &self,
        friend_certificate: &str,
        status: Status,
    ) -> Result<(), EngineError>;
}

/// Transport + web server pair lifecycle.
#[async_trait]
pub trait SharingService: Send + Sync {
    /// Start serving as `me` on `listen_port`, routing requests to `handler`.
    async fn start(
        &self,
        me: &SelfIdentity,
        listen_port: u16,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Box<dyn SharingHandle>, TransportError>;
}

/// A running transport + web server.
#[async_trait]
pub trait SharingHandle: Send + Sync {
    /// SOCKS port outbound requests go through.
    fn proxy_port(&self) -> Result<u16, TransportError>;

    async fn stop(&mut self);
}

/// Dispatch an authenticated request by path. Returns the response body
/// (empty for a push).
pub async fn route_request(
    handler: &dyn RequestHandler,
    friend_certificate: &str,
    path: &str,
    body: Option<&str>,
) -> Result<String, EngineError> {
    match path {
        PULL_STATUS_REQUEST_PATH => {
            let status = handler.handle_pull_status_request(friend_certificate).await?;
            protocol::encode_status(&status).map_err(EngineError::Protocol)
        }
        PUSH_STATUS_REQUEST_PATH => {
            let status = protocol::decode_status(body.unwrap_or_default())
                .map_err(EngineError::Protocol)?;
            handler
                .handle_push_status_request(friend_certificate, status)
                .await?;
            Ok(String::new())
        }
        other => Err(EngineError::UnknownPath(other.to_string())),
    }
}
