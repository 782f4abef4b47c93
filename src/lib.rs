//! Ploggy - friend-to-friend location/status sharing.
//!
//! A [`store::DataStore`] persists Self, friends and their statuses and
//! publishes every change on an [`events::EventBus`]. The
//! [`engine::Engine`] reacts to those changes: it pushes Self status to
//! friends, pulls each friend on a fixed period, and serves inbound
//! requests through the [`transport`] seams.

pub mod config;
pub mod engine;
pub mod events;
pub mod identity;
pub mod model;
pub mod monitor;
pub mod pool;
pub mod protocol;
pub mod record;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Collaborators, Engine, EngineError, EngineState};
pub use events::{Event, EventBus, FriendChange, Subscription};
pub use identity::{FriendId, PrivateIdentity, PublicIdentity, SelfIdentity};
pub use model::{Friend, Status};
pub use store::{DataStore, StoreError};
