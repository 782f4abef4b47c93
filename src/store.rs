//! Durable store for Self, friends and their statuses.
//!
//! On disk every record is its own JSON file (see [`crate::record`]). In
//! memory each record set has its own lock and a lazily filled cache: the
//! cache is only replaced after the file write succeeds, and the matching
//! [`Event`] is only published after that.
//!
//! Lock order: a friend-status slot may take the friend-list lock while
//! held, never the other way around.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, FriendChange};
use crate::identity::{FriendId, SelfIdentity};
use crate::model::{self, Friend, Status};
use crate::record::RecordFile;

const SELF_FILENAME: &str = "self.json";
const SELF_STATUS_FILENAME: &str = "selfStatus.json";
const FRIENDS_FILENAME: &str = "friends.json";
const FRIEND_STATUS_FILENAME_SUFFIX: &str = "-friendStatus.json";

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record was never written, or was removed
    #[error("data not found")]
    NotFound,

    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op}: {source}")]
    Serialization {
        op: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("certificate already belongs to friend {0}")]
    DuplicateCertificate(FriendId),

    #[error("friend id {0} is not the fingerprint of its public identity")]
    InconsistentFriendId(FriendId),

    #[error("reset failed to delete {0} file(s)")]
    ResetIncomplete(usize),
}

impl StoreError {
    pub(crate) fn io(op: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            op: op.into(),
            source,
        }
    }

    pub(crate) fn serialization(op: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            op: op.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Default)]
struct StatusSlot {
    /// Set once the owning friend is removed; late writers must not resurrect it
    removed: bool,
    cached: Option<Status>,
}

type SharedSlot = Arc<Mutex<StatusSlot>>;

/// Explicitly owned store over one data directory.
///
/// Share it behind an `Arc`; all methods take `&self`.
pub struct DataStore {
    dir: PathBuf,
    events: EventBus,
    self_identity: Mutex<Option<SelfIdentity>>,
    self_status: Mutex<Option<Status>>,
    /// `None` until first loaded from disk
    friends: Mutex<Option<Vec<Friend>>>,
    friend_statuses: parking_lot::Mutex<HashMap<FriendId, SharedSlot>>,
}

impl DataStore {
    /// Open (creating if needed) the data directory. Nothing is read yet.
    pub async fn open(dir: impl AsRef<Path>, events: EventBus) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(format!("create {}", dir.display()), e))?;
        debug!(dir = %dir.display(), "Opened data store");

        Ok(Self {
            dir,
            events,
            self_identity: Mutex::new(None),
            self_status: Mutex::new(None),
            friends: Mutex::new(None),
            friend_statuses: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn record(&self, file_name: &str) -> RecordFile {
        RecordFile::new(&self.dir, file_name)
    }

    fn friend_status_record(&self, id: &FriendId) -> RecordFile {
        self.record(&format!("{}{}", id.as_str(), FRIEND_STATUS_FILENAME_SUFFIX))
    }

    fn status_slot(&self, id: &FriendId) -> SharedSlot {
        self.friend_statuses
            .lock()
            .entry(id.clone())
            .or_default()
            .clone()
    }

    // -----------------------------------------------------------------------
    // Self
    // -----------------------------------------------------------------------

    /// Self identity; `NotFound` until one is stored.
    pub async fn get_self(&self) -> Result<SelfIdentity, StoreError> {
        let mut cached = self.self_identity.lock().await;
        if let Some(me) = cached.as_ref() {
            return Ok(me.clone());
        }
        let me: SelfIdentity = self.record(SELF_FILENAME).read().await?;
        *cached = Some(me.clone());
        Ok(me)
    }

    /// Replace Self identity and announce it.
    pub async fn update_self(&self, me: SelfIdentity) -> Result<(), StoreError> {
        let mut cached = self.self_identity.lock().await;
        self.record(SELF_FILENAME).write(&me).await?;
        info!(
            fingerprint = %me.public_identity.friend_id(),
            nickname = %me.public_identity.nickname,
            "Updated self"
        );
        *cached = Some(me);
        self.events.publish(Event::IdentityUpdated);
        Ok(())
    }

    /// Latest Self status.
    pub async fn get_self_status(&self) -> Result<Status, StoreError> {
        let mut cached = self.self_status.lock().await;
        if let Some(status) = cached.as_ref() {
            return Ok(status.clone());
        }
        let status: Status = self.record(SELF_STATUS_FILENAME).read().await?;
        *cached = Some(status.clone());
        Ok(status)
    }

    /// Replace Self status and announce it.
    pub async fn update_self_status(&self, status: Status) -> Result<(), StoreError> {
        let mut cached = self.self_status.lock().await;
        self.record(SELF_STATUS_FILENAME).write(&status).await?;
        debug!(timestamp = %status.timestamp, "Updated self status");
        *cached = Some(status);
        self.events.publish(Event::StatusUpdated);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Friends
    // -----------------------------------------------------------------------

    /// Fill the friend-list cache on first use. A missing file is an empty list.
    async fn load_friends<'a>(
        &self,
        cached: &'a mut Option<Vec<Friend>>,
    ) -> Result<&'a mut Vec<Friend>, StoreError> {
        if cached.is_none() {
            let friends = match self.record(FRIENDS_FILENAME).read::<Vec<Friend>>().await {
                Ok(friends) => friends,
                Err(StoreError::NotFound) => Vec::new(),
                Err(e) => return Err(e),
            };
            debug!(count = friends.len(), "Loaded friends");
            *cached = Some(friends);
        }
        Ok(cached.get_or_insert_with(Vec::new))
    }

    /// All friends; empty when none were ever stored.
    pub async fn get_friends(&self) -> Result<Vec<Friend>, StoreError> {
        let mut cached = self.friends.lock().await;
        Ok(self.load_friends(&mut cached).await?.clone())
    }

    /// Friend with `id`.
    pub async fn get_friend_by_id(&self, id: &FriendId) -> Result<Friend, StoreError> {
        let mut cached = self.friends.lock().await;
        self.load_friends(&mut cached)
            .await?
            .iter()
            .find(|f| &f.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Friend presenting `certificate`, for authenticating inbound requests.
    pub async fn get_friend_by_certificate(&self, certificate: &str) -> Result<Friend, StoreError> {
        let mut cached = self.friends.lock().await;
        self.load_friends(&mut cached)
            .await?
            .iter()
            .find(|f| f.certificate() == certificate)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Insert a new friend or replace the record with the same id.
    ///
    /// A newly added friend starts without a status, even if a status file
    /// outlived an earlier removal of the same identity.
    pub async fn insert_or_update_friend(&self, friend: Friend) -> Result<(), StoreError> {
        if !friend.id_is_consistent() {
            return Err(StoreError::InconsistentFriendId(friend.id));
        }

        let slot = self.status_slot(&friend.id);
        let mut slot = slot.lock().await;
        let mut cached = self.friends.lock().await;
        let friends = self.load_friends(&mut cached).await?;

        if let Some(other) = friends
            .iter()
            .find(|f| f.certificate() == friend.certificate() && f.id != friend.id)
        {
            return Err(StoreError::DuplicateCertificate(other.id.clone()));
        }

        let mut updated = friends.clone();
        let change = match updated.iter_mut().find(|f| f.id == friend.id) {
            Some(existing) => {
                *existing = friend.clone();
                FriendChange::Replaced
            }
            None => {
                self.friend_status_record(&friend.id).delete().await?;
                slot.removed = false;
                slot.cached = None;
                updated.push(friend.clone());
                FriendChange::Added
            }
        };

        self.commit_friends(friends, updated).await?;
        info!(
            friend = %friend.id,
            nickname = %friend.public_identity.nickname,
            ?change,
            "Updated friend"
        );
        self.events.publish(Event::FriendUpdated {
            id: friend.id,
            change,
        });
        Ok(())
    }

    /// Write the new list, then swap it into the cache.
    async fn commit_friends(
        &self,
        cached: &mut Vec<Friend>,
        updated: Vec<Friend>,
    ) -> Result<(), StoreError> {
        self.record(FRIENDS_FILENAME).write(&updated).await?;
        *cached = updated;
        Ok(())
    }

    /// Read-modify-write of one friend under the list lock.
    async fn modify_friend(
        &self,
        id: &FriendId,
        modify: impl FnOnce(&Friend) -> Friend,
    ) -> Result<(), StoreError> {
        let mut cached = self.friends.lock().await;
        let friends = self.load_friends(&mut cached).await?;
        let index = friends
            .iter()
            .position(|f| &f.id == id)
            .ok_or(StoreError::NotFound)?;

        let mut updated = friends.clone();
        updated[index] = modify(&friends[index]);
        self.commit_friends(friends, updated).await?;

        self.events.publish(Event::FriendUpdated {
            id: id.clone(),
            change: FriendChange::Timestamps,
        });
        Ok(())
    }

    /// When Self status last reached the friend.
    pub async fn get_friend_last_sent_status_timestamp(
        &self,
        id: &FriendId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.get_friend_by_id(id).await?.last_sent_status_timestamp)
    }

    /// Stamp a successful send to the friend with the current time.
    pub async fn update_friend_last_sent_status_timestamp(
        &self,
        id: &FriendId,
    ) -> Result<(), StoreError> {
        let at = model::now();
        self.modify_friend(id, |f| f.with_last_sent(at)).await
    }

    /// When the friend's status last reached this node.
    pub async fn get_friend_last_received_status_timestamp(
        &self,
        id: &FriendId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.get_friend_by_id(id).await?.last_received_status_timestamp)
    }

    /// Stamp a receipt from the friend with the current time.
    pub async fn update_friend_last_received_status_timestamp(
        &self,
        id: &FriendId,
    ) -> Result<(), StoreError> {
        let at = model::now();
        self.modify_friend(id, |f| f.with_last_received(at)).await
    }

    /// Remove a friend and its status record. Unknown ids change nothing.
    pub async fn remove_friend(&self, id: &FriendId) -> Result<(), StoreError> {
        {
            let mut cached = self.friends.lock().await;
            let friends = self.load_friends(&mut cached).await?;
            if !friends.iter().any(|f| &f.id == id) {
                return Err(StoreError::NotFound);
            }
            let updated = friends.iter().filter(|f| &f.id != id).cloned().collect();
            self.commit_friends(friends, updated).await?;
        }

        // List lock released first: slot holders may take it (see lock order).
        let slot = self.status_slot(id);
        {
            let mut slot = slot.lock().await;
            slot.removed = true;
            slot.cached = None;
            // A leftover file is cleared if the friend is ever added again.
            if let Err(e) = self.friend_status_record(id).delete().await {
                warn!(friend = %id, error = %e, "Failed to delete status of removed friend");
            }
        }
        self.friend_statuses.lock().remove(id);

        info!(friend = %id, "Removed friend");
        self.events.publish(Event::FriendRemoved { id: id.clone() });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Friend status
    // -----------------------------------------------------------------------

    /// The friend's last known status.
    pub async fn get_friend_status(&self, id: &FriendId) -> Result<Status, StoreError> {
        let slot = self.status_slot(id);
        let mut slot = slot.lock().await;
        if slot.removed {
            return Err(StoreError::NotFound);
        }
        if let Some(status) = slot.cached.as_ref() {
            return Ok(status.clone());
        }
        let status: Status = self.friend_status_record(id).read().await?;
        slot.cached = Some(status.clone());
        Ok(status)
    }

    /// Replace a friend's status. `NotFound` if the friend is not (or no
    /// longer) in the list, so a late pull cannot leave an orphan record.
    pub async fn update_friend_status(
        &self,
        id: &FriendId,
        status: Status,
    ) -> Result<(), StoreError> {
        let slot = self.status_slot(id);
        let mut slot = slot.lock().await;
        if slot.removed {
            return Err(StoreError::NotFound);
        }
        self.get_friend_by_id(id).await?;

        self.friend_status_record(id).write(&status).await?;
        debug!(friend = %id, timestamp = %status.timestamp, "Updated friend status");
        slot.cached = Some(status);
        self.events.publish(Event::FriendStatusUpdated { id: id.clone() });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Delete every file in the data directory (not recursively) and drop
    /// the caches. Keeps going past individual failures.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut me = self.self_identity.lock().await;
        let mut my_status = self.self_status.lock().await;
        let mut friends = self.friends.lock().await;

        let op = || format!("reset {}", self.dir.display());
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(op(), e))?;

        let mut failed = 0usize;
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(op(), e))? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(file = %entry.path().display(), error = %e, "Reset could not delete file");
                    failed += 1;
                }
            }
        }

        *me = None;
        *my_status = None;
        *friends = None;
        self.friend_statuses.lock().clear();

        if failed > 0 {
            return Err(StoreError::ResetIncomplete(failed));
        }
        info!(dir = %self.dir.display(), "Reset data store");
        Ok(())
    }
}
