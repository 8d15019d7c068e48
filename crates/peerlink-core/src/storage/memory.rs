//! In-memory storage

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use ulid::Ulid;

use super::{MessageQueue, PairingStore, ProfileStore, QueuedMessage};
use crate::error::LinkResult;
use crate::futures::MsgFuture;
use crate::types::{PairStatus, PairingRequest, PairingRequestId, ProfileInfo, ProfileKey};

/// Default number of failed deliveries before a queued message is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Address books keyed by (owner, remote)
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<(ProfileKey, ProfileKey), ProfileInfo>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, owner: &ProfileKey, key: &ProfileKey) -> LinkResult<Option<ProfileInfo>> {
        Ok(self.profiles.read().get(&(*owner, *key)).cloned())
    }

    fn save(&self, owner: &ProfileKey, info: &ProfileInfo) -> LinkResult<()> {
        self.profiles.write().insert((*owner, info.key), info.clone());
        Ok(())
    }

    fn update_paired(&self, owner: &ProfileKey, key: &ProfileKey, status: PairStatus) -> LinkResult<()> {
        self.profiles
            .write()
            .entry((*owner, *key))
            .or_insert_with(|| ProfileInfo::from_key(*key))
            .pair_status = status;
        Ok(())
    }

    fn list(&self, owner: &ProfileKey) -> LinkResult<Vec<ProfileInfo>> {
        let mut profiles: Vec<ProfileInfo> = self
            .profiles
            .read()
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|(_, info)| info.clone())
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name).then(a.key.cmp(&b.key)));
        Ok(profiles)
    }
}

#[derive(Debug, Default)]
pub struct MemoryPairingStore {
    requests: RwLock<HashMap<PairingRequestId, PairingRequest>>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PairingStore for MemoryPairingStore {
    fn save(&self, request: &PairingRequest) -> LinkResult<PairingRequestId> {
        self.requests.write().insert(request.id, request.clone());
        Ok(request.id)
    }

    fn get(&self, id: &PairingRequestId) -> LinkResult<Option<PairingRequest>> {
        Ok(self.requests.read().get(id).cloned())
    }

    fn find(&self, sender: &ProfileKey, remote: &ProfileKey) -> LinkResult<Option<PairingRequest>> {
        Ok(self
            .requests
            .read()
            .values()
            .filter(|r| &r.sender_key == sender && &r.remote_key == remote)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    fn update_status(&self, sender: &ProfileKey, remote: &ProfileKey, status: PairStatus) -> LinkResult<()> {
        for request in self.requests.write().values_mut() {
            if &request.sender_key == sender && &request.remote_key == remote {
                request.status = status;
            }
        }
        Ok(())
    }

    fn delete(&self, id: &PairingRequestId) -> LinkResult<bool> {
        Ok(self.requests.write().remove(id).is_some())
    }

    fn list(&self, key: &ProfileKey) -> LinkResult<Vec<PairingRequest>> {
        let mut requests: Vec<PairingRequest> = self
            .requests
            .read()
            .values()
            .filter(|r| &r.sender_key == key || &r.remote_key == key)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.id);
        Ok(requests)
    }
}

/// Retry queue that drops a message after `max_attempts` failures
#[derive(Debug, Clone)]
pub struct MemoryMessageQueue {
    pending: Arc<RwLock<HashMap<Ulid, QueuedMessage>>>,
    max_attempts: u32,
}

impl Default for MemoryMessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl MemoryMessageQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            max_attempts,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<QueuedMessage> {
        self.pending.read().get(id).cloned()
    }

    fn record_failure(pending: &RwLock<HashMap<Ulid, QueuedMessage>>, id: &Ulid, max_attempts: u32) {
        let mut pending = pending.write();
        let exhausted = match pending.get_mut(id) {
            Some(message) => {
                message.attempts += 1;
                message.attempts >= max_attempts
            }
            None => false,
        };
        if exhausted {
            warn!(message_id = %id, max_attempts, "Dropping queued message after repeated failures");
            pending.remove(id);
        }
    }
}

impl MessageQueue for MemoryMessageQueue {
    fn enqueue(&self, message: QueuedMessage) -> LinkResult<()> {
        debug!(message_id = %message.id, service = %message.service, "Message queued for retry");
        self.pending.write().insert(message.id, message);
        Ok(())
    }

    fn pending_messages(&self, owner: &ProfileKey) -> Vec<QueuedMessage> {
        let mut messages: Vec<QueuedMessage> = self
            .pending
            .read()
            .values()
            .filter(|m| &m.local_key == owner)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.id);
        messages
    }

    fn completion_listener(&self, message: &QueuedMessage) -> MsgFuture<()> {
        let future = MsgFuture::new();
        let pending = Arc::clone(&self.pending);
        let id = message.id;
        let max_attempts = self.max_attempts;
        future.on_complete(move |_, outcome| match outcome {
            Ok(()) => {
                debug!(message_id = %id, "Queued message delivered");
                pending.write().remove(&id);
            }
            Err(failure) => {
                debug!(message_id = %id, detail = %failure.detail, "Queued message resend failed");
                Self::record_failure(&pending, &id, max_attempts);
            }
        });
        future
    }

    fn failed_to_resend(&self, message: &QueuedMessage) {
        Self::record_failure(&self.pending, &message.id, self.max_attempts);
    }
}
