//! Persistence collaborators
//!
//! The engine does not own any on-disk format. It reads and writes through
//! these traits; [`memory`] holds in-memory implementations for embedding
//! applications without persistence and for tests.

pub mod memory;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::envelope::Envelope;
use crate::error::LinkResult;
use crate::futures::MsgFuture;
use crate::types::{now_millis, PairStatus, PairingRequest, PairingRequestId, ProfileInfo, ProfileKey};

pub use memory::{MemoryMessageQueue, MemoryPairingStore, MemoryProfileStore};

/// Remote profiles known to each local identity
pub trait ProfileStore: Send + Sync {
    fn get(&self, owner: &ProfileKey, key: &ProfileKey) -> LinkResult<Option<ProfileInfo>>;

    /// Insert or replace `info` in `owner`'s address book.
    fn save(&self, owner: &ProfileKey, info: &ProfileInfo) -> LinkResult<()>;

    /// Set the pairing status, creating a bare entry if `key` is unknown.
    fn update_paired(&self, owner: &ProfileKey, key: &ProfileKey, status: PairStatus) -> LinkResult<()>;

    fn list(&self, owner: &ProfileKey) -> LinkResult<Vec<ProfileInfo>>;
}

/// Pairing requests, outgoing and incoming
pub trait PairingStore: Send + Sync {
    fn save(&self, request: &PairingRequest) -> LinkResult<PairingRequestId>;

    fn get(&self, id: &PairingRequestId) -> LinkResult<Option<PairingRequest>>;

    /// The request sent by `sender` to `remote`, if any.
    fn find(&self, sender: &ProfileKey, remote: &ProfileKey) -> LinkResult<Option<PairingRequest>>;

    fn update_status(&self, sender: &ProfileKey, remote: &ProfileKey, status: PairStatus) -> LinkResult<()>;

    /// Returns whether a request was removed.
    fn delete(&self, id: &PairingRequestId) -> LinkResult<bool>;

    /// Every request `key` sent or received.
    fn list(&self, key: &ProfileKey) -> LinkResult<Vec<PairingRequest>>;
}

/// Outgoing application message waiting for redelivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Ulid,
    pub local_key: ProfileKey,
    pub remote_key: ProfileKey,
    pub service: String,
    pub kind: String,
    pub payload: Vec<u8>,
    /// Refresh the remote's service list before calling
    pub try_update_remote_services: bool,
    pub attempts: u32,
    pub queued_at: i64,
}

impl QueuedMessage {
    pub fn new(
        local_key: ProfileKey,
        remote_key: ProfileKey,
        service: impl Into<String>,
        envelope: &Envelope,
    ) -> Self {
        Self {
            id: Ulid::new(),
            local_key,
            remote_key,
            service: service.into(),
            kind: envelope.kind.clone(),
            payload: envelope.payload.clone(),
            try_update_remote_services: false,
            attempts: 0,
            queued_at: now_millis(),
        }
    }

    pub fn with_service_refresh(mut self) -> Self {
        self.try_update_remote_services = true;
        self
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.kind.clone(), self.payload.clone())
    }
}

/// Durable retry queue
///
/// The engine only attempts delivery and reports back; retry policy and
/// eviction belong to the queue.
pub trait MessageQueue: Send + Sync {
    fn enqueue(&self, message: QueuedMessage) -> LinkResult<()>;

    /// Messages of `owner` waiting for redelivery.
    fn pending_messages(&self, owner: &ProfileKey) -> Vec<QueuedMessage>;

    /// Correlator to pass to the resend; the queue settles the message from its outcome.
    fn completion_listener(&self, message: &QueuedMessage) -> MsgFuture<()>;

    /// The resend could not even be attempted (lookup or call failed).
    fn failed_to_resend(&self, message: &QueuedMessage);
}
