//! Pairing request bookkeeping types

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{now_millis, ProfileKey};

/// Unique identifier for a pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairingRequestId(pub Ulid);

impl PairingRequestId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PairingRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PairingRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pair_{}", self.0)
    }
}

/// Pairing state between a local identity and a remote one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PairStatus {
    #[default]
    NotPaired,
    /// We sent a request and wait for the remote to answer
    WaitingForResponse,
    /// The remote sent us a request we have not answered yet
    WaitingForMyResponse,
    Paired,
    /// The request was declined
    Rejected,
}

impl PairStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            PairStatus::WaitingForResponse | PairStatus::WaitingForMyResponse
        )
    }
}

/// A pairing request, outgoing or incoming
///
/// `sender_*` is always the identity that initiated the request. For an
/// incoming request the local identity is therefore the `remote_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingRequest {
    pub id: PairingRequestId,
    pub sender_key: ProfileKey,
    pub sender_name: String,
    /// Home server host of the sender
    pub sender_host: String,
    pub remote_key: ProfileKey,
    /// Home server host of the remote identity
    pub remote_host: String,
    pub remote_name: Option<String>,
    pub status: PairStatus,
    /// Unix milliseconds when the request was created
    pub created_at: i64,
}

impl PairingRequest {
    /// Build an outgoing request from `sender` to `remote`.
    pub fn outgoing(
        sender_key: ProfileKey,
        sender_name: impl Into<String>,
        sender_host: impl Into<String>,
        remote_key: ProfileKey,
        remote_host: impl Into<String>,
    ) -> Self {
        Self {
            id: PairingRequestId::new(),
            sender_key,
            sender_name: sender_name.into(),
            sender_host: sender_host.into(),
            remote_key,
            remote_host: remote_host.into(),
            remote_name: None,
            status: PairStatus::WaitingForResponse,
            created_at: now_millis(),
        }
    }

    /// Build the record for a request received from `sender` by `local`.
    pub fn incoming(
        sender_key: ProfileKey,
        sender_name: impl Into<String>,
        sender_host: impl Into<String>,
        local_key: ProfileKey,
        local_host: impl Into<String>,
    ) -> Self {
        Self {
            status: PairStatus::WaitingForMyResponse,
            ..Self::outgoing(sender_key, sender_name, sender_host, local_key, local_host)
        }
    }

    pub fn with_remote_name(mut self, name: impl Into<String>) -> Self {
        self.remote_name = Some(name.into());
        self
    }

    /// Whether this request connects `a` and `b`, in either direction.
    pub fn involves(&self, a: &ProfileKey, b: &ProfileKey) -> bool {
        (&self.sender_key == a && &self.remote_key == b)
            || (&self.sender_key == b && &self.remote_key == a)
    }
}
