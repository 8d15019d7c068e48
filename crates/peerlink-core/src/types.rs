//! Core types for Peerlink

pub mod pairing;
pub mod profile;
pub mod search;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{LinkError, LinkResult};

pub use pairing::{PairStatus, PairingRequest, PairingRequestId};
pub use profile::{Profile, ProfileInfo, ProfileUpdate, ServerEndpoint, Version};
pub use search::{ProfileQueryInfo, SearchQuery};

/// Size in bytes of an identity public key (Ed25519).
pub const PROFILE_KEY_SIZE: usize = 32;

/// Public key identifying a profile in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileKey(pub [u8; PROFILE_KEY_SIZE]);

impl ProfileKey {
    pub fn from_bytes(bytes: [u8; PROFILE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a byte slice of exactly `PROFILE_KEY_SIZE` bytes.
    pub fn from_slice(bytes: &[u8]) -> LinkResult<Self> {
        let arr: [u8; PROFILE_KEY_SIZE] = bytes.try_into().map_err(|_| {
            LinkError::Serialization(format!(
                "Profile key must be {} bytes, got {}",
                PROFILE_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PROFILE_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> LinkResult<Self> {
        let bytes = hex::decode(s).map_err(|e| LinkError::Serialization(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Locally generated identifier of a call
///
/// Uses ULID so ids sort by creation time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Ulid);

impl CallId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call_{}", self.0)
    }
}

/// Server-issued token identifying a call channel
///
/// The open-call table is keyed by the hex form of this token, which is also
/// what the server tags inbound application messages with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallToken(pub Vec<u8>);

impl CallToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> LinkResult<Self> {
        hex::decode(s)
            .map(Self)
            .map_err(|e| LinkError::Serialization(e.to_string()))
    }
}

impl std::fmt::Display for CallToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
