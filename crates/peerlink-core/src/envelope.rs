//! Application message envelopes
//!
//! Everything sent over a call travels as an [`Envelope`]: a type tag plus an
//! opaque payload (the postcard encoding of the application object).
//!
//! ## Reserved types
//!
//! - `"init"` with an empty payload is the setup message sent by both sides
//!   right after a call is accepted.
//! - `"crypto"` carries a [`CryptoMsg`] proposing a cipher for the call. It is
//!   never sealed itself.
//!
//! ## Wire Format
//!
//! postcard encoding of `{ kind, payload, sealed }`. When `sealed` is set the
//! payload is the output of the call's cipher.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Type tag of the setup message.
pub const INIT_MSG_TYPE: &str = "init";

/// Type tag of the encryption negotiation message.
pub const CRYPTO_MSG_TYPE: &str = "crypto";

/// Typed message exchanged over a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag, resolved by the receiving application service
    pub kind: String,
    /// Serialized application object (sealed when `sealed` is set)
    pub payload: Vec<u8>,
    pub sealed: bool,
}

/// Body of a `"crypto"` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoMsg {
    /// Algorithm proposed by the call creator
    pub algo: String,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            sealed: false,
        }
    }

    /// The empty setup message.
    pub fn init() -> Self {
        Self::new(INIT_MSG_TYPE, Vec::new())
    }

    /// A negotiation envelope proposing `algo`.
    pub fn crypto(algo: impl Into<String>) -> LinkResult<Self> {
        Self::from_message(CRYPTO_MSG_TYPE, &CryptoMsg { algo: algo.into() })
    }

    /// Wrap an application object, serialized with postcard.
    pub fn from_message<M: Serialize>(kind: impl Into<String>, message: &M) -> LinkResult<Self> {
        Ok(Self::new(kind, postcard::to_allocvec(message)?))
    }

    /// Deserialize the payload as `M`.
    pub fn message<M: DeserializeOwned>(&self) -> LinkResult<M> {
        postcard::from_bytes(&self.payload).map_err(|e| {
            LinkError::EnvelopeDecode(format!("Invalid {} payload: {}", self.kind, e))
        })
    }

    pub fn is_init(&self) -> bool {
        self.payload.is_empty() && (self.kind == INIT_MSG_TYPE || self.kind.is_empty())
    }

    pub fn is_crypto(&self) -> bool {
        self.kind == CRYPTO_MSG_TYPE
    }

    /// Serialize for transmission.
    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Parse received bytes.
    pub fn decode(bytes: &[u8]) -> LinkResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| LinkError::EnvelopeDecode(e.to_string()))
    }

    /// Parse received bytes and check the type tag is one the receiver knows.
    ///
    /// The reserved `init` and `crypto` types are always accepted.
    pub fn decode_known(bytes: &[u8], known: &[&str]) -> LinkResult<Self> {
        let envelope = Self::decode(bytes)?;
        if envelope.is_init() || envelope.is_crypto() || known.contains(&envelope.kind.as_str()) {
            Ok(envelope)
        } else {
            Err(LinkError::EnvelopeDecode(format!(
                "Unknown message type: {}",
                envelope.kind
            )))
        }
    }
}
