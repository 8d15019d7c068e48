//! Pluggable call encryption
//!
//! A call creator that asked for encryption proposes an algorithm by name in a
//! `"crypto"` envelope. Both sides resolve the name through their
//! [`CryptoProvider`]; the resulting [`CallCipher`] seals every later payload
//! on the call.
//!
//! The default provider knows a single algorithm, `"box"`: ChaCha20-Poly1305
//! under a key derived from both identity keys.

use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::{LinkError, LinkResult};
use crate::types::ProfileKey;

/// Name of the default algorithm.
pub const BOX_ALGO: &str = "box";

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Symmetric cipher bound to one call
pub trait CallCipher: Send + Sync {
    /// Algorithm name announced in the negotiation envelope
    fn name(&self) -> &str;

    fn seal(&self, plaintext: &[u8]) -> LinkResult<Vec<u8>>;

    fn open(&self, sealed: &[u8]) -> LinkResult<Vec<u8>>;
}

/// Resolves algorithm names to ciphers for a pair of identities
pub trait CryptoProvider: Send + Sync {
    /// Algorithm a creator proposes for encrypted calls
    fn default_algo(&self) -> &str;

    /// Build the cipher for `algo`, or `None` when the algorithm is unknown.
    fn negotiate(
        &self,
        algo: &str,
        local: &ProfileKey,
        remote: &ProfileKey,
    ) -> Option<Arc<dyn CallCipher>>;
}

/// ChaCha20-Poly1305 box
///
/// Output format: `[nonce (12 bytes)] + [ciphertext + tag]`
pub struct BoxCipher {
    cipher: ChaCha20Poly1305,
}

impl BoxCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }
}

impl CallCipher for BoxCipher {
    fn name(&self) -> &str {
        BOX_ALGO
    }

    fn seal(&self, plaintext: &[u8]) -> LinkResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| LinkError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> LinkResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(LinkError::Crypto(
                "Data too short to contain nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| LinkError::Crypto(format!("Decryption failed: {}", e)))
    }
}

/// Default provider: `"box"` keyed by BLAKE3 over both identity keys
///
/// Both ends derive the same key because the identity keys are sorted first.
/// An optional shared secret (e.g. from pairing) is mixed in.
#[derive(Debug, Clone, Default)]
pub struct DerivedKeyProvider {
    shared_secret: Option<[u8; 32]>,
}

impl DerivedKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared_secret(secret: [u8; 32]) -> Self {
        Self {
            shared_secret: Some(secret),
        }
    }

    /// BLAKE3("peerlink-call-box" || secret? || min(a, b) || max(a, b))
    pub fn derive_key(&self, a: &ProfileKey, b: &ProfileKey) -> [u8; 32] {
        let (first, second) = if a < b { (a, b) } else { (b, a) };

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"peerlink-call-box");
        if let Some(secret) = &self.shared_secret {
            hasher.update(secret);
        }
        hasher.update(first.as_bytes());
        hasher.update(second.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl CryptoProvider for DerivedKeyProvider {
    fn default_algo(&self) -> &str {
        BOX_ALGO
    }

    fn negotiate(
        &self,
        algo: &str,
        local: &ProfileKey,
        remote: &ProfileKey,
    ) -> Option<Arc<dyn CallCipher>> {
        match algo {
            BOX_ALGO => Some(Arc::new(BoxCipher::new(&self.derive_key(local, remote)))),
            _ => None,
        }
    }
}
