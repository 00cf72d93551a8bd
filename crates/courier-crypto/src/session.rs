use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};
use x25519_dalek::PublicKey;

use crate::error::{CryptoError, Result};
use crate::hybrid;
use crate::keys::{KeyPair, public_key_from_base64};

/// Outbound private payload, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub content: String,
    pub encrypted: bool,
}

/// Per-process encryption context: own keypair plus the public keys of every
/// peer seen so far. No CA, no revocation; the first key seen for a peer wins.
pub struct CryptoSession {
    keypair: KeyPair,
    peers: RwLock<HashMap<String, PublicKey>>,
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoSession {
    pub fn new() -> Self {
        Self {
            keypair: KeyPair::generate(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn public_key_base64(&self) -> String {
        self.keypair.public_key_base64()
    }

    /// Cache a peer's key on first contact. Returns `true` if it was newly stored.
    pub fn remember_peer(&self, identity: &str, public_key_b64: &str) -> Result<bool> {
        let key = public_key_from_base64(public_key_b64)?;
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.contains_key(identity) {
            return Ok(false);
        }
        debug!("Cached public key for {}", identity);
        peers.insert(identity.to_string(), key);
        Ok(true)
    }

    pub fn knows_peer(&self, identity: &str) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(identity)
    }

    fn peer_key(&self, identity: &str) -> Option<PublicKey> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .copied()
    }

    /// Encrypt for a known peer. Fails with `MissingPeerKey` if we never saw its key.
    pub fn encrypt_for(&self, peer: &str, plaintext: &str) -> Result<String> {
        let key = self
            .peer_key(peer)
            .ok_or_else(|| CryptoError::MissingPeerKey(peer.to_string()))?;
        hybrid::encrypt(plaintext.as_bytes(), &key)
    }

    /// Encrypt if possible, otherwise send in the clear with `encrypted = false`.
    pub fn seal_for(&self, peer: &str, plaintext: &str) -> Sealed {
        match self.encrypt_for(peer, plaintext) {
            Ok(content) => Sealed {
                content,
                encrypted: true,
            },
            Err(e) => {
                warn!("Sending to {} unencrypted: {}", peer, e);
                Sealed {
                    content: plaintext.to_string(),
                    encrypted: false,
                }
            }
        }
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let plaintext = hybrid::decrypt(envelope, &self.keypair)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed("plaintext is not UTF-8"))
    }
}
