use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand_core::{OsRng, RngCore};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

pub const KEY_LEN: usize = 32;

/// Generate a random 256-bit key for AES-256-GCM.
/// Used for exactly one message, then dropped.
pub fn generate_message_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Encode a key to base64 for the wire.
pub fn key_to_base64(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Decode a base64 key.
pub fn key_from_base64(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidKey("not base64"))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("invalid key length"))
}

pub fn public_key_from_base64(encoded: &str) -> Result<PublicKey> {
    key_from_base64(encoded).map(PublicKey::from)
}

/// Long-lived X25519 keypair. One per process; the secret half never leaves it.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_key_base64(&self) -> String {
        key_to_base64(self.public.as_bytes())
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair(public={})", self.public_key_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_keys_are_fresh() {
        let a = generate_message_key();
        let b = generate_message_key();
        assert_ne!(*a, *b);
    }

    #[test]
    fn base64_roundtrip_and_length_check() {
        let pair = KeyPair::generate();
        let encoded = pair.public_key_base64();
        let decoded = public_key_from_base64(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), pair.public_key().as_bytes());

        assert_eq!(
            key_from_base64(&BASE64.encode([1u8; 16])),
            Err(CryptoError::InvalidKey("invalid key length"))
        );
        assert!(key_from_base64("***").is_err());
    }

    #[test]
    fn debug_hides_secret() {
        let pair = KeyPair::generate();
        let shown = format!("{:?}", pair);
        assert!(shown.contains(&pair.public_key_base64()));
    }
}
