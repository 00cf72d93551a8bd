//! Per-message hybrid encryption.
//!
//! Wire form: `<base64 wrapped key>::<base64 nonce||ciphertext>`.
//!
//! The wrapped key is `ephemeral_public(32) || nonce(12) || AES-GCM(wrap_key, message_key)`
//! where `wrap_key = HKDF-SHA256(X25519(ephemeral, recipient))`.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::encrypt::{open, seal};
use crate::error::{CryptoError, Result};
use crate::keys::{KEY_LEN, KeyPair, generate_message_key};

/// Separates the wrapped key from the payload. Not in the base64 alphabet.
pub const DELIMITER: &str = "::";

const WRAP_CONTEXT: &[u8] = b"courier:message-key-wrap:v1";

fn derive_wrap_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    hkdf.expand(WRAP_CONTEXT, &mut out[..])
        .map_err(|_| CryptoError::InvalidKey("hkdf expand"))?;
    Ok(out)
}

/// Encrypt `message_key` so only the holder of `recipient`'s secret can read it.
pub fn wrap_key(recipient: &PublicKey, message_key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let wrap = derive_wrap_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.as_bytes(),
    )?;
    let sealed = seal(&wrap, message_key)?;

    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn unwrap_key(own: &KeyPair, wrapped: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if wrapped.len() <= 32 {
        return Err(CryptoError::Malformed("wrapped key too short"));
    }
    let (ephemeral_bytes, sealed) = wrapped.split_at(32);
    let ephemeral_public: [u8; 32] = ephemeral_bytes
        .try_into()
        .map_err(|_| CryptoError::Malformed("ephemeral key"))?;

    let shared = own.diffie_hellman(&PublicKey::from(ephemeral_public));
    let wrap = derive_wrap_key(
        shared.as_bytes(),
        &ephemeral_public,
        own.public_key().as_bytes(),
    )?;

    let key_bytes = Zeroizing::new(open(&wrap, sealed)?);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    if key_bytes.len() != KEY_LEN {
        return Err(CryptoError::Malformed("message key length"));
    }
    key.copy_from_slice(&key_bytes);
    Ok(key)
}

/// Encrypt `plaintext` for `recipient` with a one-time message key.
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<String> {
    let message_key = generate_message_key();
    let payload = seal(&message_key, plaintext)?;
    let wrapped = wrap_key(recipient, &message_key)?;

    Ok(format!(
        "{}{}{}",
        BASE64.encode(wrapped),
        DELIMITER,
        BASE64.encode(payload)
    ))
}

pub fn decrypt(envelope: &str, own: &KeyPair) -> Result<Vec<u8>> {
    let (wrapped_b64, payload_b64) = envelope
        .split_once(DELIMITER)
        .ok_or(CryptoError::Malformed("missing delimiter"))?;

    let wrapped = BASE64
        .decode(wrapped_b64)
        .map_err(|_| CryptoError::Malformed("wrapped key is not base64"))?;
    let payload = BASE64
        .decode(payload_b64)
        .map_err(|_| CryptoError::Malformed("payload is not base64"))?;

    let message_key = unwrap_key(own, &wrapped)?;
    open(&message_key, &payload)
}
