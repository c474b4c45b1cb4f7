use std::fmt;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::ChatError;
use crate::{ENVELOPE_OVERHEAD, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// AES-256-GCM with a 16-byte nonce, matching the `nonce(16) || tag(16)` envelope.
type EnvelopeCipher = AesGcm<Aes256, U16>;

/// One side's Curve25519 key pair for a single epoch.
///
/// The private scalar is consumed by [`KeyPair::derive_shared_key`], so a
/// fresh pair has to be generated for every handshake.
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyPair { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Multiply our scalar with the peer's point and keep the u-coordinate.
    pub fn derive_shared_key(self, peer_public: &PublicKey) -> SharedKey {
        let shared = self.secret.diffie_hellman(peer_public);
        SharedKey(*shared.as_bytes())
    }
}

/// Symmetric key for one epoch.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ChatError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| ChatError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: bytes.len(),
        })?;
        Ok(SharedKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

fn envelope_cipher(key: &[u8]) -> Result<EnvelopeCipher, ChatError> {
    EnvelopeCipher::new_from_slice(key).map_err(|_| ChatError::InvalidKeyLength {
        expected: KEY_SIZE,
        got: key.len(),
    })
}

/// Encrypt and authenticate `plaintext` under a fresh random nonce.
///
/// Returns `nonce || tag || ciphertext`.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, ChatError> {
    let cipher = envelope_cipher(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut ciphertext)
        .map_err(|_| ChatError::EncryptionFailed)?;

    let mut envelope = Vec::with_capacity(ENVELOPE_OVERHEAD + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&tag);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Split an envelope into nonce, tag and ciphertext and decrypt it.
///
/// A tag mismatch (tampering, or a key from another epoch) is reported as
/// [`ChatError::DecryptionFailed`] and never yields partial plaintext.
pub fn open(key: &[u8], envelope: &[u8]) -> Result<Vec<u8>, ChatError> {
    let cipher = envelope_cipher(key)?;

    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(ChatError::DecryptionFailed);
    }
    let (nonce, rest) = envelope.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let mut plaintext = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            &mut plaintext,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| ChatError::DecryptionFailed)?;

    Ok(plaintext)
}
