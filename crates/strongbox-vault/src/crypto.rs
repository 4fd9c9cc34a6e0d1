//! Key derivation, key verification and AES-256-GCM using the `ring` crate.
//!
//! This module provides the core cryptographic primitives for the vault:
//!
//! - **Key derivation**: PBKDF2-HMAC-SHA256 turns a passkey and a per-user
//!   salt into a 256-bit [`KeyMaterial`]. The iteration count is tunable via
//!   [`KdfConfig`].
//! - **Key verification**: the stored verifier is an HMAC-SHA256 of a fixed
//!   context string under the derived key. It proves knowledge of the key
//!   without revealing it, and is compared in constant time.
//! - **Encryption/decryption**: AES-256-GCM authenticated encryption with a
//!   random 96-bit nonce generated inside every [`encrypt`] call.
//! - **Random generation**: cryptographically secure bytes via `ring`.
//!
//! # Security Notes
//!
//! - Callers never choose nonces. With random 96-bit nonces the collision
//!   probability is negligible for up to ~2^32 encryptions under one key.
//! - [`KeyMaterial`] is zeroized when dropped and redacted in `Debug` output.

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::hmac;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::KdfConfig;
use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the per-user salt in bytes.
pub const SALT_LEN: usize = 32;

/// Shortest salt [`derive_key`] accepts.
pub const MIN_SALT_LEN: usize = 16;

/// Length of a key verifier in bytes (HMAC-SHA256 output).
pub const VERIFIER_LEN: usize = 32;

/// PBKDF2 algorithm: HMAC-SHA256.
static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// AES-256-GCM algorithm from `ring`.
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

/// Message signed by the derived key to produce its verifier. Changing this
/// invalidates every registered account.
const VERIFIER_CONTEXT: &[u8] = b"strongbox/key-verifier/v1";

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// A 256-bit symmetric key derived from a passkey.
///
/// The bytes are wiped from memory on drop. The key is never persisted; it
/// is re-derived from the passkey at every login.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Wrap raw key bytes.
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate a random key (not tied to any passkey).
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    /// Raw key bytes. Use only for immediate cryptographic operations.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations. Since we
/// generate a fresh random nonce per encryption call, this wrapper ensures
/// each sealing key is used exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Key derivation and verification
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from `passkey` and `salt` using PBKDF2-HMAC-SHA256.
///
/// Deterministic: the same passkey, salt and iteration count always yield
/// the same key. A different salt yields an unrelated key.
///
/// # Errors
///
/// Returns [`VaultError::InvalidInput`] for an empty passkey and
/// [`VaultError::KeyDerivationFailed`] for a short salt or zero iterations.
pub fn derive_key(passkey: &str, salt: &[u8], kdf: &KdfConfig) -> Result<KeyMaterial> {
    if passkey.is_empty() {
        return Err(VaultError::InvalidInput("passkey must not be empty".into()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(VaultError::KeyDerivationFailed {
            reason: format!("salt must be at least {MIN_SALT_LEN} bytes, got {}", salt.len()),
        });
    }
    let iterations = std::num::NonZeroU32::new(kdf.iterations).ok_or_else(|| {
        VaultError::KeyDerivationFailed {
            reason: "iteration count must be non-zero".into(),
        }
    })?;

    let mut bytes = [0u8; KEY_LEN];
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, passkey.as_bytes(), &mut bytes);

    tracing::trace!(iterations = kdf.iterations, "derived key from passkey");

    Ok(KeyMaterial::from_bytes(bytes))
}

/// Compute the verifier stored for `key`.
///
/// The verifier is `HMAC-SHA256(key, context)`. Recovering the key from it
/// would require breaking HMAC, so it can be stored next to the salt.
pub fn key_verifier(key: &KeyMaterial) -> [u8; VERIFIER_LEN] {
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    let tag = hmac::sign(&hmac_key, VERIFIER_CONTEXT);

    let mut out = [0u8; VERIFIER_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Check `key` against a stored verifier.
///
/// Uses constant-time comparison internally (via `ring::hmac::verify`).
pub fn verify_key(key: &KeyMaterial, verifier: &[u8]) -> bool {
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    hmac::verify(&hmac_key, VERIFIER_CONTEXT, verifier).is_ok()
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with AES-256-GCM under `key`, authenticating `aad`.
///
/// Returns `(nonce, ciphertext)` where `nonce` is a freshly generated 96-bit
/// value and `ciphertext` includes the 128-bit authentication tag.
///
/// # Errors
///
/// Returns [`VaultError::RandomUnavailable`] if no nonce can be generated,
/// or [`VaultError::EncryptionFailed`] if `ring` reports a failure.
pub fn encrypt(
    key: &KeyMaterial,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN_BYTES], Vec<u8>)> {
    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    fill_random(&mut nonce_bytes)?;

    let unbound_key =
        UnboundKey::new(AEAD_ALG, key.as_bytes()).map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        })?;

    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    // `ring` encrypts in-place and appends the authentication tag.
    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "encrypted data"
    );

    Ok((nonce_bytes, in_out))
}

/// Decrypt `ciphertext` (which includes the GCM tag) under `key`.
///
/// # Errors
///
/// Returns [`VaultError::AuthenticationFailure`] if the key is wrong, or the
/// ciphertext, nonce or `aad` differ from what was sealed. A nonce of the
/// wrong length is treated the same way.
pub fn decrypt(key: &KeyMaterial, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce: [u8; NONCE_LEN_BYTES] = nonce
        .try_into()
        .map_err(|_| VaultError::AuthenticationFailure)?;

    let unbound_key = UnboundKey::new(AEAD_ALG, key.as_bytes())
        .map_err(|_| VaultError::AuthenticationFailure)?;

    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::AuthenticationFailure)?;

    let result = plaintext.to_vec();
    in_out.zeroize();

    tracing::trace!(
        ciphertext_len = ciphertext.len(),
        plaintext_len = result.len(),
        "decrypted data"
    );

    Ok(result)
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate a fresh per-user salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt)?;
    Ok(salt)
}

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`VaultError::RandomUnavailable`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(buf)
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| VaultError::RandomUnavailable)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
