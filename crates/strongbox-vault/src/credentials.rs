//! Registered accounts and passkey verification.
//!
//! For each username the store keeps a random salt and a key verifier,
//! never the passkey or the derived key. Verifying a passkey re-derives the
//! key from the stored salt and checks it against the verifier in constant
//! time; on success the derived key is handed back to the caller, which is
//! the only place it ever lives.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::KdfConfig;
use crate::crypto::{self, KeyMaterial, SALT_LEN};
use crate::db::Database;
use crate::error::{Result, VaultError};
use crate::vault;

/// Longest username accepted by [`CredentialStore::register`].
pub const MAX_USERNAME_LEN: usize = 256;

/// Passkey fed to the key derivation when the username is unknown, so the
/// response takes roughly as long as a real verification.
const DECOY_PASSKEY: &str = "strongbox-decoy-passkey";

/// Public record of a registered account. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub created_at: DateTime<Utc>,
    /// Last registration or passkey change.
    pub updated_at: DateTime<Utc>,
}

/// Salt and verifier of one account.
struct StoredCredential {
    salt: Vec<u8>,
    key_verifier: Vec<u8>,
}

/// Persists `{username, salt, key_verifier}` and checks passkeys against it.
#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
    kdf: KdfConfig,
    min_passkey_len: usize,
}

impl CredentialStore {
    /// Create a store backed by `db`.
    pub fn new(db: Database, kdf: KdfConfig, min_passkey_len: usize) -> Self {
        Self {
            db,
            kdf,
            min_passkey_len,
        }
    }

    /// Register `username` with `passkey`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidInput`] for an empty or over-long username, or
    ///   a passkey shorter than the configured minimum.
    /// - [`VaultError::AlreadyExists`] if the username is taken.
    #[instrument(skip(self, passkey))]
    pub fn register(&self, username: &str, passkey: &str) -> Result<()> {
        validate_username(username)?;
        self.validate_passkey(passkey)?;

        // Cheap rejection before paying for the key derivation.
        if self.exists(username)? {
            return Err(VaultError::AlreadyExists {
                username: username.to_string(),
            });
        }

        let salt = crypto::generate_salt()?;
        let key = crypto::derive_key(passkey, &salt, &self.kdf)?;
        let verifier = crypto::key_verifier(&key);
        let now = Utc::now().timestamp();

        self.db.execute(|conn| {
            // Re-check under the connection lock; a concurrent register may
            // have won the race while the key was being derived.
            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                params![username],
                |row| row.get(0),
            )?;
            if taken {
                return Err(VaultError::AlreadyExists {
                    username: username.to_string(),
                });
            }

            conn.execute(
                "INSERT INTO users (username, salt, key_verifier, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![username, salt.as_slice(), verifier.as_slice(), now],
            )?;
            Ok(())
        })?;

        tracing::info!(username = username, "registered user");
        Ok(())
    }

    /// Check `passkey` for `username` and return the derived key on match.
    ///
    /// # Errors
    ///
    /// - [`VaultError::UnknownUser`] if the username was never registered.
    /// - [`VaultError::InvalidCredentials`] if the passkey does not match.
    #[instrument(skip(self, passkey))]
    pub fn verify(&self, username: &str, passkey: &str) -> Result<KeyMaterial> {
        let Some(stored) = self.load(username)? else {
            self.decoy_derivation();
            return Err(VaultError::UnknownUser {
                username: username.to_string(),
            });
        };

        if passkey.is_empty() {
            self.decoy_derivation();
            return Err(VaultError::InvalidCredentials);
        }

        let key = crypto::derive_key(passkey, &stored.salt, &self.kdf)?;
        if crypto::verify_key(&key, &stored.key_verifier) {
            tracing::debug!(username = username, "passkey verified");
            Ok(key)
        } else {
            Err(VaultError::InvalidCredentials)
        }
    }

    /// Whether `username` is registered.
    pub fn exists(&self, username: &str) -> Result<bool> {
        self.db.execute(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                params![username],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Public record of `username`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::UnknownUser`] if the username is not registered.
    pub fn account(&self, username: &str) -> Result<Account> {
        let row = self.db.execute(|conn| {
            let row = conn
                .query_row(
                    "SELECT created_at, updated_at FROM users WHERE username = ?1",
                    params![username],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            Ok(row)
        })?;

        let (created_at, updated_at) = row.ok_or_else(|| VaultError::UnknownUser {
            username: username.to_string(),
        })?;

        Ok(Account {
            username: username.to_string(),
            created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
        })
    }

    /// Replace the passkey of `username` and return the newly derived key.
    ///
    /// Every entry the user owns is re-encrypted under the new key and the
    /// new salt and verifier are written in the same transaction, so the
    /// account is never left half re-keyed. Export bundles sealed under the
    /// old key can no longer be imported afterwards.
    ///
    /// # Errors
    ///
    /// Fails like [`verify`](Self::verify) for a wrong `old_passkey`, and
    /// with [`VaultError::InvalidInput`] if `new_passkey` is too short.
    #[instrument(skip(self, old_passkey, new_passkey))]
    pub fn change_passkey(
        &self,
        username: &str,
        old_passkey: &str,
        new_passkey: &str,
    ) -> Result<KeyMaterial> {
        let old_key = self.verify(username, old_passkey)?;
        self.validate_passkey(new_passkey)?;

        let salt = crypto::generate_salt()?;
        let new_key = crypto::derive_key(new_passkey, &salt, &self.kdf)?;
        let verifier = crypto::key_verifier(&new_key);
        let now = Utc::now().timestamp();

        let reencrypted = self.db.execute_mut(|conn| {
            let tx = conn.transaction()?;
            let count = vault::reencrypt_entries(&tx, username, &old_key, &new_key)?;
            tx.execute(
                "UPDATE users SET salt = ?1, key_verifier = ?2, updated_at = ?3
                 WHERE username = ?4",
                params![salt.as_slice(), verifier.as_slice(), now, username],
            )?;
            tx.commit()?;
            Ok(count)
        })?;

        tracing::info!(
            username = username,
            count = reencrypted,
            "changed passkey and re-encrypted entries"
        );
        Ok(new_key)
    }

    /// Remove `username` together with its lockout state and every entry
    /// it owns, after checking `passkey`.
    ///
    /// # Errors
    ///
    /// Fails like [`verify`](Self::verify) for a wrong passkey.
    #[instrument(skip(self, passkey))]
    pub fn delete_account(&self, username: &str, passkey: &str) -> Result<()> {
        self.verify(username, passkey)?;

        let removed = self.db.execute_mut(|conn| {
            let tx = conn.transaction()?;
            let entries = tx.execute("DELETE FROM entries WHERE owner = ?1", params![username])?;
            tx.execute("DELETE FROM lockouts WHERE username = ?1", params![username])?;
            tx.execute("DELETE FROM audit_log WHERE username = ?1", params![username])?;
            tx.execute("DELETE FROM users WHERE username = ?1", params![username])?;
            tx.commit()?;
            Ok(entries)
        })?;

        tracing::info!(username = username, count = removed, "deleted account");
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn load(&self, username: &str) -> Result<Option<StoredCredential>> {
        self.db.execute(|conn| {
            let row = conn
                .query_row(
                    "SELECT salt, key_verifier FROM users WHERE username = ?1",
                    params![username],
                    |row| {
                        Ok(StoredCredential {
                            salt: row.get(0)?,
                            key_verifier: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    fn decoy_derivation(&self) {
        let _ = crypto::derive_key(DECOY_PASSKEY, &[0u8; SALT_LEN], &self.kdf);
    }

    fn validate_passkey(&self, passkey: &str) -> Result<()> {
        if passkey.trim().is_empty() {
            return Err(VaultError::InvalidInput("passkey must not be blank".into()));
        }
        if passkey.chars().count() < self.min_passkey_len {
            return Err(VaultError::InvalidInput(format!(
                "passkey must be at least {} characters",
                self.min_passkey_len
            )));
        }
        Ok(())
    }
}

fn validate_username(username: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(VaultError::InvalidInput("username must not be empty".into()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(VaultError::InvalidInput(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
