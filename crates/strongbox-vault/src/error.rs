//! Vault error types.
//!
//! Every public API in this crate returns [`VaultError`]. The first group of
//! variants is the caller-facing taxonomy (registration, login, session and
//! data access failures); the rest describe infrastructure failures that a
//! caller normally only reports.

use chrono::{DateTime, Utc};

/// Unified error type for the Strongbox vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Account and session errors -----------------------------------------
    /// A user with this name is already registered.
    #[error("user already exists: {username}")]
    AlreadyExists { username: String },

    /// No user with this name was ever registered.
    #[error("unknown user: {username}")]
    UnknownUser { username: String },

    /// The passkey did not match and the account is still open.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The account is inside its lockout window.
    ///
    /// `locked_until` is `None` when the account stays locked until it is
    /// explicitly unlocked.
    #[error("account locked: {username}")]
    AccountLocked {
        username: String,
        locked_until: Option<DateTime<Utc>>,
    },

    /// A vault operation was attempted without a logged-in user.
    #[error("no active session")]
    NoActiveSession,

    /// The active user has no entry under this label.
    #[error("entry not found: label={label}")]
    NotFound { label: String },

    // -- Crypto errors ------------------------------------------------------
    /// Authenticated decryption failed: wrong key, or the ciphertext, nonce
    /// or associated data was modified.
    #[error("authentication failure: ciphertext does not verify under this key")]
    AuthenticationFailure,

    /// Encryption failed (e.g. invalid key length, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Key derivation was given unusable parameters.
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    /// The system CSPRNG could not produce bytes.
    #[error("secure random source unavailable")]
    RandomUnavailable,

    // -- Input and transfer errors ------------------------------------------
    /// Invalid caller input (empty username, short passkey, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Export was requested for a user without any entries.
    #[error("no data to export")]
    NothingToExport,

    /// An import bundle is malformed or belongs to a different account.
    #[error("invalid export bundle: {reason}")]
    InvalidExport { reason: String },

    // -- Store errors -------------------------------------------------------
    /// Database schema migration failed.
    #[error("migration v{version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    /// The configuration could not be loaded.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration parse error.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error from the filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors (e.g. a poisoned lock).
    /// Prefer a typed variant whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_and_invalid_are_distinguishable() {
        let locked = VaultError::AccountLocked {
            username: "alice".into(),
            locked_until: None,
        };
        assert_ne!(locked.to_string(), VaultError::InvalidCredentials.to_string());
        assert!(locked.to_string().contains("alice"));
    }

    #[test]
    fn rusqlite_errors_convert() {
        let err: VaultError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, VaultError::Database(_)));
    }
}
