//! Vault configuration.
//!
//! [`VaultConfig`] controls where the vault persists its state, how expensive
//! key derivation is, and how the lockout guard reacts to failed logins.
//! Defaults come from the [`Default`] implementation, a builder-style API
//! customises individual fields, and [`VaultConfig::load`] reads a TOML file:
//!
//! ```toml
//! database_path = "data/strongbox.db"
//! session_ttl_secs = 3600
//!
//! [kdf]
//! iterations = 600000
//!
//! [lockout]
//! threshold = 3
//! policy = { mode = "timed", duration_secs = 300 }
//! ```

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// PBKDF2 iteration count recommended by OWASP (2023) for HMAC-SHA256.
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

/// Consecutive failures that lock an account.
pub const DEFAULT_LOCKOUT_THRESHOLD: u32 = 3;

/// Default lockout window, in seconds.
pub const DEFAULT_LOCKOUT_SECS: u64 = 300;

/// Default minimum passkey length, in characters.
pub const DEFAULT_MIN_PASSKEY_LEN: usize = 8;

/// Key-derivation work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// PBKDF2-HMAC-SHA256 iteration count.
    ///
    /// Default: **600 000**.
    pub iterations: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

/// How long an account stays locked once the threshold is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LockoutPolicy {
    /// Attempts are refused for a fixed window, then the account reopens on
    /// the next attempt.
    Timed { duration_secs: u64 },

    /// Attempts are refused until the account is explicitly unlocked.
    UntilUnlock,
}

impl LockoutPolicy {
    /// Length of the lockout window, or `None` for [`LockoutPolicy::UntilUnlock`].
    pub fn window(&self) -> Option<Duration> {
        match self {
            Self::Timed { duration_secs } => {
                let secs = i64::try_from(*duration_secs).unwrap_or(i64::MAX);
                Some(Duration::try_seconds(secs).unwrap_or(Duration::MAX))
            }
            Self::UntilUnlock => None,
        }
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::Timed {
            duration_secs: DEFAULT_LOCKOUT_SECS,
        }
    }
}

/// Lockout guard configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Consecutive failed attempts that move an account to `LOCKED`.
    ///
    /// Default: **3**.
    pub threshold: u32,

    /// What happens once the threshold is reached.
    ///
    /// Default: **timed, 300 seconds**.
    pub policy: LockoutPolicy,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_LOCKOUT_THRESHOLD,
            policy: LockoutPolicy::default(),
        }
    }
}

/// Top-level configuration for a [`Strongbox`](crate::Strongbox).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// SQLite file holding accounts, lockout state and entries. `None` keeps
    /// everything in memory.
    ///
    /// Default: **`None`**.
    pub database_path: Option<PathBuf>,

    /// Key derivation cost.
    pub kdf: KdfConfig,

    /// Failed-login handling.
    pub lockout: LockoutConfig,

    /// Absolute session lifetime in seconds, counted from login. Sessions
    /// older than this are treated as logged out however recently they
    /// were used.
    ///
    /// Default: **`None`** (sessions last until logout).
    pub session_ttl_secs: Option<u64>,

    /// Minimum passkey length accepted at registration.
    ///
    /// Default: **8**.
    pub min_passkey_len: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            kdf: KdfConfig::default(),
            lockout: LockoutConfig::default(),
            session_ttl_secs: None,
            min_passkey_len: DEFAULT_MIN_PASSKEY_LEN,
        }
    }
}

impl VaultConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from a TOML string and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded vault configuration");
        Ok(config)
    }

    /// Reject settings the guard or the KDF cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.kdf.iterations == 0 {
            return Err(VaultError::Config {
                reason: "kdf.iterations must be greater than zero".into(),
            });
        }
        if self.lockout.threshold == 0 {
            return Err(VaultError::Config {
                reason: "lockout.threshold must be greater than zero".into(),
            });
        }
        if self.min_passkey_len == 0 {
            return Err(VaultError::Config {
                reason: "min_passkey_len must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Session lifetime as a duration, if one is configured.
    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
    }

    /// Persist to the SQLite file at `path`.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the PBKDF2 iteration count.
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf.iterations = iterations;
        self
    }

    /// Set the number of consecutive failures that lock an account.
    pub fn with_lockout_threshold(mut self, threshold: u32) -> Self {
        self.lockout.threshold = threshold;
        self
    }

    /// Set the lockout policy.
    pub fn with_lockout_policy(mut self, policy: LockoutPolicy) -> Self {
        self.lockout.policy = policy;
        self
    }

    /// Expire sessions after `secs` seconds.
    pub fn with_session_ttl_secs(mut self, secs: u64) -> Self {
        self.session_ttl_secs = Some(secs);
        self
    }

    /// Set the minimum passkey length.
    pub fn with_min_passkey_len(mut self, len: usize) -> Self {
        self.min_passkey_len = len;
        self
    }
}
