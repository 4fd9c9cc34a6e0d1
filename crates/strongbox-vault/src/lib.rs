//! Local secure storage for Strongbox.
//!
//! Users register with a username and passkey, log in to open a session,
//! and store text or structured values under labels. Every value is
//! encrypted at rest with AES-256-GCM under a key derived from the passkey
//! (PBKDF2-HMAC-SHA256 with a per-user salt). Neither the passkey nor the
//! key is ever persisted; the database only holds the salt and a one-way
//! verifier. Repeated failed logins lock the account for a configurable
//! window.
//!
//! # Modules
//!
//! - [`crypto`]: key derivation, key verifiers, AES-256-GCM.
//! - [`credentials`]: account registration and passkey verification.
//! - [`lockout`]: failed-attempt counting and account lockout.
//! - [`session`]: login, logout and the active session.
//! - [`vault`]: encrypted per-user entries.
//! - [`export`]: sealed export and import bundles.
//! - [`audit`]: audit log of security-relevant events.
//! - [`strongbox`]: the [`Strongbox`] facade tying them together.
//! - [`config`], [`clock`], [`db`], [`error`]: plumbing.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use strongbox_vault::{Strongbox, VaultConfig, VaultError, VaultValue};
//!
//! # fn example() -> strongbox_vault::Result<()> {
//! let vault = Strongbox::open(VaultConfig::load("strongbox.toml")?)?;
//!
//! vault.register_user("alice", "correct horse battery")?;
//! vault.login("alice", "correct horse battery")?;
//! vault.store_data("secret_note", "This is my secret note!")?;
//!
//! let note = vault.retrieve_data("secret_note")?;
//! assert_eq!(note, VaultValue::Text("This is my secret note!".into()));
//!
//! vault.logout()?;
//! assert!(matches!(
//!     vault.retrieve_data("secret_note"),
//!     Err(VaultError::NoActiveSession)
//! ));
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod export;
pub mod lockout;
mod migration;
pub mod session;
pub mod strongbox;
pub mod vault;

// Re-export the most commonly used types at the crate root for convenience.
pub use audit::{AuditAction, AuditEntry, AuditOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KdfConfig, LockoutConfig, LockoutPolicy, VaultConfig};
pub use db::Database;
pub use error::{Result, VaultError};
pub use export::ExportBundle;
pub use lockout::LockoutStatus;
pub use strongbox::Strongbox;
pub use vault::{EntrySummary, ValueKind, VaultValue};
