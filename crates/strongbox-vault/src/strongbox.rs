//! The vault as a whole: accounts, lockout, the active session and the
//! encrypted entries behind one handle.

use std::sync::Arc;

use crate::audit::{AuditAction, AuditEntry, AuditLog, AuditOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::VaultConfig;
use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::error::{Result, VaultError};
use crate::export::{self, ExportBundle};
use crate::lockout::{LockoutGuard, LockoutStatus};
use crate::session::{Session, SessionManager};
use crate::vault::{DataVault, EntrySummary, VaultValue};

/// A local secure-storage vault.
///
/// Each instance owns its database handle, lockout guard and session, so
/// independent instances never share state. All methods take `&self`; the
/// type is `Send + Sync` and can be shared behind an `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use strongbox_vault::{Strongbox, VaultConfig};
///
/// # fn example() -> strongbox_vault::Result<()> {
/// let vault = Strongbox::open(VaultConfig::new().with_database_path("vault.db"))?;
///
/// vault.register_user("alice", "correct horse battery")?;
/// vault.login("alice", "correct horse battery")?;
///
/// vault.store_data("secret_note", "This is my secret note!")?;
/// vault.store_data(
///     "credit_card",
///     serde_json::json!({ "number": "1234-5678-9012-3456", "expiry": "12/25", "cvv": "123" }),
/// )?;
///
/// assert_eq!(vault.list_data_keys()?, vec!["credit_card", "secret_note"]);
/// vault.logout()?;
/// # Ok(())
/// # }
/// ```
pub struct Strongbox {
    config: VaultConfig,
    db: Database,
    credentials: CredentialStore,
    lockout: LockoutGuard,
    sessions: SessionManager,
    vault: DataVault,
    audit: AuditLog,
}

impl Strongbox {
    /// Open a vault with `config`, on disk when a database path is set and
    /// in memory otherwise.
    ///
    /// # Errors
    ///
    /// [`VaultError::Config`] for an unusable configuration, or a database
    /// error if the file cannot be opened or migrated.
    pub fn open(config: VaultConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`open`](Self::open) with an explicit time source.
    pub fn open_with_clock(config: VaultConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let db = match &config.database_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };

        let credentials = CredentialStore::new(db.clone(), config.kdf, config.min_passkey_len);
        let lockout = LockoutGuard::new(db.clone(), config.lockout, clock.clone());
        let audit = AuditLog::new(db.clone());
        let sessions = SessionManager::new(
            credentials.clone(),
            lockout.clone(),
            audit.clone(),
            clock,
            config.session_ttl(),
        );
        let vault = DataVault::new(db.clone());

        tracing::info!(
            persistent = config.database_path.is_some(),
            lockout_threshold = config.lockout.threshold,
            "strongbox opened"
        );

        Ok(Self {
            config,
            db,
            credentials,
            lockout,
            sessions,
            vault,
            audit,
        })
    }

    /// An in-memory vault with the default configuration.
    pub fn in_memory() -> Result<Self> {
        Self::open(VaultConfig::default())
    }

    /// The configuration this vault was opened with.
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    // -- Accounts -----------------------------------------------------------

    /// Register a new user.
    ///
    /// # Errors
    ///
    /// [`VaultError::AlreadyExists`] if the username is taken, or
    /// [`VaultError::InvalidInput`] for an unusable username or passkey.
    pub fn register_user(&self, username: &str, passkey: &str) -> Result<()> {
        let result = self.credentials.register(username, passkey);
        let outcome = outcome_of(&result);
        let detail = result.as_ref().err().map(ToString::to_string);
        self.audit.record_or_warn(
            username,
            AuditAction::Register,
            None,
            outcome,
            detail.as_deref(),
        );
        result
    }

    /// Log in, replacing any active session.
    ///
    /// # Errors
    ///
    /// [`VaultError::AccountLocked`], [`VaultError::InvalidCredentials`] or
    /// [`VaultError::UnknownUser`].
    pub fn login(&self, username: &str, passkey: &str) -> Result<()> {
        self.sessions.login(username, passkey)
    }

    /// Log out. Logging out without a session is a no-op.
    pub fn logout(&self) -> Result<()> {
        self.sessions.logout()
    }

    /// The logged-in username, if any.
    pub fn current_user(&self) -> Option<String> {
        self.sessions.current_user()
    }

    /// Change the passkey of the logged-in user.
    ///
    /// All entries are re-encrypted under the new key and the session
    /// continues with it. Exports made before the change can no longer be
    /// imported.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`], or the errors of a failed passkey
    /// check (wrong `old_passkey` counts toward the lockout).
    pub fn change_passkey(&self, old_passkey: &str, new_passkey: &str) -> Result<()> {
        self.sessions.with_session_mut(|session| {
            let username = session.username().to_string();
            let result = self.lockout.attempt(&username, || {
                self.credentials
                    .change_passkey(&username, old_passkey, new_passkey)
            });
            self.record(&username, AuditAction::ChangePasskey, None, &result);

            session.replace_key(result?);
            Ok(())
        })
    }

    /// Delete the logged-in user's account and every entry it owns, then
    /// end the session.
    ///
    /// The account's audit history goes with it. Only a refused deletion
    /// is audited, so nothing is left for a later owner of the name.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`], or the errors of a failed passkey
    /// check.
    pub fn delete_account(&self, passkey: &str) -> Result<()> {
        let username = self.sessions.with_session(|session| {
            let username = session.username().to_string();
            let result = self.lockout.attempt(&username, || {
                self.credentials.delete_account(&username, passkey)
            });
            if result.is_err() {
                self.record(&username, AuditAction::DeleteAccount, None, &result);
            }
            result.map(|()| username)
        })?;

        self.sessions.discard(&username)
    }

    /// Reopen a locked account.
    ///
    /// # Errors
    ///
    /// [`VaultError::UnknownUser`] if the username is not registered.
    pub fn unlock_user(&self, username: &str) -> Result<()> {
        self.ensure_registered(username)?;
        self.lockout.unlock(username)?;
        self.audit
            .record_or_warn(username, AuditAction::Unlock, None, AuditOutcome::Success, None);
        Ok(())
    }

    /// Lockout state of `username`.
    ///
    /// # Errors
    ///
    /// [`VaultError::UnknownUser`] if the username is not registered.
    pub fn lockout_status(&self, username: &str) -> Result<LockoutStatus> {
        self.ensure_registered(username)?;
        self.lockout.status(username)
    }

    // -- Data ---------------------------------------------------------------

    /// Encrypt and store `value` under `label` for the logged-in user.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`] if nobody is logged in.
    pub fn store_data(&self, label: &str, value: impl Into<VaultValue>) -> Result<()> {
        let value = value.into();
        self.audited(AuditAction::Store, Some(label), |session| {
            self.vault.store(session, label, &value)
        })
    }

    /// Decrypt and return the value stored under `label`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`], [`VaultError::NotFound`] or
    /// [`VaultError::AuthenticationFailure`].
    pub fn retrieve_data(&self, label: &str) -> Result<VaultValue> {
        self.audited(AuditAction::Retrieve, Some(label), |session| {
            self.vault.retrieve(session, label)
        })
    }

    /// Labels of the logged-in user's entries, sorted.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`] if nobody is logged in.
    pub fn list_data_keys(&self) -> Result<Vec<String>> {
        self.sessions
            .with_session(|session| self.vault.list_labels(session))
    }

    /// Metadata of the logged-in user's entries, sorted by label.
    pub fn list_entries(&self) -> Result<Vec<EntrySummary>> {
        self.sessions.with_session(|session| self.vault.entries(session))
    }

    /// Remove the entry stored under `label`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`] or [`VaultError::NotFound`].
    pub fn delete_data(&self, label: &str) -> Result<()> {
        self.audited(AuditAction::Delete, Some(label), |session| {
            self.vault.delete(session, label)
        })
    }

    /// Export every entry of the logged-in user after re-checking `passkey`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`], the errors of a failed passkey
    /// check, or [`VaultError::NothingToExport`].
    pub fn export_data(&self, passkey: &str) -> Result<ExportBundle> {
        self.audited(AuditAction::Export, None, |session| {
            self.sessions.confirm_passkey(session, passkey)?;
            export::export_entries(&self.db, session)
        })
    }

    /// Import a bundle made by [`export_data`](Self::export_data) after
    /// re-checking `passkey`. Returns the number of entries imported.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`], the errors of a failed passkey
    /// check, [`VaultError::InvalidExport`] or
    /// [`VaultError::AuthenticationFailure`].
    pub fn import_data(&self, bundle: &ExportBundle, passkey: &str) -> Result<usize> {
        self.audited(AuditAction::Import, None, |session| {
            self.sessions.confirm_passkey(session, passkey)?;
            export::import_entries(&self.db, session, bundle)
        })
    }

    /// Most recent audit entries of the logged-in user.
    ///
    /// # Errors
    ///
    /// [`VaultError::NoActiveSession`] if nobody is logged in.
    pub fn audit_log(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.sessions
            .with_session(|session| self.audit.query(session.username(), None, limit))
    }

    // -- internals ----------------------------------------------------------

    /// Run `f` against the active session and audit its outcome.
    fn audited<T>(
        &self,
        action: AuditAction,
        label: Option<&str>,
        f: impl FnOnce(&Session) -> Result<T>,
    ) -> Result<T> {
        self.sessions.with_session(|session| {
            let result = f(session);
            self.record(session.username(), action, label, &result);
            result
        })
    }

    fn record<T>(&self, username: &str, action: AuditAction, label: Option<&str>, result: &Result<T>) {
        let detail = result.as_ref().err().map(ToString::to_string);
        self.audit
            .record_or_warn(username, action, label, outcome_of(result), detail.as_deref());
    }

    fn ensure_registered(&self, username: &str) -> Result<()> {
        if self.credentials.exists(username)? {
            Ok(())
        } else {
            Err(VaultError::UnknownUser {
                username: username.to_string(),
            })
        }
    }
}

fn outcome_of<T>(result: &Result<T>) -> AuditOutcome {
    match result {
        Ok(_) => AuditOutcome::Success,
        Err(VaultError::AccountLocked { .. }) => AuditOutcome::Denied,
        Err(_) => AuditOutcome::Failure,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vault() -> Strongbox {
        Strongbox::open(VaultConfig::new().with_kdf_iterations(1_000)).unwrap()
    }

    #[test]
    fn strongbox_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Strongbox>();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = Strongbox::open(VaultConfig::new().with_lockout_threshold(0));
        assert!(matches!(result, Err(VaultError::Config { .. })));
    }

    #[test]
    fn data_operations_audit_labels_not_values() {
        let vault = vault();
        vault.register_user("alice", "correct horse").unwrap();
        vault.login("alice", "correct horse").unwrap();
        vault.store_data("note", "very secret value").unwrap();
        vault.retrieve_data("note").unwrap();
        let _ = vault.retrieve_data("missing");

        let entries = vault.audit_log(10).unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
        assert!(actions.contains(&AuditAction::Register));
        assert!(actions.contains(&AuditAction::Login));
        assert!(actions.contains(&AuditAction::Store));

        let missing = entries
            .iter()
            .find(|e| e.label.as_deref() == Some("missing"))
            .unwrap();
        assert_eq!(missing.outcome, AuditOutcome::Failure);

        for entry in &entries {
            assert!(
                !entry
                    .detail
                    .as_deref()
                    .unwrap_or_default()
                    .contains("very secret value")
            );
        }
    }

    #[test]
    fn change_passkey_keeps_data_readable() {
        let vault = vault();
        vault.register_user("alice", "correct horse").unwrap();
        vault.login("alice", "correct horse").unwrap();
        vault.store_data("card", json!({ "number": "1234" })).unwrap();

        assert!(matches!(
            vault.change_passkey("wrong passkey", "battery staple"),
            Err(VaultError::InvalidCredentials)
        ));
        vault.change_passkey("correct horse", "battery staple").unwrap();

        // The session carries on with the new key.
        assert_eq!(
            vault.retrieve_data("card").unwrap(),
            VaultValue::Structured(json!({ "number": "1234" }))
        );

        vault.logout().unwrap();
        assert!(matches!(
            vault.login("alice", "correct horse"),
            Err(VaultError::InvalidCredentials)
        ));
        vault.login("alice", "battery staple").unwrap();
        assert_eq!(vault.list_data_keys().unwrap(), vec!["card"]);
    }

    #[test]
    fn delete_account_ends_session() {
        let vault = vault();
        vault.register_user("alice", "correct horse").unwrap();
        vault.login("alice", "correct horse").unwrap();
        vault.store_data("note", "x").unwrap();

        vault.delete_account("correct horse").unwrap();
        assert_eq!(vault.current_user(), None);
        assert!(matches!(
            vault.login("alice", "correct horse"),
            Err(VaultError::UnknownUser { .. })
        ));
    }

    #[test]
    fn reregistered_name_starts_with_empty_history() {
        let vault = vault();
        vault.register_user("alice", "correct horse").unwrap();
        vault.login("alice", "correct horse").unwrap();
        vault.store_data("tax_return_2025", "x").unwrap();
        let _ = vault.delete_account("wrong passkey");
        vault.delete_account("correct horse").unwrap();

        vault.register_user("alice", "a new passkey").unwrap();
        vault.login("alice", "a new passkey").unwrap();

        let entries = vault.audit_log(100).unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&AuditAction::Register));
        assert!(actions.contains(&AuditAction::Login));
        assert!(entries.iter().all(|e| e.label.is_none()));
    }

    #[test]
    fn corrupted_entries_still_list() {
        let vault = vault();
        vault.register_user("alice", "correct horse").unwrap();
        vault.login("alice", "correct horse").unwrap();
        vault.store_data("secret_note", "This is my secret note!").unwrap();
        vault
            .store_data(
                "credit_card",
                json!({ "number": "1234-5678-9012-3456", "expiry": "12/25", "cvv": "123" }),
            )
            .unwrap();

        vault
            .db
            .execute(|conn| {
                conn.execute(
                    "UPDATE entries SET ciphertext = randomblob(48), nonce = zeroblob(12)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(
            vault.list_data_keys().unwrap(),
            vec!["credit_card", "secret_note"]
        );
        assert_eq!(vault.list_entries().unwrap().len(), 2);
        assert!(matches!(
            vault.retrieve_data("secret_note"),
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[test]
    fn unlock_and_status_require_registered_user() {
        let vault = vault();
        assert!(matches!(
            vault.unlock_user("ghost"),
            Err(VaultError::UnknownUser { .. })
        ));
        assert!(matches!(
            vault.lockout_status("ghost"),
            Err(VaultError::UnknownUser { .. })
        ));
    }
}
