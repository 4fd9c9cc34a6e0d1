//! The single authenticated session of a vault instance.
//!
//! A [`Session`] exists only between a successful login and the next
//! logout (or the end of its lifetime). It holds the key derived at login;
//! the key is never written anywhere and is wiped when the session drops.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

use crate::audit::{AuditAction, AuditLog, AuditOutcome};
use crate::clock::Clock;
use crate::credentials::CredentialStore;
use crate::crypto::KeyMaterial;
use crate::error::{Result, VaultError};
use crate::lockout::LockoutGuard;

/// An authenticated user and the key derived from their passkey.
#[derive(Debug)]
pub struct Session {
    username: String,
    key: KeyMaterial,
    started_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(username: impl Into<String>, key: KeyMaterial, started_at: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            key,
            started_at,
        }
    }

    /// The logged-in user.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The key derived at login.
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    /// When the login succeeded.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Swap in the key of a changed passkey. The old key is wiped.
    pub(crate) fn replace_key(&mut self, key: KeyMaterial) {
        self.key = key;
    }

    fn expired(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> bool {
        ttl.and_then(|ttl| self.started_at.checked_add_signed(ttl))
            .is_some_and(|end| now >= end)
    }
}

/// Runs logins through the lockout guard and owns the active session.
pub struct SessionManager {
    credentials: CredentialStore,
    lockout: LockoutGuard,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    ttl: Option<Duration>,
    active: Mutex<Option<Session>>,
}

impl SessionManager {
    /// Create a manager with no active session.
    ///
    /// `ttl` is an absolute lifetime counted from login; activity does not
    /// extend it. A session past it is treated as absent, and `None` keeps
    /// it until logout.
    pub fn new(
        credentials: CredentialStore,
        lockout: LockoutGuard,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            credentials,
            lockout,
            audit,
            clock,
            ttl,
            active: Mutex::new(None),
        }
    }

    /// Authenticate `username` and make it the active session.
    ///
    /// A successful login replaces any previous session. A failed one
    /// leaves the current session, if any, untouched.
    ///
    /// # Errors
    ///
    /// - [`VaultError::AccountLocked`] while the account is locked; the
    ///   passkey is not checked.
    /// - [`VaultError::InvalidCredentials`] for a wrong passkey, including
    ///   the attempt that triggers the lockout.
    /// - [`VaultError::UnknownUser`] if the username was never registered.
    #[instrument(skip(self, passkey))]
    pub fn login(&self, username: &str, passkey: &str) -> Result<()> {
        let result = self
            .lockout
            .attempt(username, || self.credentials.verify(username, passkey));

        let key = match result {
            Ok(key) => key,
            Err(err) => {
                self.audit_failed_login(username, &err);
                return Err(err);
            }
        };

        let session = Session::new(username, key, self.clock.now());
        let previous = self.lock()?.replace(session);

        if let Some(previous) = previous.filter(|p| p.username != username) {
            tracing::debug!(previous = %previous.username, "replaced session of another user");
        }
        self.audit
            .record_or_warn(username, AuditAction::Login, None, AuditOutcome::Success, None);
        tracing::info!(username = username, "login succeeded");
        Ok(())
    }

    /// End the active session. Calling it without one is a no-op.
    pub fn logout(&self) -> Result<()> {
        let previous = self.lock()?.take();

        if let Some(session) = previous {
            self.audit.record_or_warn(
                &session.username,
                AuditAction::Logout,
                None,
                AuditOutcome::Success,
                None,
            );
            tracing::info!(username = %session.username, "logged out");
        }
        Ok(())
    }

    /// Drop the session of `username`, if it is the active one, without
    /// recording a logout.
    pub(crate) fn discard(&self, username: &str) -> Result<()> {
        let mut guard = self.lock()?;
        if guard.as_ref().is_some_and(|s| s.username == username) {
            guard.take();
        }
        Ok(())
    }

    /// A copy of the active session's key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NoActiveSession`] when nobody is logged in.
    pub fn current_key(&self) -> Result<KeyMaterial> {
        self.with_session(|session| Ok(session.key.clone()))
    }

    /// The logged-in username, if any.
    pub fn current_user(&self) -> Option<String> {
        self.with_session(|session| Ok(session.username.clone())).ok()
    }

    /// Run `f` against the active session while holding the session lock,
    /// so a concurrent logout cannot pull the key out from under it.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NoActiveSession`] when nobody is logged in or
    /// the session has outlived its lifetime; otherwise whatever `f`
    /// returns.
    pub fn with_session<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        self.with_session_mut(|session| f(session))
    }

    /// Like [`with_session`](Self::with_session) with mutable access.
    pub(crate) fn with_session_mut<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;

        let now = self.clock.now();
        if guard.as_ref().is_some_and(|s| s.expired(now, self.ttl)) {
            if let Some(expired) = guard.take() {
                tracing::info!(username = %expired.username, "session expired");
            }
        }

        match guard.as_mut() {
            Some(session) => f(session),
            None => Err(VaultError::NoActiveSession),
        }
    }

    /// Re-check `passkey` for the user of `session` before a sensitive
    /// operation. Wrong passkeys count toward the lockout like failed
    /// logins.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidCredentials`] or [`VaultError::AccountLocked`].
    #[instrument(skip(self, session, passkey), fields(username = %session.username))]
    pub fn confirm_passkey(&self, session: &Session, passkey: &str) -> Result<()> {
        let username = session.username.as_str();
        self.lockout
            .attempt(username, || self.credentials.verify(username, passkey))
            .map(drop)
    }

    // -- internals ----------------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, Option<Session>>> {
        self.active
            .lock()
            .map_err(|e| VaultError::Internal(format!("session mutex poisoned: {e}")))
    }

    fn audit_failed_login(&self, username: &str, err: &VaultError) {
        match err {
            VaultError::AccountLocked { .. } => {
                self.audit.record_or_warn(
                    username,
                    AuditAction::Login,
                    None,
                    AuditOutcome::Denied,
                    Some("account locked"),
                );
                tracing::warn!(username = username, "login refused, account locked");
            }
            VaultError::InvalidCredentials => {
                let remaining = self
                    .lockout
                    .status(username)
                    .map(|s| s.remaining_attempts)
                    .unwrap_or(0);
                let detail = format!("invalid passkey, {remaining} attempts remaining");
                self.audit.record_or_warn(
                    username,
                    AuditAction::Login,
                    None,
                    AuditOutcome::Failure,
                    Some(&detail),
                );
                tracing::warn!(
                    username = username,
                    remaining_attempts = remaining,
                    "login failed"
                );
            }
            VaultError::UnknownUser { .. } => {
                self.audit.record_or_warn(
                    username,
                    AuditAction::Login,
                    None,
                    AuditOutcome::Failure,
                    Some("unknown user"),
                );
                tracing::warn!(username = username, "login for unknown user");
            }
            other => {
                tracing::error!(username = username, error = %other, "login aborted");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
