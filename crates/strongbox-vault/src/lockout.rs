//! Failed-login tracking and temporary account denial.
//!
//! Each username is either `OPEN` (attempts allowed) or `LOCKED` (attempts
//! refused regardless of the passkey). The guard is consulted before any
//! passkey check and updated after it:
//!
//! | from     | event                               | to       |
//! |----------|-------------------------------------|----------|
//! | `OPEN`   | failure, count + 1 < threshold      | `OPEN`   |
//! | `OPEN`   | failure, count + 1 = threshold      | `LOCKED` |
//! | `OPEN`   | success                             | `OPEN` (count reset) |
//! | `LOCKED` | attempt before `locked_until`       | `LOCKED` (rejected unverified) |
//! | `LOCKED` | attempt at/after `locked_until`     | `OPEN` (count reset), attempt proceeds |
//! | `LOCKED` | [`LockoutGuard::unlock`]            | `OPEN` (count reset) |
//!
//! Under [`LockoutPolicy::UntilUnlock`] there is no `locked_until`, so only
//! an explicit unlock reopens the account. State lives in the `lockouts`
//! table and survives restarts.
//!
//! [`LockoutGuard::attempt`] runs check, verification and update as one
//! step: clones of a guard share an attempt lock, so concurrent callers can
//! never verify more passkeys than the threshold allows.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::LockoutConfig;
use crate::db::Database;
use crate::error::{Result, VaultError};

/// Lockout state of one account, as seen at a given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutStatus {
    pub username: String,
    /// Consecutive failures since the last success or reset.
    pub failed_attempts: u32,
    /// Whether attempts are currently refused.
    pub locked: bool,
    /// End of the lockout window; `None` while open or when locked until
    /// explicit unlock.
    pub locked_until: Option<DateTime<Utc>>,
    /// Failures left before the account locks (0 while locked).
    pub remaining_attempts: u32,
}

/// Tracks failed attempts per username and enforces the lockout policy.
#[derive(Clone)]
pub struct LockoutGuard {
    db: Database,
    config: LockoutConfig,
    clock: Arc<dyn Clock>,
    /// Held for the whole of [`attempt`](Self::attempt).
    attempts: Arc<Mutex<()>>,
}

impl LockoutGuard {
    /// Create a guard backed by `db`.
    pub fn new(db: Database, config: LockoutConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            config,
            clock,
            attempts: Arc::new(Mutex::new(())),
        }
    }

    /// The policy this guard enforces.
    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Gate an attempt for `username`.
    ///
    /// Returns `Ok(())` when the account is open. An account whose lockout
    /// window has elapsed is reopened with its counter reset before
    /// returning `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AccountLocked`] while the window is active.
    pub fn check(&self, username: &str) -> Result<()> {
        let now = self.clock.now();

        self.db.execute(|conn| {
            let Some(row) = load(conn, username)? else {
                return Ok(());
            };
            if !row.locked {
                return Ok(());
            }

            match row.locked_until {
                Some(until) if now >= until => {
                    reset(conn, username, now)?;
                    tracing::info!(username = username, "lockout window elapsed, account reopened");
                    Ok(())
                }
                locked_until => Err(VaultError::AccountLocked {
                    username: username.to_string(),
                    locked_until,
                }),
            }
        })
    }

    /// Record a failed attempt and return the resulting status.
    ///
    /// The failure that reaches the threshold locks the account.
    pub fn record_failure(&self, username: &str) -> Result<LockoutStatus> {
        let now = self.clock.now();
        let threshold = self.config.threshold;
        let window = self.config.policy.window();

        let status = self.db.execute(|conn| {
            let previous = load(conn, username)?;
            let mut attempts = match &previous {
                // A lock that already expired does not carry its count over.
                Some(row) if row.locked && row.locked_until.is_some_and(|until| now >= until) => 0,
                Some(row) => row.failed_attempts,
                None => 0,
            };
            attempts = attempts.saturating_add(1);

            let locked = attempts >= threshold;
            let locked_until = if locked {
                window.and_then(|w| now.checked_add_signed(w))
            } else {
                None
            };

            conn.execute(
                "INSERT INTO lockouts (username, failed_attempts, locked, locked_until, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(username) DO UPDATE SET
                     failed_attempts = excluded.failed_attempts,
                     locked = excluded.locked,
                     locked_until = excluded.locked_until,
                     updated_at = excluded.updated_at",
                params![
                    username,
                    attempts,
                    locked,
                    locked_until.map(|t| t.timestamp_millis()),
                    now.timestamp(),
                ],
            )?;

            Ok(self.status_from(username, attempts, locked, locked_until))
        })?;

        if status.locked {
            tracing::warn!(
                username = username,
                failed_attempts = status.failed_attempts,
                locked_until = ?status.locked_until,
                "account locked after repeated failures"
            );
        } else {
            tracing::debug!(
                username = username,
                failed_attempts = status.failed_attempts,
                "recorded failed attempt"
            );
        }

        Ok(status)
    }

    /// Reset the counter after a successful attempt.
    pub fn record_success(&self, username: &str) -> Result<()> {
        let now = self.clock.now();
        self.db.execute(|conn| reset(conn, username, now))
    }

    /// Explicitly reopen a locked account.
    pub fn unlock(&self, username: &str) -> Result<()> {
        let now = self.clock.now();
        self.db.execute(|conn| reset(conn, username, now))?;
        tracing::info!(username = username, "account unlocked");
        Ok(())
    }

    /// Run a passkey check for `username` under the lockout policy.
    ///
    /// The guard is consulted first; a locked account is refused without
    /// calling `verify`. Afterwards the counter is reset on success or
    /// advanced on [`VaultError::InvalidCredentials`]. Any other error
    /// leaves the state unchanged.
    ///
    /// Attempts through this guard or any clone of it run one at a time,
    /// so a failure is counted before the next caller passes the check.
    pub fn attempt<T>(&self, username: &str, verify: impl FnOnce() -> Result<T>) -> Result<T> {
        let _serial = self
            .attempts
            .lock()
            .map_err(|e| VaultError::Internal(format!("attempt lock poisoned: {e}")))?;

        self.check(username)?;

        match verify() {
            Ok(value) => {
                self.record_success(username)?;
                Ok(value)
            }
            Err(VaultError::InvalidCredentials) => {
                self.record_failure(username)?;
                Err(VaultError::InvalidCredentials)
            }
            Err(err) => Err(err),
        }
    }

    /// Current status of `username` without changing it.
    ///
    /// An elapsed lock is reported as open with its stale counter cleared,
    /// matching what the next [`check`](Self::check) would do.
    pub fn status(&self, username: &str) -> Result<LockoutStatus> {
        let now = self.clock.now();
        let row = self.db.execute(|conn| load(conn, username))?;

        Ok(match row {
            None => self.status_from(username, 0, false, None),
            Some(row) if row.locked && row.locked_until.is_some_and(|until| now >= until) => {
                self.status_from(username, 0, false, None)
            }
            Some(row) => self.status_from(username, row.failed_attempts, row.locked, row.locked_until),
        })
    }

    fn status_from(
        &self,
        username: &str,
        failed_attempts: u32,
        locked: bool,
        locked_until: Option<DateTime<Utc>>,
    ) -> LockoutStatus {
        let remaining_attempts = if locked {
            0
        } else {
            self.config.threshold.saturating_sub(failed_attempts)
        };
        LockoutStatus {
            username: username.to_string(),
            failed_attempts,
            locked,
            locked_until: if locked { locked_until } else { None },
            remaining_attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

struct LockoutRow {
    failed_attempts: u32,
    locked: bool,
    locked_until: Option<DateTime<Utc>>,
}

fn load(conn: &Connection, username: &str) -> Result<Option<LockoutRow>> {
    let row = conn
        .query_row(
            "SELECT failed_attempts, locked, locked_until FROM lockouts WHERE username = ?1",
            params![username],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()?;

    Ok(row.map(|(failed_attempts, locked, until_ms)| LockoutRow {
        failed_attempts,
        locked,
        locked_until: until_ms.and_then(DateTime::from_timestamp_millis),
    }))
}

fn reset(conn: &Connection, username: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE lockouts SET failed_attempts = 0, locked = 0, locked_until = NULL, updated_at = ?2
         WHERE username = ?1",
        params![username, now.timestamp()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LockoutPolicy;

    fn setup(policy: LockoutPolicy) -> (LockoutGuard, ManualClock) {
        let db = Database::open_in_memory().unwrap();
        db.execute(|conn| {
            conn.execute(
                "INSERT INTO users (username, salt, key_verifier, created_at, updated_at)
                 VALUES ('alice', x'00', x'00', 0, 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let clock = ManualClock::default();
        let config = LockoutConfig {
            threshold: 3,
            policy,
        };
        (LockoutGuard::new(db, config, Arc::new(clock.clone())), clock)
    }

    fn timed() -> LockoutPolicy {
        LockoutPolicy::Timed { duration_secs: 60 }
    }

    #[test]
    fn unknown_account_is_open() {
        let (guard, _) = setup(timed());
        guard.check("alice").unwrap();
        let status = guard.status("alice").unwrap();
        assert!(!status.locked);
        assert_eq!(status.remaining_attempts, 3);
    }

    #[test]
    fn failures_below_threshold_stay_open() {
        let (guard, _) = setup(timed());
        let s1 = guard.record_failure("alice").unwrap();
        let s2 = guard.record_failure("alice").unwrap();

        assert!(!s1.locked);
        assert!(!s2.locked);
        assert_eq!(s2.failed_attempts, 2);
        assert_eq!(s2.remaining_attempts, 1);
        guard.check("alice").unwrap();
    }

    #[test]
    fn reaching_threshold_locks() {
        let (guard, clock) = setup(timed());
        for _ in 0..3 {
            guard.record_failure("alice").unwrap();
        }

        let status = guard.status("alice").unwrap();
        assert!(status.locked);
        assert_eq!(status.remaining_attempts, 0);
        assert!(status.locked_until.unwrap() > clock.now());

        let result = guard.check("alice");
        assert!(matches!(result, Err(VaultError::AccountLocked { .. })));
    }

    #[test]
    fn success_resets_counter() {
        let (guard, _) = setup(timed());
        guard.record_failure("alice").unwrap();
        guard.record_failure("alice").unwrap();
        guard.record_success("alice").unwrap();

        let status = guard.record_failure("alice").unwrap();
        assert_eq!(status.failed_attempts, 1);
        assert!(!status.locked);
    }

    #[test]
    fn timed_lock_expires() {
        let (guard, clock) = setup(timed());
        for _ in 0..3 {
            guard.record_failure("alice").unwrap();
        }

        clock.advance(Duration::seconds(59));
        assert!(guard.check("alice").is_err());

        clock.advance(Duration::seconds(1));
        guard.check("alice").unwrap();

        let status = guard.status("alice").unwrap();
        assert!(!status.locked);
        assert_eq!(status.failed_attempts, 0);
    }

    #[test]
    fn failure_after_expiry_starts_a_new_count() {
        let (guard, clock) = setup(timed());
        for _ in 0..3 {
            guard.record_failure("alice").unwrap();
        }
        clock.advance(Duration::seconds(120));

        let status = guard.record_failure("alice").unwrap();
        assert_eq!(status.failed_attempts, 1);
        assert!(!status.locked);
    }

    #[test]
    fn until_unlock_never_expires() {
        let (guard, clock) = setup(LockoutPolicy::UntilUnlock);
        for _ in 0..3 {
            guard.record_failure("alice").unwrap();
        }

        clock.advance(Duration::days(365));
        match guard.check("alice") {
            Err(VaultError::AccountLocked { locked_until, .. }) => assert!(locked_until.is_none()),
            other => panic!("expected AccountLocked, got {other:?}"),
        }

        guard.unlock("alice").unwrap();
        guard.check("alice").unwrap();
    }

    #[test]
    fn attempt_skips_verification_while_locked() {
        let (guard, _) = setup(timed());
        for _ in 0..3 {
            let result: Result<()> = guard.attempt("alice", || Err(VaultError::InvalidCredentials));
            assert!(matches!(result, Err(VaultError::InvalidCredentials)));
        }

        let mut called = false;
        let result = guard.attempt("alice", || {
            called = true;
            Ok(())
        });
        assert!(matches!(result, Err(VaultError::AccountLocked { .. })));
        assert!(!called);
    }

    #[test]
    fn attempt_ignores_unrelated_errors() {
        let (guard, _) = setup(timed());
        let result: Result<()> = guard.attempt("alice", || Err(VaultError::NoActiveSession));
        assert!(matches!(result, Err(VaultError::NoActiveSession)));
        assert_eq!(guard.status("alice").unwrap().failed_attempts, 0);
    }

    #[test]
    fn concurrent_attempts_verify_at_most_threshold() {
        let (guard, _) = setup(timed());
        let verified = AtomicUsize::new(0);

        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..12)
                .map(|_| {
                    let guard = guard.clone();
                    let verified = &verified;
                    scope.spawn(move || {
                        guard.attempt("alice", || {
                            verified.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Err(VaultError::InvalidCredentials)
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(verified.load(Ordering::SeqCst), 3);
        let invalid = results
            .iter()
            .filter(|r| matches!(r, Err(VaultError::InvalidCredentials)))
            .count();
        let locked = results
            .iter()
            .filter(|r| matches!(r, Err(VaultError::AccountLocked { .. })))
            .count();
        assert_eq!((invalid, locked), (3, 9));
        assert!(guard.status("alice").unwrap().locked);
    }

    #[test]
    fn lock_state_survives_new_guard() {
        let (guard, clock) = setup(timed());
        for _ in 0..3 {
            guard.record_failure("alice").unwrap();
        }

        let reopened = LockoutGuard::new(guard.db.clone(), guard.config, Arc::new(clock));
        assert!(reopened.check("alice").is_err());
    }
}
