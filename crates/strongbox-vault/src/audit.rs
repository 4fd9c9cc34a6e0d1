//! Audit log of authentication and data-access events.
//!
//! Every security-relevant operation (registration, login attempts, lockout
//! rejections, data reads and writes, exports) is recorded in the
//! `audit_log` table with the username, the action, the affected label and
//! the outcome. Labels are recorded; values and passkeys never are.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Register,
    Login,
    Logout,
    Unlock,
    Store,
    Retrieve,
    Delete,
    Export,
    Import,
    ChangePasskey,
    DeleteAccount,
}

impl AuditAction {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Unlock => "unlock",
            Self::Store => "store",
            Self::Retrieve => "retrieve",
            Self::Delete => "delete",
            Self::Export => "export",
            Self::Import => "import",
            Self::ChangePasskey => "change_passkey",
            Self::DeleteAccount => "delete_account",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "register" => Some(Self::Register),
            "login" => Some(Self::Login),
            "logout" => Some(Self::Logout),
            "unlock" => Some(Self::Unlock),
            "store" => Some(Self::Store),
            "retrieve" => Some(Self::Retrieve),
            "delete" => Some(Self::Delete),
            "export" => Some(Self::Export),
            "import" => Some(Self::Import),
            "change_passkey" => Some(Self::ChangePasskey),
            "delete_account" => Some(Self::DeleteAccount),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation completed.
    Success,
    /// The operation failed (wrong passkey, authentication failure, ...).
    Failure,
    /// The operation was refused without being attempted (locked account).
    Denied,
}

impl AuditOutcome {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Database row ID.
    pub id: i64,

    /// The account involved.
    pub username: String,

    /// The action attempted.
    pub action: AuditAction,

    /// The vault label targeted (if any).
    pub label: Option<String>,

    /// How the attempt ended.
    pub outcome: AuditOutcome,

    /// Additional detail or context.
    pub detail: Option<String>,

    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Appends to and queries the `audit_log` table.
#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    /// Create an audit log backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an event.
    pub fn record(
        &self,
        username: &str,
        action: AuditAction,
        label: Option<&str>,
        outcome: AuditOutcome,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();

        self.db.execute(|conn| {
            conn.execute(
                "INSERT INTO audit_log (username, action, label, outcome, detail, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![username, action.as_str(), label, outcome.as_str(), detail, now],
            )?;
            Ok(())
        })?;

        tracing::trace!(
            username = username,
            action = %action,
            outcome = %outcome,
            "audit entry recorded"
        );

        Ok(())
    }

    /// Record an event, logging instead of failing if the write fails.
    ///
    /// Used after the audited operation has already taken effect, where an
    /// audit error must not replace the operation's own result.
    pub(crate) fn record_or_warn(
        &self,
        username: &str,
        action: AuditAction,
        label: Option<&str>,
        outcome: AuditOutcome,
        detail: Option<&str>,
    ) {
        if let Err(err) = self.record(username, action, label, outcome, detail) {
            tracing::warn!(
                username = username,
                action = %action,
                %err,
                "failed to write audit entry"
            );
        }
    }

    /// Query the audit log for `username`, most recent first.
    ///
    /// - `since`: only entries at or after this timestamp.
    /// - `limit`: maximum number of entries to return.
    pub fn query(
        &self,
        username: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let since_ts = since.map(|dt| dt.timestamp()).unwrap_or(0);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.db.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, action, label, outcome, detail, timestamp
                 FROM audit_log
                 WHERE username = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?3",
            )?;

            let entries = stmt
                .query_map(params![username, since_ts, limit], map_audit_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(entries)
        })
    }
}

/// Map a SQLite row to an [`AuditEntry`].
fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let action_str: String = row.get(2)?;
    let outcome_str: String = row.get(4)?;
    let ts: i64 = row.get(6)?;

    Ok(AuditEntry {
        id: row.get(0)?,
        username: row.get(1)?,
        action: AuditAction::parse(&action_str).unwrap_or(AuditAction::Login),
        label: row.get(3)?,
        outcome: AuditOutcome::parse(&outcome_str).unwrap_or(AuditOutcome::Failure),
        detail: row.get(5)?,
        timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_str() {
        for action in [
            AuditAction::Register,
            AuditAction::Login,
            AuditAction::Logout,
            AuditAction::Unlock,
            AuditAction::Store,
            AuditAction::Retrieve,
            AuditAction::Delete,
            AuditAction::Export,
            AuditAction::Import,
            AuditAction::ChangePasskey,
            AuditAction::DeleteAccount,
        ] {
            assert_eq!(AuditAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(AuditAction::parse("bogus"), None);
    }

    #[test]
    fn query_returns_most_recent_first() {
        let log = AuditLog::new(Database::open_in_memory().unwrap());

        log.record("alice", AuditAction::Login, None, AuditOutcome::Failure, None)
            .unwrap();
        log.record(
            "alice",
            AuditAction::Store,
            Some("secret_note"),
            AuditOutcome::Success,
            None,
        )
        .unwrap();
        log.record("bob", AuditAction::Login, None, AuditOutcome::Success, None)
            .unwrap();

        let entries = log.query("alice", None, 100).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::Store);
        assert_eq!(entries[0].label.as_deref(), Some("secret_note"));
        assert_eq!(entries[1].action, AuditAction::Login);
        assert_eq!(entries[1].outcome, AuditOutcome::Failure);
    }

    #[test]
    fn query_respects_limit() {
        let log = AuditLog::new(Database::open_in_memory().unwrap());
        for _ in 0..5 {
            log.record("alice", AuditAction::Retrieve, Some("x"), AuditOutcome::Success, None)
                .unwrap();
        }
        assert_eq!(log.query("alice", None, 3).unwrap().len(), 3);
    }
}
