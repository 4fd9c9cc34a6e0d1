//! Versioned schema for the vault database.
//!
//! Each migration is applied once, in its own transaction, and recorded
//! in `_migrations`. Opening a database runs whatever is missing.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append only; versions must increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema: users, lockouts, entries",
        sql: r#"
            CREATE TABLE users (
                username     TEXT PRIMARY KEY,
                salt         BLOB NOT NULL,
                key_verifier BLOB NOT NULL,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );

            CREATE TABLE lockouts (
                username        TEXT PRIMARY KEY REFERENCES users(username) ON DELETE CASCADE,
                failed_attempts INTEGER NOT NULL DEFAULT 0 CHECK(failed_attempts >= 0),
                locked          INTEGER NOT NULL DEFAULT 0,
                locked_until    INTEGER, -- unix millis, NULL while open or until unlock
                updated_at      INTEGER NOT NULL
            );

            CREATE TABLE entries (
                owner      TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
                label      TEXT NOT NULL,
                type_tag   TEXT NOT NULL CHECK(type_tag IN ('text','structured')),
                ciphertext BLOB NOT NULL,
                nonce      BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (owner, label)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "audit log of authentication and data access",
        sql: r#"
            CREATE TABLE audit_log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                username  TEXT NOT NULL,
                action    TEXT NOT NULL,
                label     TEXT,
                outcome   TEXT NOT NULL CHECK(outcome IN ('success','failure','denied')),
                detail    TEXT,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX idx_audit_user_time ON audit_log(username, timestamp);
        "#,
    },
];

/// Bring `conn` up to the latest schema version.
pub fn run_all(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| failed(0, "create _migrations", e))?;

    let from = current_version(conn)?;
    let mut applied = 0usize;
    for migration in MIGRATIONS.iter().filter(|m| m.version > from) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = from, "vault schema current");
    } else {
        info!(from, to = current_version(conn)?, applied, "vault schema upgraded");
    }
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(|e| failed(0, "read schema version", e))
}

// ── internals ────────────────────────────────────────────────────────

fn failed(version: u32, step: &str, err: rusqlite::Error) -> VaultError {
    VaultError::MigrationFailed {
        version,
        reason: format!("{step}: {err}"),
    }
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    let version = migration.version;
    debug!(version, description = migration.description, "applying migration");

    // Only `&Connection` is available here, so the transaction is manual.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| failed(version, "begin", e))?;

    let outcome = conn
        .execute_batch(migration.sql)
        .map_err(|e| failed(version, "execute", e))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![version, migration.description, chrono::Utc::now().timestamp()],
            )
            .map_err(|e| failed(version, "record", e))
        });

    match outcome {
        Ok(_) => conn
            .execute_batch("COMMIT;")
            .map_err(|e| failed(version, "commit", e)),
        Err(err) => {
            warn!(version, %err, "migration rolled back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
