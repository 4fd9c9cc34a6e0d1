//! SQLite database handle shared by every vault component.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>`. Every read or write goes through [`Database::execute`] or
//! [`Database::execute_mut`], so at most one statement sequence touches the
//! database at a time and writes to the same `(owner, label)` never
//! interleave.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, VaultError};
use crate::migration;

/// Thread-safe handle to the vault database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path`, apply pragmas and run all
    /// pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening vault database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;
        migration::run_all(&conn)?;

        info!("vault database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a migrated in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory vault database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        migration::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection while holding the lock.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use strongbox_vault::Database;
    /// # fn example(db: &Database) -> strongbox_vault::Result<()> {
    /// let users: i64 = db.execute(|conn| {
    ///     Ok(conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?)
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("database mutex poisoned: {e}")))?;
        f(&conn)
    }

    /// Run a closure that needs `&mut Connection` (for transactions).
    pub fn execute_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("database mutex poisoned: {e}")))?;
        f(&mut conn)
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        debug!("applying SQLite pragmas");

        // WAL mode: readers do not block the writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // FULL sync: a committed entry survives power loss.
        conn.pragma_update(None, "synchronous", "FULL")?;

        // Overwrite deleted content instead of leaving it in free pages.
        conn.pragma_update(None, "secure_delete", "ON")?;

        // Temp tables and indices in memory, not on disk.
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Busy timeout so a second process waits instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_is_migrated() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn secure_delete_is_enabled() {
        let db = Database::open_in_memory().unwrap();
        let on: i64 = db
            .execute(|conn| Ok(conn.query_row("PRAGMA secure_delete", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(on, 1);
    }

    #[test]
    fn reopen_on_disk_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        {
            let db = Database::open(&path).unwrap();
            db.execute(|conn| {
                conn.execute(
                    "INSERT INTO users (username, salt, key_verifier, created_at, updated_at)
                     VALUES ('alice', x'00', x'00', 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }
}
